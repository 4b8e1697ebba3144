mod connection;
mod consumer;
mod dispatch;
mod errors;
mod publisher;
mod topology;

pub use connection::RabbitMqConnection;
pub use consumer::RabbitMqEventConsumer;
pub use dispatch::{DispatchOutcome, RetryDecision, RetryTracker, SubscriptionRegistry};
pub use errors::MessagingError;
pub use publisher::RabbitMqEventPublisher;
pub use topology::{ExchangeConfig, Topology, TopologyInitializer, ANALYTICS_EVENTS_EXCHANGE};
