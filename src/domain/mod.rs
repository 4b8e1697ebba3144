pub mod event;
pub mod events;

pub use event::{DomainEvent, EventError, EventPayload};
pub use events::{CustomerCreatedEvent, OrderCreatedEvent};
