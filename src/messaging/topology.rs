use std::collections::HashMap;
use std::sync::Arc;

use lapin::options::ExchangeDeclareOptions;
use lapin::types::FieldTable;
use lapin::ExchangeKind;

use super::connection::RabbitMqConnection;
use super::errors::MessagingError;

// ============================================================================
// Topology Initializer
// ============================================================================
//
// Declares every exchange the system needs exactly once at process startup
// and returns the set of declared exchanges as a shared, read-only registry.
// The publisher validates exchange names against this registry instead of
// declaring exchanges itself, which keeps multiple publishers from fighting
// over exchange parameters.
//
// Exchange declaration is idempotent: re-declaring with identical
// parameters is not an error. A declaration failure is fatal to startup and
// is not retried here; process supervision owns that concern.
//
// ============================================================================

/// Topic exchange carrying all domain events destined for analytics.
pub const ANALYTICS_EVENTS_EXCHANGE: &str = "analytics.events";

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeConfig {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Registry of declared exchanges, the single source of truth for "is this
/// exchange valid to publish to". Built once by the initializer and shared
/// by `Arc`; never mutated afterwards.
#[derive(Debug, Default)]
pub struct Topology {
    exchanges: HashMap<String, ExchangeConfig>,
}

impl Topology {
    pub fn contains(&self, exchange_name: &str) -> bool {
        self.exchanges.contains_key(exchange_name)
    }

    pub fn get(&self, exchange_name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.get(exchange_name)
    }

    pub fn ensure_configured(&self, exchange_name: &str) -> Result<(), MessagingError> {
        if self.contains(exchange_name) {
            Ok(())
        } else {
            Err(MessagingError::ExchangeNotConfigured(exchange_name.to_string()))
        }
    }

    fn insert(&mut self, exchange: ExchangeConfig) {
        self.exchanges.insert(exchange.name.clone(), exchange);
    }

    #[cfg(test)]
    pub(crate) fn with_exchanges(exchanges: impl IntoIterator<Item = ExchangeConfig>) -> Self {
        let mut topology = Topology::default();
        for exchange in exchanges {
            topology.insert(exchange);
        }
        topology
    }
}

pub struct TopologyInitializer {
    connection: Arc<RabbitMqConnection>,
    exchanges: Vec<ExchangeConfig>,
}

impl TopologyInitializer {
    pub fn new(connection: Arc<RabbitMqConnection>) -> Self {
        Self {
            connection,
            // Every exchange the system publishes to, declared at startup.
            exchanges: vec![ExchangeConfig::topic(ANALYTICS_EVENTS_EXCHANGE)],
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeConfig) -> Self {
        self.exchanges.push(exchange);
        self
    }

    /// Declare all configured exchanges and return the populated registry.
    pub async fn start(&self) -> Result<Arc<Topology>, MessagingError> {
        let channel = self.connection.create_channel().await?;
        let mut topology = Topology::default();

        for exchange in &self.exchanges {
            channel
                .exchange_declare(
                    &exchange.name,
                    exchange.kind.clone(),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        auto_delete: exchange.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            tracing::info!(exchange = %exchange.name, kind = ?exchange.kind, "Exchange declared");
            topology.insert(exchange.clone());
        }

        tracing::info!(count = self.exchanges.len(), "All exchanges initialized");
        Ok(Arc::new(topology))
    }

    /// Nothing to tear down; declared topology outlives the process.
    pub fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_exchange_defaults() {
        let exchange = ExchangeConfig::topic("analytics.events");
        assert_eq!(exchange.name, "analytics.events");
        assert_eq!(exchange.kind, ExchangeKind::Topic);
        assert!(exchange.durable);
        assert!(!exchange.auto_delete);
    }

    #[test]
    fn test_registry_lookup() {
        let topology = Topology::with_exchanges([ExchangeConfig::topic("analytics.events")]);

        assert!(topology.contains("analytics.events"));
        assert!(topology.get("analytics.events").is_some());
        assert!(topology.ensure_configured("analytics.events").is_ok());
    }

    #[test]
    fn test_unconfigured_exchange_rejected() {
        let topology = Topology::with_exchanges([ExchangeConfig::topic("analytics.events")]);

        let result = topology.ensure_configured("orders.events");
        assert!(matches!(
            result,
            Err(MessagingError::ExchangeNotConfigured(name)) if name == "orders.events"
        ));
    }
}
