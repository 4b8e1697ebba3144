use std::sync::Arc;

use chrono::Utc;
use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};

use crate::domain::{DomainEvent, EventPayload};
use crate::metrics::Metrics;
use super::connection::RabbitMqConnection;
use super::errors::MessagingError;
use super::topology::Topology;

// ============================================================================
// Event Publisher
// ============================================================================
//
// Serializes a domain event to its JSON wire shape and publishes it to an
// exchange that the topology initializer has declared. Publishing to an
// unknown exchange is a configuration error; the publisher never declares
// exchanges itself.
//
// One network write per call, no buffering and no internal retry; a broker
// write failure is the caller's to handle.
//
// ============================================================================

pub struct RabbitMqEventPublisher {
    channel: Channel,
    topology: Arc<Topology>,
    metrics: Arc<Metrics>,
}

impl RabbitMqEventPublisher {
    pub async fn new(
        connection: &RabbitMqConnection,
        topology: Arc<Topology>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, MessagingError> {
        Ok(Self {
            channel: connection.create_channel().await?,
            topology,
            metrics,
        })
    }

    /// Publish one event. The message is persistent, carries the event id
    /// as message-id, the publish time as timestamp, and mirrors
    /// EventType/Source/Version in headers so consumers can filter without
    /// decoding the body.
    pub async fn publish<P: EventPayload>(
        &self,
        event: &DomainEvent<P>,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        if let Err(e) = self.topology.ensure_configured(exchange_name) {
            tracing::error!(
                exchange = exchange_name,
                event_type = event.event_type(),
                "Refusing to publish to unconfigured exchange"
            );
            return Err(e);
        }

        let body = serde_json::to_vec(event)?;

        let mut headers = FieldTable::default();
        headers.insert("EventType".into(), AMQPValue::LongString(event.event_type().into()));
        headers.insert("Source".into(), AMQPValue::LongString(event.source().into()));
        headers.insert("Version".into(), AMQPValue::LongString(event.version().into()));

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_message_id(event.event_id().to_string().into())
            .with_timestamp(Utc::now().timestamp() as u64)
            .with_headers(headers);

        self.channel
            .basic_publish(
                exchange_name,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        self.metrics
            .events_published
            .with_label_values(&[event.event_type()])
            .inc();

        tracing::info!(
            event_type = event.event_type(),
            event_id = %event.event_id(),
            exchange = exchange_name,
            routing_key = routing_key,
            "Event published"
        );

        Ok(())
    }

    /// Declared on the publishing interface but not implemented in this
    /// reference design; callers get a typed error instead of a silent
    /// partial publish.
    pub async fn publish_batch<P: EventPayload>(
        &self,
        _events: &[DomainEvent<P>],
    ) -> Result<(), MessagingError> {
        Err(MessagingError::Unimplemented("batch publish"))
    }
}
