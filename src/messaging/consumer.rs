use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tokio::sync::Mutex;

use crate::config::{RabbitMqConfig, RetryPolicy};
use crate::domain::{DomainEvent, EventPayload};
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};
use super::connection::RabbitMqConnection;
use super::dispatch::{DispatchOutcome, RetryDecision, RetryTracker, SubscriptionRegistry};
use super::errors::MessagingError;

// ============================================================================
// Event Consumer
// ============================================================================
//
// Connects with capped exponential backoff, declares the per-queue topology
// (including dead-lettering), and dispatches incoming messages to typed
// handlers with bounded retry.
//
// Delivery semantics are at-least-once: a failing handler gets its message
// requeued, so every registered handler must be idempotent. QoS prefetch=1
// keeps exactly one unacknowledged message in flight, which serializes
// handler execution per consumer instance and is the sole backpressure
// mechanism.
//
// Structurally broken messages (no discriminator, no handler, undecodable
// body) are acknowledged and dropped, never retried. A handler that keeps
// failing is retried up to the configured ceiling and then negative-
// acknowledged without requeue so the broker routes it to the queue's
// dead-letter pair.
//
// ============================================================================

pub struct RabbitMqEventConsumer {
    connection: Arc<RabbitMqConnection>,
    policy: RetryPolicy,
    registry: Arc<SubscriptionRegistry>,
    retries: Arc<RetryTracker>,
    metrics: Arc<Metrics>,
    state: Mutex<ConsumerState>,
}

#[derive(Default)]
struct ConsumerState {
    channel: Option<Channel>,
    bindings: Option<QueueBindings>,
    consumer_tag: Option<String>,
}

#[derive(Clone)]
struct QueueBindings {
    queue: String,
    exchange: String,
    routing_key: String,
}

impl RabbitMqEventConsumer {
    pub fn new(
        connection: Arc<RabbitMqConnection>,
        config: &RabbitMqConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connection,
            policy: config.retry_policy(),
            registry: Arc::new(SubscriptionRegistry::new()),
            retries: Arc::new(RetryTracker::new()),
            metrics,
            state: Mutex::new(ConsumerState::default()),
        }
    }

    /// Register `handler` for events whose discriminator equals `P`'s event
    /// type name. Safe to call concurrently with dispatch; each handler
    /// only ever sees its own decoded type.
    pub fn subscribe<P, F, Fut>(&self, handler: F)
    where
        P: EventPayload,
        F: Fn(DomainEvent<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register::<P, _, _>(handler);
        tracing::info!(event_type = P::event_type(), "Subscribed to event type");
    }

    /// Bring up the consumer channel and its queue topology, retrying with
    /// capped exponential backoff (5 attempts, 2s..10s). Exhaustion
    /// propagates the final attempt's error and leaves the consumer
    /// unusable; this is a fatal startup condition.
    pub async fn initialize_connection(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let bindings = QueueBindings {
            queue: queue_name.to_string(),
            exchange: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
        };

        let retry_config = RetryConfig::broker_connect();
        let max_attempts = retry_config.max_attempts;

        let result = retry_with_backoff(retry_config, |attempt| {
            let connection = self.connection.clone();
            let bindings = bindings.clone();
            let dead_letter_enabled = self.policy.dead_letter_enabled;
            async move {
                tracing::info!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    queue = %bindings.queue,
                    "Attempting to connect to RabbitMQ"
                );

                let channel = connection.create_channel().await?;
                match setup_queue_topology(&channel, &bindings, dead_letter_enabled).await {
                    Ok(()) => Ok(channel),
                    Err(e) if e.is_exchange_not_found() => {
                        // Expected race during cold start: the producer-side
                        // topology initializer may not have run yet.
                        tracing::info!(
                            attempt = attempt,
                            exchange = %bindings.exchange,
                            "Exchange not found, waiting for publisher to declare it"
                        );
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await;

        match result {
            RetryResult::Success(channel) => {
                let mut state = self.state.lock().await;
                state.channel = Some(channel);
                state.bindings = Some(bindings);
                tracing::info!(queue = queue_name, "Successfully connected to RabbitMQ");
                Ok(())
            }
            RetryResult::Failed(e) => {
                tracing::error!(
                    queue = queue_name,
                    max_attempts = max_attempts,
                    error = %e,
                    "Failed to connect to RabbitMQ after all attempts"
                );
                Err(e)
            }
        }
    }

    /// Open the broker consumer tag and spawn the dispatch loop. Starting
    /// twice, or before `initialize_connection`, is a warning no-op.
    pub async fn start_consuming(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;

        if state.consumer_tag.is_some() {
            tracing::warn!("Cannot start consuming, already consuming");
            return Ok(());
        }
        let (channel, bindings) = match (&state.channel, &state.bindings) {
            (Some(channel), Some(bindings)) => (channel.clone(), bindings.clone()),
            _ => {
                tracing::warn!("Cannot start consuming, connection not initialized");
                return Ok(());
            }
        };

        let queue = channel
            .queue_declare(
                &bindings.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(
            queue = %bindings.queue,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue ready for consumption"
        );

        let consumer = channel
            .basic_consume(
                &bindings.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer_tag = consumer.tag().to_string();
        state.consumer_tag = Some(consumer_tag.clone());

        let registry = self.registry.clone();
        let retries = self.retries.clone();
        let policy = self.policy.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            dispatch_loop(consumer, registry, retries, policy, metrics).await;
        });

        tracing::info!(
            queue = %bindings.queue,
            consumer_tag = %consumer_tag,
            "Started consuming messages"
        );
        Ok(())
    }

    /// Cancel the broker consumer tag. Future deliveries stop; an in-flight
    /// handler is not interrupted. Stopping while stopped is a warning
    /// no-op.
    pub async fn stop_consuming(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;

        let Some(consumer_tag) = state.consumer_tag.take() else {
            tracing::warn!("Cannot stop consuming, not currently consuming");
            return Ok(());
        };

        if let Some(channel) = &state.channel {
            channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await?;
        }

        tracing::info!(consumer_tag = %consumer_tag, "Stopped consuming messages");
        Ok(())
    }
}

/// Declare the queue topology on a fresh channel:
/// passive check of the source exchange, the `<queue>.dlx`/`<queue>.dlq`
/// dead-letter pair, the main queue pointing at that pair, the binding to
/// the source exchange, and prefetch=1.
async fn setup_queue_topology(
    channel: &Channel,
    bindings: &QueueBindings,
    dead_letter_enabled: bool,
) -> Result<(), MessagingError> {
    // The consumer never declares the source exchange; it only verifies it
    // exists. Absence is retryable via the connection state machine.
    channel
        .exchange_declare(
            &bindings.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    tracing::debug!(exchange = %bindings.exchange, "Source exchange exists, proceeding with queue setup");

    let mut queue_args = FieldTable::default();

    if dead_letter_enabled {
        let dlx = format!("{}.dlx", bindings.queue);
        let dlq = format!("{}.dlq", bindings.queue);

        channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(&dlq, &dlx, &dlq, QueueBindOptions::default(), FieldTable::default())
            .await?;

        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
        queue_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq.as_str().into()),
        );
    }

    channel
        .queue_declare(
            &bindings.queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..QueueDeclareOptions::default()
            },
            queue_args,
        )
        .await?;

    channel
        .queue_bind(
            &bindings.queue,
            &bindings.exchange,
            &bindings.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    tracing::info!(
        queue = %bindings.queue,
        exchange = %bindings.exchange,
        routing_key = %bindings.routing_key,
        dead_letter = dead_letter_enabled,
        "Queue declared and bound"
    );

    // One unacknowledged message in flight at a time.
    channel
        .basic_qos(1, BasicQosOptions { global: false })
        .await?;

    Ok(())
}

async fn dispatch_loop(
    mut deliveries: lapin::Consumer,
    registry: Arc<SubscriptionRegistry>,
    retries: Arc<RetryTracker>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                handle_delivery(delivery, &registry, &retries, &policy, &metrics).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Broker delivery error");
            }
        }
    }
    tracing::debug!("Delivery stream ended");
}

async fn handle_delivery(
    delivery: Delivery,
    registry: &SubscriptionRegistry,
    retries: &RetryTracker,
    policy: &RetryPolicy,
    metrics: &Metrics,
) {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| delivery.delivery_tag.to_string());

    tracing::debug!(
        message_id = %message_id,
        routing_key = %delivery.routing_key,
        "Received message"
    );

    match registry.dispatch(&delivery.data).await {
        DispatchOutcome::MissingDiscriminator => {
            tracing::warn!(
                message_id = %message_id,
                "Could not extract EventType from message, dropping"
            );
            metrics
                .messages_consumed
                .with_label_values(&["missing_discriminator"])
                .inc();
            settle(&delivery, Settlement::Ack).await;
        }
        DispatchOutcome::NoHandler(event_type) => {
            tracing::warn!(
                message_id = %message_id,
                event_type = %event_type,
                "No handler found for event type, dropping"
            );
            metrics
                .messages_consumed
                .with_label_values(&["no_handler"])
                .inc();
            settle(&delivery, Settlement::Ack).await;
        }
        DispatchOutcome::DecodeFailed { event_type, error } => {
            tracing::warn!(
                message_id = %message_id,
                event_type = %event_type,
                error = %error,
                "Failed to decode message body, dropping"
            );
            metrics
                .messages_consumed
                .with_label_values(&["decode_failed"])
                .inc();
            settle(&delivery, Settlement::Ack).await;
        }
        DispatchOutcome::Handled(event_type) => {
            retries.clear(&message_id);
            metrics
                .messages_consumed
                .with_label_values(&["handled"])
                .inc();
            settle(&delivery, Settlement::Ack).await;
            tracing::debug!(
                message_id = %message_id,
                event_type = %event_type,
                "Successfully processed message"
            );
        }
        DispatchOutcome::HandlerFailed { event_type, error } => {
            metrics
                .handler_failures
                .with_label_values(&[event_type.as_str()])
                .inc();

            match retries.record_failure(&message_id, policy) {
                RetryDecision::Requeue { attempt, max } => {
                    tracing::warn!(
                        message_id = %message_id,
                        event_type = %event_type,
                        error = %error,
                        attempt = attempt,
                        max_retries = max,
                        "Handler failed, requeueing message"
                    );
                    metrics.messages_requeued.inc();
                    settle(&delivery, Settlement::Requeue).await;
                }
                RetryDecision::DeadLetter { attempts } => {
                    tracing::error!(
                        message_id = %message_id,
                        event_type = %event_type,
                        error = %error,
                        attempts = attempts,
                        "Handler failed after all retries, moving to dead letter queue"
                    );
                    metrics.messages_dead_lettered.inc();
                    settle(&delivery, Settlement::DeadLetter).await;
                }
            }
        }
    }
}

enum Settlement {
    /// Remove from the queue.
    Ack,
    /// Negative-acknowledge with requeue; the broker redelivers.
    Requeue,
    /// Negative-acknowledge without requeue; the broker routes the message
    /// to the queue's configured dead-letter exchange.
    DeadLetter,
}

async fn settle(delivery: &Delivery, settlement: Settlement) {
    let result = match settlement {
        Settlement::Ack => delivery.ack(BasicAckOptions::default()).await,
        Settlement::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await
        }
        Settlement::DeadLetter => delivery.nack(BasicNackOptions::default()).await,
    };

    if let Err(e) = result {
        tracing::error!(
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Error acknowledging message"
        );
    }
}
