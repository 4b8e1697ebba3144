use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::{BoxFuture, FutureExt};
use serde::Deserialize;

use crate::config::RetryPolicy;
use crate::domain::{DomainEvent, EventPayload};

// ============================================================================
// Typed Dispatch & Retry Tracking
// ============================================================================
//
// The consumer routes each message by the "EventType" string in its body to
// an explicitly registered (decode, handle) pair. No reflection: every
// subscription stores a closure that decodes the wire body into its
// concrete event type and invokes the handler.
//
// Retry counts are tracked per message id in a process-local map. Entries
// are created on the first handler failure and removed on success or on
// reaching the retry ceiling, so counts do not survive a restart.
//
// ============================================================================

/// What happened to a single delivered message body.
pub enum DispatchOutcome {
    /// Body had no parseable "EventType" field.
    MissingDiscriminator,
    /// No handler registered for this event type.
    NoHandler(String),
    /// A handler exists but the body does not decode to its type.
    DecodeFailed {
        event_type: String,
        error: serde_json::Error,
    },
    /// Handler ran and succeeded.
    Handled(String),
    /// Handler ran and failed.
    HandlerFailed {
        event_type: String,
        error: anyhow::Error,
    },
}

enum HandlerFailure {
    Decode(serde_json::Error),
    Handler(anyhow::Error),
}

type DispatchFn =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), HandlerFailure>> + Send + Sync>;

/// Event-type name → boxed decode+handle closure. Registration is safe
/// concurrently with dispatch.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: RwLock<HashMap<String, DispatchFn>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P, F, Fut>(&self, handler: F)
    where
        P: EventPayload,
        F: Fn(DomainEvent<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let dispatch: DispatchFn = Arc::new(move |body: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let event: DomainEvent<P> =
                    serde_json::from_slice(&body).map_err(HandlerFailure::Decode)?;
                handler(event).await.map_err(HandlerFailure::Handler)
            }
            .boxed()
        });

        self.handlers
            .write()
            .expect("subscription registry lock poisoned")
            .insert(P::event_type().to_string(), dispatch);
    }

    pub fn dispatch(&self, body: &[u8]) -> BoxFuture<'static, DispatchOutcome> {
        let Some(event_type) = extract_event_type(body) else {
            return async { DispatchOutcome::MissingDiscriminator }.boxed();
        };

        let handler = self
            .handlers
            .read()
            .expect("subscription registry lock poisoned")
            .get(&event_type)
            .cloned();

        let Some(handler) = handler else {
            return async { DispatchOutcome::NoHandler(event_type) }.boxed();
        };

        let body = body.to_vec();
        async move {
            match handler(body).await {
                Ok(()) => DispatchOutcome::Handled(event_type),
                Err(HandlerFailure::Decode(error)) => {
                    DispatchOutcome::DecodeFailed { event_type, error }
                }
                Err(HandlerFailure::Handler(error)) => {
                    DispatchOutcome::HandlerFailed { event_type, error }
                }
            }
        }
        .boxed()
    }
}

#[derive(Deserialize)]
struct Discriminator {
    #[serde(rename = "EventType")]
    event_type: Option<String>,
}

/// Tolerant partial parse of the discriminator field. Unrelated schema
/// differences are ignored; any failure yields `None`, never an error.
pub fn extract_event_type(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Discriminator>(body)
        .ok()
        .and_then(|d| d.event_type)
        .filter(|event_type| !event_type.is_empty())
}

/// Terminal decision for a message whose handler failed.
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// Negative-acknowledge with requeue; the broker redelivers.
    Requeue { attempt: u32, max: u32 },
    /// Negative-acknowledge without requeue; the broker dead-letters.
    DeadLetter { attempts: u32 },
}

/// Per-message-id failure counts.
#[derive(Default)]
pub struct RetryTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one handler failure and decide between requeue and
    /// dead-letter. The counter is dropped once the decision is terminal.
    pub fn record_failure(&self, message_id: &str, policy: &RetryPolicy) -> RetryDecision {
        let mut counts = self.counts.lock().expect("retry tracker lock poisoned");

        if !policy.enable_retry || !policy.requeue_on_error {
            counts.remove(message_id);
            return RetryDecision::DeadLetter { attempts: 1 };
        }

        let count = counts.entry(message_id.to_string()).or_insert(0);
        *count += 1;
        let attempts = *count;

        if attempts >= policy.max_retries {
            counts.remove(message_id);
            RetryDecision::DeadLetter { attempts }
        } else {
            RetryDecision::Requeue {
                attempt: attempts,
                max: policy.max_retries,
            }
        }
    }

    /// Forget a message after successful processing.
    pub fn clear(&self, message_id: &str) {
        self.counts
            .lock()
            .expect("retry tracker lock poisoned")
            .remove(message_id);
    }

    pub fn pending_attempts(&self, message_id: &str) -> Option<u32> {
        self.counts
            .lock()
            .expect("retry tracker lock poisoned")
            .get(message_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CustomerCreatedEvent;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn customer_created_body() -> Vec<u8> {
        let customer_id = Uuid::new_v4();
        let payload = CustomerCreatedEvent::new(customer_id, "Jan Kowalski").unwrap();
        let event = DomainEvent::new("MainApi", customer_id, payload).unwrap();
        serde_json::to_vec(&event).unwrap()
    }

    #[test]
    fn test_extract_event_type() {
        assert_eq!(
            extract_event_type(br#"{"EventType":"CustomerCreatedEvent","Other":1}"#),
            Some("CustomerCreatedEvent".to_string())
        );
        assert_eq!(extract_event_type(br#"{"Something":"else"}"#), None);
        assert_eq!(extract_event_type(br#"{"EventType":""}"#), None);
        assert_eq!(extract_event_type(b"not json at all"), None);
    }

    #[tokio::test]
    async fn test_dispatch_without_discriminator_invokes_no_handler() {
        let registry = SubscriptionRegistry::new();
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        registry.register::<CustomerCreatedEvent, _, _>(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let outcome = registry.dispatch(br#"{"no":"discriminator"}"#).await;
        assert!(matches!(outcome, DispatchOutcome::MissingDiscriminator));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_event_type() {
        let registry = SubscriptionRegistry::new();
        let outcome = registry.dispatch(br#"{"EventType":"UnknownEvent"}"#).await;
        assert!(matches!(outcome, DispatchOutcome::NoHandler(name) if name == "UnknownEvent"));
    }

    #[tokio::test]
    async fn test_dispatch_decode_failure() {
        let registry = SubscriptionRegistry::new();
        registry.register::<CustomerCreatedEvent, _, _>(|_event| async { Ok(()) });

        // Discriminator routes to the handler but the body is missing the
        // envelope fields, so decoding the concrete type fails.
        let outcome = registry
            .dispatch(br#"{"EventType":"CustomerCreatedEvent"}"#)
            .await;
        assert!(matches!(outcome, DispatchOutcome::DecodeFailed { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_with_decoded_event() {
        let registry = SubscriptionRegistry::new();
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        registry.register::<CustomerCreatedEvent, _, _>(move |event| {
            let counter = counter.clone();
            async move {
                assert_eq!(event.payload().customer_name, "Jan Kowalski");
                assert_eq!(event.source(), "MainApi");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = registry.dispatch(&customer_created_body()).await;
        assert!(matches!(outcome, DispatchOutcome::Handled(name) if name == "CustomerCreatedEvent"));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_reports_handler_failure() {
        let registry = SubscriptionRegistry::new();
        registry.register::<CustomerCreatedEvent, _, _>(|_event| async {
            Err(anyhow::anyhow!("downstream unavailable"))
        });

        let outcome = registry.dispatch(&customer_created_body()).await;
        assert!(matches!(outcome, DispatchOutcome::HandlerFailed { .. }));
    }

    #[test]
    fn test_retry_until_success_clears_counter() {
        let tracker = RetryTracker::new();
        let policy = RetryPolicy::default();

        // Two failures stay below the ceiling of 3.
        assert_eq!(
            tracker.record_failure("msg-1", &policy),
            RetryDecision::Requeue { attempt: 1, max: 3 }
        );
        assert_eq!(
            tracker.record_failure("msg-1", &policy),
            RetryDecision::Requeue { attempt: 2, max: 3 }
        );
        assert_eq!(tracker.pending_attempts("msg-1"), Some(2));

        // Third attempt succeeds; the counter is gone.
        tracker.clear("msg-1");
        assert_eq!(tracker.pending_attempts("msg-1"), None);
    }

    #[test]
    fn test_retry_exhaustion_dead_letters() {
        let tracker = RetryTracker::new();
        let policy = RetryPolicy::default();

        assert!(matches!(
            tracker.record_failure("msg-2", &policy),
            RetryDecision::Requeue { attempt: 1, .. }
        ));
        assert!(matches!(
            tracker.record_failure("msg-2", &policy),
            RetryDecision::Requeue { attempt: 2, .. }
        ));
        assert_eq!(
            tracker.record_failure("msg-2", &policy),
            RetryDecision::DeadLetter { attempts: 3 }
        );
        // Terminal outcome removed the counter.
        assert_eq!(tracker.pending_attempts("msg-2"), None);
    }

    #[test]
    fn test_requeue_disabled_dead_letters_immediately() {
        let tracker = RetryTracker::new();
        let policy = RetryPolicy {
            requeue_on_error: false,
            ..RetryPolicy::default()
        };

        assert_eq!(
            tracker.record_failure("msg-3", &policy),
            RetryDecision::DeadLetter { attempts: 1 }
        );
    }

    #[test]
    fn test_retry_disabled_dead_letters_immediately() {
        let tracker = RetryTracker::new();
        let policy = RetryPolicy {
            enable_retry: false,
            ..RetryPolicy::default()
        };

        assert_eq!(
            tracker.record_failure("msg-4", &policy),
            RetryDecision::DeadLetter { attempts: 1 }
        );
    }

    #[test]
    fn test_counters_are_tracked_per_message() {
        let tracker = RetryTracker::new();
        let policy = RetryPolicy::default();

        tracker.record_failure("msg-a", &policy);
        tracker.record_failure("msg-a", &policy);
        tracker.record_failure("msg-b", &policy);

        assert_eq!(tracker.pending_attempts("msg-a"), Some(2));
        assert_eq!(tracker.pending_attempts("msg-b"), Some(1));
    }
}
