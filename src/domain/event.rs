use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Domain Event Envelope
// ============================================================================
//
// Wraps an event payload with the metadata every published event carries:
// identity, aggregate reference, type discriminator, source and version.
//
// The wire shape uses PascalCase field names with the payload fields
// flattened into the same JSON object, so consumers can route on the
// top-level "EventType" field without decoding the full body.
//
// ============================================================================

/// Implemented by every concrete event payload.
///
/// `event_type()` is the routing discriminator and must equal the concrete
/// type's name; it is derived here, never set by callers.
pub trait EventPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn event_type() -> &'static str;
    fn aggregate_type() -> &'static str;
    fn event_version() -> &'static str {
        "1.0"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Source cannot be empty")]
    EmptySource,

    #[error("AggregateId cannot be nil")]
    NilAggregateId,

    #[error("CustomerId cannot be nil")]
    NilCustomerId,

    #[error("CustomerName cannot be empty")]
    EmptyCustomerName,
}

/// Immutable domain event. Construct via [`DomainEvent::new`]; all metadata
/// is generated or derived there and only readable afterwards.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct DomainEvent<P> {
    event_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    event_type: String,
    source: String,
    version: String,
    occurred_on: DateTime<Utc>,
    #[serde(flatten)]
    payload: P,
}

impl<P: EventPayload> DomainEvent<P> {
    pub fn new(source: impl Into<String>, aggregate_id: Uuid, payload: P) -> Result<Self, EventError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(EventError::EmptySource);
        }
        if aggregate_id.is_nil() {
            return Err(EventError::NilAggregateId);
        }

        Ok(Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: P::aggregate_type().to_string(),
            event_type: P::event_type().to_string(),
            source,
            version: P::event_version().to_string(),
            occurred_on: Utc::now(),
            payload,
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }
}
