use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{EventError, EventPayload};

// ============================================================================
// Concrete Domain Events
// ============================================================================

/// Published by the main API when a customer registration completes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CustomerCreatedEvent {
    pub customer_id: Uuid,
    pub customer_name: String,
}

impl CustomerCreatedEvent {
    pub fn new(customer_id: Uuid, customer_name: impl Into<String>) -> Result<Self, EventError> {
        if customer_id.is_nil() {
            return Err(EventError::NilCustomerId);
        }
        let customer_name = customer_name.into();
        if customer_name.trim().is_empty() {
            return Err(EventError::EmptyCustomerName);
        }
        Ok(Self { customer_id, customer_name })
    }
}

impl EventPayload for CustomerCreatedEvent {
    fn event_type() -> &'static str {
        "CustomerCreatedEvent"
    }

    fn aggregate_type() -> &'static str {
        "Customer"
    }
}

/// Published when an order is created, before items are added. The order id
/// is the aggregate id of the enclosing envelope.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OrderCreatedEvent {
    pub customer_id: Uuid,
}

impl OrderCreatedEvent {
    pub fn new(customer_id: Uuid) -> Result<Self, EventError> {
        if customer_id.is_nil() {
            return Err(EventError::NilCustomerId);
        }
        Ok(Self { customer_id })
    }
}

impl EventPayload for OrderCreatedEvent {
    fn event_type() -> &'static str {
        "OrderCreatedEvent"
    }

    fn aggregate_type() -> &'static str {
        "Order"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::DomainEvent;

    #[test]
    fn test_customer_created_validation() {
        assert!(matches!(
            CustomerCreatedEvent::new(Uuid::nil(), "Jan Kowalski"),
            Err(EventError::NilCustomerId)
        ));
        assert!(matches!(
            CustomerCreatedEvent::new(Uuid::new_v4(), ""),
            Err(EventError::EmptyCustomerName)
        ));
        assert!(CustomerCreatedEvent::new(Uuid::new_v4(), "Jan Kowalski").is_ok());
    }

    #[test]
    fn test_order_created_validation() {
        assert!(matches!(OrderCreatedEvent::new(Uuid::nil()), Err(EventError::NilCustomerId)));
        assert!(OrderCreatedEvent::new(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_event_type_names_match_concrete_types() {
        assert_eq!(CustomerCreatedEvent::event_type(), "CustomerCreatedEvent");
        assert_eq!(OrderCreatedEvent::event_type(), "OrderCreatedEvent");
        assert_eq!(CustomerCreatedEvent::aggregate_type(), "Customer");
        assert_eq!(OrderCreatedEvent::aggregate_type(), "Order");
    }

    #[test]
    fn test_customer_created_wire_fields() {
        let customer_id = Uuid::new_v4();
        let payload = CustomerCreatedEvent::new(customer_id, "Jan Kowalski").unwrap();
        let event = DomainEvent::new("MainApi", customer_id, payload).unwrap();

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["EventType"], "CustomerCreatedEvent");
        assert_eq!(json["CustomerId"], customer_id.to_string());
        assert_eq!(json["CustomerName"], "Jan Kowalski");
        assert_eq!(json["Source"], "MainApi");
    }
}
