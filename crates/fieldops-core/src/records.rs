//! # Entity Records
//!
//! Typed schemas for the records carried by mutations.
//!
//! ## Serialization Boundary
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  business layer ──► EntityRecord::parse(entity, json) ──► queue row     │
//! │                         │                                               │
//! │                         └── rejects: missing id, missing parent ref,    │
//! │                             wrong JSON shape                            │
//! │                                                                         │
//! │  queue row ──► EntityRecord::from_payload(entity, text) ──► push body   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The union is keyed by entity name. Entities without a dedicated schema
//! fall back to [`EntityRecord::Generic`], which only requires an object
//! with a non-empty `id`. Unknown fields are preserved verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::validation::{validate_non_empty, ValidationResult};

/// Well-known entity names.
pub mod entities {
    pub const CLIENTS: &str = "clients";
    pub const QUOTES: &str = "quotes";
    pub const WORK_ORDERS: &str = "work_orders";
    pub const INVOICES: &str = "invoices";
    pub const PAYMENTS: &str = "payments";
    pub const CHECKLISTS: &str = "work_order_checklists";

    /// Entities a well-known entity references through its parent id
    /// fields. Their mutations have to reach the server first.
    pub fn parents(entity: &str) -> &'static [&'static str] {
        match entity {
            QUOTES => &[CLIENTS],
            WORK_ORDERS => &[CLIENTS, QUOTES],
            INVOICES => &[CLIENTS, WORK_ORDERS],
            PAYMENTS => &[INVOICES],
            _ => &[],
        }
    }
}

// =============================================================================
// Schemas
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub id: String,
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "totalCents", skip_serializing_if = "Option::is_none")]
    pub total_cents: Option<i64>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderRecord {
    pub id: String,
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(default, alias = "quoteId", skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "scheduledAt", skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<String>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(default, alias = "workOrderId", skip_serializing_if = "Option::is_none")]
    pub work_order_id: Option<String>,
    #[serde(default, alias = "totalCents", skip_serializing_if = "Option::is_none")]
    pub total_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    #[serde(alias = "invoiceId")]
    pub invoice_id: String,
    #[serde(alias = "amountCents")]
    pub amount_cents: i64,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// =============================================================================
// Tagged Union
// =============================================================================

/// A record keyed by the entity it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRecord {
    Client(ClientRecord),
    Quote(QuoteRecord),
    WorkOrder(WorkOrderRecord),
    Invoice(InvoiceRecord),
    Payment(PaymentRecord),
    /// Any other registered entity: an object with a non-empty `id`.
    Generic { entity: String, value: Value },
}

impl EntityRecord {
    /// Parses and validates a JSON value as a record of `entity`.
    pub fn parse(entity: &str, value: Value) -> ValidationResult<Self> {
        if !value.is_object() {
            return Err(ValidationError::WrongType {
                field: entity.to_string(),
                expected: "a JSON object".to_string(),
            });
        }

        let record = match entity {
            entities::CLIENTS => EntityRecord::Client(decode(entity, value)?),
            entities::QUOTES => EntityRecord::Quote(decode(entity, value)?),
            entities::WORK_ORDERS => EntityRecord::WorkOrder(decode(entity, value)?),
            entities::INVOICES => EntityRecord::Invoice(decode(entity, value)?),
            entities::PAYMENTS => EntityRecord::Payment(decode(entity, value)?),
            other => EntityRecord::Generic {
                entity: other.to_string(),
                value,
            },
        };

        record.validate()?;
        Ok(record)
    }

    /// Parses a stored queue payload.
    pub fn from_payload(entity: &str, payload: &str) -> CoreResult<Self> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| CoreError::InvalidPayload {
                entity: entity.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::parse(entity, value)?)
    }

    /// Entity name this record belongs to.
    pub fn entity(&self) -> &str {
        match self {
            EntityRecord::Client(_) => entities::CLIENTS,
            EntityRecord::Quote(_) => entities::QUOTES,
            EntityRecord::WorkOrder(_) => entities::WORK_ORDERS,
            EntityRecord::Invoice(_) => entities::INVOICES,
            EntityRecord::Payment(_) => entities::PAYMENTS,
            EntityRecord::Generic { entity, .. } => entity,
        }
    }

    /// Record id.
    pub fn id(&self) -> String {
        match self {
            EntityRecord::Client(r) => r.id.clone(),
            EntityRecord::Quote(r) => r.id.clone(),
            EntityRecord::WorkOrder(r) => r.id.clone(),
            EntityRecord::Invoice(r) => r.id.clone(),
            EntityRecord::Payment(r) => r.id.clone(),
            EntityRecord::Generic { value, .. } => record_id(value).unwrap_or_default(),
        }
    }

    pub fn created_at(&self) -> Option<String> {
        match self {
            EntityRecord::Client(r) => r.created_at.clone(),
            EntityRecord::Quote(r) => r.created_at.clone(),
            EntityRecord::WorkOrder(r) => r.created_at.clone(),
            EntityRecord::Invoice(r) => r.created_at.clone(),
            EntityRecord::Payment(r) => r.created_at.clone(),
            EntityRecord::Generic { value, .. } => timestamp_field(value, "created_at", "createdAt"),
        }
    }

    pub fn updated_at(&self) -> Option<String> {
        match self {
            EntityRecord::Client(r) => r.updated_at.clone(),
            EntityRecord::Quote(r) => r.updated_at.clone(),
            EntityRecord::WorkOrder(r) => r.updated_at.clone(),
            EntityRecord::Invoice(r) => r.updated_at.clone(),
            EntityRecord::Payment(r) => r.updated_at.clone(),
            EntityRecord::Generic { value, .. } => timestamp_field(value, "updated_at", "updatedAt"),
        }
    }

    /// Converts back to a JSON value.
    pub fn to_value(&self) -> Value {
        let result = match self {
            EntityRecord::Client(r) => serde_json::to_value(r),
            EntityRecord::Quote(r) => serde_json::to_value(r),
            EntityRecord::WorkOrder(r) => serde_json::to_value(r),
            EntityRecord::Invoice(r) => serde_json::to_value(r),
            EntityRecord::Payment(r) => serde_json::to_value(r),
            EntityRecord::Generic { value, .. } => Ok(value.clone()),
        };
        // Plain structs with String/i64/Map fields always serialize.
        result.unwrap_or(Value::Null)
    }

    /// Serializes for storage in the mutation queue.
    pub fn to_payload(&self) -> String {
        self.to_value().to_string()
    }

    fn validate(&self) -> ValidationResult<()> {
        match self {
            EntityRecord::Client(r) => {
                validate_non_empty("id", &r.id)?;
                validate_non_empty("name", &r.name)
            }
            EntityRecord::Quote(r) => {
                validate_non_empty("id", &r.id)?;
                validate_non_empty("client_id", &r.client_id)
            }
            EntityRecord::WorkOrder(r) => {
                validate_non_empty("id", &r.id)?;
                validate_non_empty("client_id", &r.client_id)
            }
            EntityRecord::Invoice(r) => {
                validate_non_empty("id", &r.id)?;
                validate_non_empty("client_id", &r.client_id)
            }
            EntityRecord::Payment(r) => {
                validate_non_empty("id", &r.id)?;
                validate_non_empty("invoice_id", &r.invoice_id)?;
                if r.amount_cents <= 0 {
                    return Err(ValidationError::OutOfRange {
                        field: "amount_cents".to_string(),
                        min: 1,
                        max: i64::MAX,
                    });
                }
                Ok(())
            }
            EntityRecord::Generic { value, .. } => match record_id(value) {
                Some(id) => validate_non_empty("id", &id),
                None => Err(ValidationError::Required {
                    field: "id".to_string(),
                }),
            },
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(entity: &str, value: Value) -> ValidationResult<T> {
    serde_json::from_value(value).map_err(|e| ValidationError::InvalidFormat {
        field: entity.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Untyped Helpers
// =============================================================================

/// Extracts a record id from raw JSON. Numeric ids are stringified.
pub fn record_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads a timestamp stored under either its snake_case or camelCase key.
pub fn timestamp_field(value: &Value, snake: &str, camel: &str) -> Option<String> {
    value
        .get(snake)
        .or_else(|| value.get(camel))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_preserves_extra_fields() {
        let record = EntityRecord::parse(
            entities::CLIENTS,
            json!({"id": "c1", "name": "Acme", "createdAt": "2026-01-01T00:00:00Z", "vip": true}),
        )
        .unwrap();

        assert_eq!(record.entity(), "clients");
        assert_eq!(record.id(), "c1");
        assert_eq!(record.created_at().as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(record.to_value()["vip"], json!(true));
    }

    #[test]
    fn test_quote_requires_client() {
        let err = EntityRecord::parse(entities::QUOTES, json!({"id": "q1", "client_id": ""}))
            .unwrap_err();
        assert!(err.to_string().contains("client_id"));

        assert!(EntityRecord::parse(entities::QUOTES, json!({"id": "q1"})).is_err());
    }

    #[test]
    fn test_payment_amount_must_be_positive() {
        let result = EntityRecord::parse(
            entities::PAYMENTS,
            json!({"id": "p1", "invoice_id": "i1", "amount_cents": 0}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_generic_requires_id() {
        assert!(EntityRecord::parse("technicians", json!({"name": "Sam"})).is_err());
        assert!(EntityRecord::parse("technicians", json!([1, 2])).is_err());

        let record = EntityRecord::parse("technicians", json!({"id": 42})).unwrap();
        assert_eq!(record.id(), "42");
    }

    #[test]
    fn test_from_payload_rejects_bad_json() {
        let err = EntityRecord::from_payload(entities::CLIENTS, "{not json").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));
    }
}
