//! Business transaction payload consumed by workflows.

use crate::error::ActivityError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A transaction: an id plus arbitrary content fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Transaction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Content fields that carry a usable value
    pub fn content_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().filter(|(_, value)| has_content(value))
    }

    /// A transaction needs a non-blank id and at least one content field
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.id.trim().is_empty() {
            return Err(ActivityError::validation(
                "validate_transaction",
                "transaction id is missing",
            ));
        }
        if self.content_fields().next().is_none() {
            return Err(ActivityError::validation(
                "validate_transaction",
                format!("transaction {} has no content fields", self.id),
            ));
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(object)
    }
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_validation() {
        let ok = Transaction::new("tx-1").with_field("note", "chest pain, 2 days");
        assert!(ok.validate().is_ok());

        let blank_id = Transaction::new("  ").with_field("note", "x");
        assert_eq!(blank_id.validate().unwrap_err().kind, ErrorKind::Validation);

        let empty = Transaction::new("tx-2")
            .with_field("note", "   ")
            .with_field("codes", json!([]));
        assert_eq!(empty.validate().unwrap_err().kind, ErrorKind::Validation);
    }

    #[test]
    fn test_flattened_serde() {
        let tx: Transaction =
            serde_json::from_value(json!({"id": "tx-9", "note": "follow-up"})).unwrap();
        assert_eq!(tx.id, "tx-9");
        assert_eq!(tx.field("note"), Some(&json!("follow-up")));
        assert_eq!(tx.to_value()["id"], "tx-9");
    }
}
