//! Decoding of sink rows relayed over the change channel.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use syncdb_proto::{payload_from_value, Notification, Operation, Source};

use crate::error::{Error, Result};

/// A row of the sink table, as encoded by `row_to_json` in the relay trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkRow {
    /// Sink row id.
    #[serde(default)]
    pub id: Option<i64>,
    /// Table the captured change happened on.
    pub table_name: String,
    /// `TG_OP` of the capture trigger.
    pub operation: String,
    /// Captured row image or key. Missing when the row was too large to
    /// relay in one notification.
    #[serde(default)]
    pub data: Option<Value>,
    /// Sink insertion time (`timestamp` without time zone).
    #[serde(default)]
    pub created_at: Option<String>,
}

impl SinkRow {
    /// Parse one change channel payload.
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::Decode(format!("invalid sink row: {}", e)))
    }

    /// Whether the row image has to be read back from the sink.
    pub fn needs_data(&self) -> bool {
        self.data.is_none()
    }

    /// Convert into a canonical notification.
    pub fn into_notification(self) -> Result<Notification> {
        let operation = Operation::from_native(&self.operation)?;
        let data = self
            .data
            .ok_or_else(|| Error::Decode(format!("sink row for {} has no data", self.table_name)))?;
        let payload = payload_from_value(data)?;

        let notification = Notification::new(Source::Relational, self.table_name, operation, payload);
        Ok(match self.created_at.as_deref().and_then(parse_created_at) {
            Some(occurred_at) => notification.with_occurred_at(occurred_at),
            None => notification,
        })
    }
}

/// Decode one change channel payload.
pub fn decode_payload(payload: &str) -> Result<Notification> {
    SinkRow::parse(payload)?.into_notification()
}

/// Parse the sink's `created_at`.
///
/// The column has no time zone, so the value is read as UTC.
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| ts.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_decode_update_of_orders() {
        let payload = json!({
            "id": 42,
            "table_name": "orders",
            "operation": "UPDATE",
            "data": {"id": 5, "status": "shipped", "total": 120},
            "created_at": "2024-03-01T10:15:30.123456"
        })
        .to_string();

        let n = decode_payload(&payload).unwrap();
        assert_eq!(n.source, Source::Relational);
        assert_eq!(n.collection, "orders");
        assert_eq!(n.operation, Operation::Update);
        assert_eq!(n.payload["id"], 5);
        assert_eq!(n.payload["status"], "shipped");

        assert_eq!(n.occurred_at.year(), 2024);
        assert_eq!(n.occurred_at.hour(), 10);
        assert_eq!(n.occurred_at.second(), 30);
    }

    #[test]
    fn test_decode_insert_keeps_full_image() {
        let row = json!({"id": 7, "name": "kacchi", "price": 350});
        let payload = json!({
            "table_name": "menu_items",
            "operation": "INSERT",
            "data": row.clone(),
        })
        .to_string();

        let n = decode_payload(&payload).unwrap();
        assert_eq!(n.operation, Operation::Insert);
        assert_eq!(serde_json::Value::Object(n.payload), row);
    }

    #[test]
    fn test_decode_delete_carries_key() {
        let payload = json!({
            "table_name": "orders",
            "operation": "DELETE",
            "data": {"id": 5},
            "created_at": "2024-03-01T10:15:30"
        })
        .to_string();

        let n = decode_payload(&payload).unwrap();
        assert_eq!(n.operation, Operation::Delete);
        assert_eq!(n.payload.len(), 1);
        assert_eq!(n.payload["id"], 5);
    }

    #[test]
    fn test_missing_timestamp_uses_capture_time() {
        let before = Utc::now();
        let payload = json!({
            "table_name": "orders",
            "operation": "INSERT",
            "data": {"id": 1},
            "created_at": "not a timestamp"
        })
        .to_string();

        let n = decode_payload(&payload).unwrap();
        assert!(n.occurred_at >= before);
    }

    #[test]
    fn test_slim_row_needs_data() {
        let payload = json!({
            "id": 9,
            "table_name": "documents",
            "operation": "INSERT",
            "created_at": "2024-03-01T10:15:30"
        })
        .to_string();

        let mut row = SinkRow::parse(&payload).unwrap();
        assert!(row.needs_data());
        assert_eq!(row.id, Some(9));
        assert!(matches!(row.clone().into_notification(), Err(Error::Decode(_))));

        row.data = Some(json!({"id": 1, "body": "x"}));
        let n = row.into_notification().unwrap();
        assert_eq!(n.collection, "documents");
        assert_eq!(n.payload["body"], "x");
    }

    #[test]
    fn test_rejects_malformed_rows() {
        assert!(matches!(decode_payload("{"), Err(Error::Decode(_))));
        assert!(matches!(
            decode_payload(r#"{"table_name":"t","operation":"TRUNCATE","data":{}}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode_payload(r#"{"table_name":"t","operation":"INSERT","data":[1]}"#),
            Err(Error::Protocol(_))
        ));
    }
}
