//! Decoding of raw change stream events.

use chrono::{DateTime, Utc};
use mongodb::bson::{self, Bson, Document, Timestamp};
use serde::Deserialize;
use serde_json::{Map, Value};

use syncdb_proto::{payload_from_value, Notification, Operation, Payload, Source, DOCUMENT_KEY_FIELD};

use crate::error::{Error, Result};

/// The fields of a change event this crate reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation_type: String,
    #[serde(default)]
    pub full_document: Option<Document>,
    #[serde(default)]
    pub document_key: Option<Document>,
    #[serde(default)]
    pub update_description: Option<Document>,
    #[serde(default)]
    pub ns: Option<Namespace>,
    #[serde(default)]
    pub cluster_time: Option<Timestamp>,
}

/// Namespace of a change event.
#[derive(Debug, Clone, Deserialize)]
pub struct Namespace {
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub coll: Option<String>,
}

/// Result of decoding one event.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// A data change to forward.
    Change(Notification),
    /// An event type that carries no row change (drop, rename, invalidate...).
    Skipped(String),
}

/// Decode one raw change stream event.
pub fn decode_event(raw: Document) -> Result<Decoded> {
    let event: ChangeEvent =
        bson::from_document(raw).map_err(|e| Error::Decode(format!("invalid change event: {}", e)))?;
    decode(event)
}

fn decode(event: ChangeEvent) -> Result<Decoded> {
    let (operation, payload) = match event.operation_type.as_str() {
        "insert" => {
            let full = required(event.full_document, "fullDocument")?;
            (Operation::Insert, to_payload(full)?)
        }
        "update" => {
            let description = required(event.update_description, "updateDescription")?;
            let key = required(event.document_key, "documentKey")?;
            let mut payload = to_payload(description)?;
            payload.insert(DOCUMENT_KEY_FIELD.to_string(), to_json(key));
            (Operation::Update, payload)
        }
        // A replacement is reported as an update whose changed fields are the
        // whole new document.
        "replace" => {
            let full = required(event.full_document, "fullDocument")?;
            let key = required(event.document_key, "documentKey")?;
            let mut payload = Map::new();
            payload.insert("updatedFields".to_string(), to_json(full));
            payload.insert("removedFields".to_string(), Value::Array(Vec::new()));
            payload.insert(DOCUMENT_KEY_FIELD.to_string(), to_json(key));
            (Operation::Update, payload)
        }
        "delete" => {
            let key = required(event.document_key, "documentKey")?;
            (Operation::Delete, to_payload(key)?)
        }
        other => return Ok(Decoded::Skipped(other.to_string())),
    };

    let collection = event
        .ns
        .and_then(|ns| ns.coll)
        .ok_or_else(|| Error::Decode("change event has no collection".to_string()))?;

    let notification = Notification::new(Source::Document, collection, operation, payload);
    Ok(Decoded::Change(
        match event.cluster_time.and_then(cluster_time_to_utc) {
            Some(occurred_at) => notification.with_occurred_at(occurred_at),
            None => notification,
        },
    ))
}

fn required(field: Option<Document>, name: &str) -> Result<Document> {
    field.ok_or_else(|| Error::Decode(format!("change event is missing {}", name)))
}

fn to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

fn to_payload(document: Document) -> Result<Payload> {
    Ok(payload_from_value(to_json(document))?)
}

fn cluster_time_to_utc(ts: Timestamp) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(i64::from(ts.time), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use mongodb::bson::{doc, oid::ObjectId};
    use serde_json::json;

    fn change(decoded: Decoded) -> Notification {
        match decoded {
            Decoded::Change(n) => n,
            Decoded::Skipped(op) => panic!("unexpected skip of {}", op),
        }
    }

    #[test]
    fn test_insert_carries_full_document() {
        let raw = doc! {
            "_id": { "_data": "8263A1" },
            "operationType": "insert",
            "ns": { "db": "app", "coll": "users" },
            "documentKey": { "_id": "abc123" },
            "fullDocument": { "_id": "abc123", "name": "Rafi", "age": 31 },
            "clusterTime": Timestamp { time: 1_700_000_000, increment: 1 },
        };

        let n = change(decode_event(raw).unwrap());
        assert_eq!(n.source, Source::Document);
        assert_eq!(n.collection, "users");
        assert_eq!(n.operation, Operation::Insert);
        assert_eq!(Value::Object(n.payload), json!({"_id": "abc123", "name": "Rafi", "age": 31}));
        assert_eq!(n.occurred_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_delete_carries_document_key() {
        let raw = doc! {
            "operationType": "delete",
            "ns": { "db": "app", "coll": "users" },
            "documentKey": { "_id": "abc123" },
        };

        let n = change(decode_event(raw).unwrap());
        assert_eq!(n.operation, Operation::Delete);
        assert_eq!(n.collection, "users");
        assert_eq!(Value::Object(n.payload), json!({"_id": "abc123"}));
    }

    #[test]
    fn test_update_carries_description_and_key() {
        let raw = doc! {
            "operationType": "update",
            "ns": { "db": "app", "coll": "users" },
            "documentKey": { "_id": "abc123" },
            "updateDescription": {
                "updatedFields": { "age": 32 },
                "removedFields": ["nickname"],
                "truncatedArrays": [],
            },
        };

        let n = change(decode_event(raw).unwrap());
        assert_eq!(n.operation, Operation::Update);
        assert_eq!(n.payload["updatedFields"], json!({"age": 32}));
        assert_eq!(n.payload["removedFields"], json!(["nickname"]));
        assert_eq!(n.payload[DOCUMENT_KEY_FIELD], json!({"_id": "abc123"}));
        assert!(!n.has_full_image());
    }

    #[test]
    fn test_replace_becomes_update() {
        let raw = doc! {
            "operationType": "replace",
            "ns": { "db": "app", "coll": "users" },
            "documentKey": { "_id": "abc123" },
            "fullDocument": { "_id": "abc123", "name": "Rafi" },
        };

        let n = change(decode_event(raw).unwrap());
        assert_eq!(n.operation, Operation::Update);
        assert_eq!(n.payload["updatedFields"], json!({"_id": "abc123", "name": "Rafi"}));
        assert_eq!(n.payload["removedFields"], json!([]));
        assert_eq!(n.payload[DOCUMENT_KEY_FIELD], json!({"_id": "abc123"}));
    }

    #[test]
    fn test_object_ids_use_relaxed_extended_json() {
        let id = ObjectId::new();
        let raw = doc! {
            "operationType": "delete",
            "ns": { "db": "app", "coll": "orders" },
            "documentKey": { "_id": id },
        };

        let n = change(decode_event(raw).unwrap());
        assert_eq!(n.payload["_id"], json!({"$oid": id.to_hex()}));
    }

    #[test]
    fn test_non_data_events_are_skipped() {
        let raw = doc! {
            "operationType": "dropDatabase",
            "ns": { "db": "app" },
        };
        assert!(matches!(decode_event(raw).unwrap(), Decoded::Skipped(op) if op == "dropDatabase"));

        let raw = doc! { "operationType": "invalidate" };
        assert!(matches!(decode_event(raw).unwrap(), Decoded::Skipped(_)));
    }

    #[test]
    fn test_incomplete_events_are_rejected() {
        let no_full_document = doc! {
            "operationType": "insert",
            "ns": { "db": "app", "coll": "users" },
        };
        assert!(matches!(decode_event(no_full_document), Err(Error::Decode(_))));

        let no_collection = doc! {
            "operationType": "delete",
            "documentKey": { "_id": 1 },
        };
        assert!(matches!(decode_event(no_collection), Err(Error::Decode(_))));

        let no_operation = doc! { "ns": { "db": "app", "coll": "users" } };
        assert!(matches!(decode_event(no_operation), Err(Error::Decode(_))));
    }

    #[test]
    fn test_cluster_time_conversion() {
        let ts = cluster_time_to_utc(Timestamp { time: 3_661, increment: 9 }).unwrap();
        assert_eq!(ts.hour(), 1);
        assert_eq!(ts.minute(), 1);
        assert_eq!(ts.second(), 1);
    }
}
