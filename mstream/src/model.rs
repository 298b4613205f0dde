//! Change events as published downstream.

use std::fmt;
use std::sync::OnceLock;

use apache_avro::Schema;
use mongodb::bson::{self, Bson, Document};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to decode change event: {0}")]
    Decode(#[from] bson::de::Error),
    #[error("Failed to encode document: {0}")]
    Encode(#[from] bson::ser::Error),
    #[error("Invalid change event: {0}")]
    InvalidEvent(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Avro serialization error: {0}")]
    Avro(#[from] apache_avro::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
    /// Operation types added by newer servers.
    Other(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
            OperationType::Other(other) => other,
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "drop" => OperationType::Drop,
            "rename" => OperationType::Rename,
            "dropDatabase" => OperationType::DropDatabase,
            "invalidate" => OperationType::Invalidate,
            other => OperationType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OperationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateDescription {
    /// Changed fields and their new values, as extended JSON.
    pub updated_fields: String,
    pub removed_fields: Vec<String>,
}

/// One record from a collection's change stream.
///
/// `update_description` is set only for updates and `to` only for renames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// The change stream `_id` as extended JSON.
    #[serde(rename = "_id")]
    pub id: String,
    pub operation_type: OperationType,
    /// Raw BSON of the full document, empty when the event carries none.
    #[serde(serialize_with = "serialize_raw_document")]
    pub full_document: Vec<u8>,
    /// The changed document's key as extended JSON, empty when absent.
    pub document_key: String,
    pub update_description: Option<UpdateDescription>,
    pub namespace: Namespace,
    pub to: Option<Namespace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeEvent {
    #[serde(rename = "_id")]
    id: Document,
    operation_type: String,
    #[serde(default)]
    full_document: Option<Document>,
    #[serde(default)]
    document_key: Option<Document>,
    #[serde(default)]
    update_description: Option<RawUpdateDescription>,
    #[serde(default)]
    ns: Option<RawNamespace>,
    #[serde(default)]
    to: Option<RawNamespace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUpdateDescription {
    updated_fields: Document,
    #[serde(default)]
    removed_fields: Vec<String>,
}

#[derive(Deserialize)]
struct RawNamespace {
    db: String,
    #[serde(default)]
    coll: String,
}

impl From<RawNamespace> for Namespace {
    fn from(ns: RawNamespace) -> Self {
        Self {
            db: ns.db,
            coll: ns.coll,
        }
    }
}

fn extended_json(doc: Document) -> String {
    Bson::Document(doc).into_relaxed_extjson().to_string()
}

impl ChangeEvent {
    /// Decode a raw change stream document.
    ///
    /// # Errors
    /// Returns [`Error::Decode`] if required fields are missing or mistyped and
    /// [`Error::InvalidEvent`] if an update has no update description or a
    /// rename has no target namespace.
    pub fn from_document(doc: Document) -> Result<Self, Error> {
        let raw: RawChangeEvent = bson::from_document(doc)?;
        let operation_type = OperationType::parse(&raw.operation_type);

        let update_description = match (&operation_type, raw.update_description) {
            (OperationType::Update, Some(desc)) => Some(UpdateDescription {
                updated_fields: extended_json(desc.updated_fields),
                removed_fields: desc.removed_fields,
            }),
            (OperationType::Update, None) => {
                return Err(Error::InvalidEvent(
                    "update event without updateDescription".into(),
                ))
            }
            _ => None,
        };

        let to = match (&operation_type, raw.to) {
            (OperationType::Rename, Some(to)) => Some(to.into()),
            (OperationType::Rename, None) => {
                return Err(Error::InvalidEvent("rename event without target".into()))
            }
            _ => None,
        };

        let full_document = match raw.full_document {
            Some(doc) => bson::to_vec(&doc)?,
            None => Vec::new(),
        };

        Ok(Self {
            id: extended_json(raw.id),
            operation_type,
            full_document,
            document_key: raw.document_key.map(extended_json).unwrap_or_default(),
            update_description,
            namespace: raw.ns.map(Namespace::from).unwrap_or(Namespace {
                db: String::new(),
                coll: String::new(),
            }),
            to,
        })
    }

    /// The full document, if the event carries one.
    pub fn full_document(&self) -> Result<Option<Document>, Error> {
        if self.full_document.is_empty() {
            return Ok(None);
        }
        Ok(Some(bson::from_slice(&self.full_document)?))
    }

    /// JSON body; the full document is rendered as a JSON object.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// A single Avro datum encoded against [`avro_schema`].
    pub fn to_avro(&self) -> Result<Vec<u8>, Error> {
        let schema = avro_schema()?;
        let full_document = self.full_document()?.map(extended_json);
        let record = AvroChangeEvent {
            id: &self.id,
            operation_type: self.operation_type.as_str(),
            full_document,
            document_key: &self.document_key,
            update_description: self.update_description.as_ref().map(|desc| {
                AvroUpdateDescription {
                    updated_fields: &desc.updated_fields,
                    removed_fields: &desc.removed_fields,
                }
            }),
            ns: AvroNamespace {
                db: &self.namespace.db,
                coll: &self.namespace.coll,
            },
            to: self.to.as_ref().map(|to| AvroNamespace {
                db: &to.db,
                coll: &to.coll,
            }),
        };
        let value = apache_avro::to_value(&record)?.resolve(schema)?;
        Ok(apache_avro::to_avro_datum(schema, value)?)
    }
}

fn serialize_raw_document<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    if bytes.is_empty() {
        return serializer.serialize_none();
    }
    let doc: Document = bson::from_slice(bytes).map_err(serde::ser::Error::custom)?;
    Bson::Document(doc)
        .into_relaxed_extjson()
        .serialize(serializer)
}

const AVRO_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "ChangeEvent",
    "namespace": "mstream",
    "fields": [
        {"name": "_id", "type": "string"},
        {"name": "operationType", "type": "string"},
        {"name": "fullDocument", "type": ["null", "string"], "default": null},
        {"name": "documentKey", "type": "string"},
        {"name": "updateDescription", "type": ["null", {
            "type": "record",
            "name": "UpdateDescription",
            "fields": [
                {"name": "updatedFields", "type": "string"},
                {"name": "removedFields", "type": {"type": "array", "items": "string"}}
            ]
        }], "default": null},
        {"name": "ns", "type": {
            "type": "record",
            "name": "Namespace",
            "fields": [
                {"name": "db", "type": "string"},
                {"name": "coll", "type": "string"}
            ]
        }},
        {"name": "to", "type": ["null", {
            "type": "record",
            "name": "TargetNamespace",
            "fields": [
                {"name": "db", "type": "string"},
                {"name": "coll", "type": "string"}
            ]
        }], "default": null}
    ]
}
"#;

/// Schema of the Avro encoded change event.
pub fn avro_schema() -> Result<&'static Schema, Error> {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    if let Some(schema) = SCHEMA.get() {
        return Ok(schema);
    }
    let schema = Schema::parse_str(AVRO_SCHEMA)?;
    Ok(SCHEMA.get_or_init(|| schema))
}

#[derive(Serialize)]
struct AvroChangeEvent<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "operationType")]
    operation_type: &'a str,
    #[serde(rename = "fullDocument")]
    full_document: Option<String>,
    #[serde(rename = "documentKey")]
    document_key: &'a str,
    #[serde(rename = "updateDescription")]
    update_description: Option<AvroUpdateDescription<'a>>,
    ns: AvroNamespace<'a>,
    to: Option<AvroNamespace<'a>>,
}

#[derive(Serialize)]
struct AvroUpdateDescription<'a> {
    #[serde(rename = "updatedFields")]
    updated_fields: &'a str,
    #[serde(rename = "removedFields")]
    removed_fields: &'a [String],
}

#[derive(Serialize)]
struct AvroNamespace<'a> {
    db: &'a str,
    coll: &'a str,
}

#[cfg(test)]
mod tests {
    use apache_avro::types::Value;
    use mongodb::bson::doc;

    use super::*;

    fn insert_doc() -> Document {
        doc! {
            "_id": {"_data": "8263"},
            "operationType": "insert",
            "fullDocument": {"_id": 1, "name": "alice"},
            "documentKey": {"_id": 1},
            "ns": {"db": "app", "coll": "users"},
        }
    }

    #[test]
    fn test_decode_insert() {
        let event = ChangeEvent::from_document(insert_doc()).unwrap();

        assert_eq!(event.operation_type, OperationType::Insert);
        assert_eq!(event.id, r#"{"_data":"8263"}"#);
        assert_eq!(event.document_key, r#"{"_id":1}"#);
        assert_eq!(
            event.namespace,
            Namespace {
                db: "app".into(),
                coll: "users".into()
            }
        );
        assert_eq!(
            event.full_document().unwrap(),
            Some(doc! {"_id": 1, "name": "alice"})
        );
        assert!(event.update_description.is_none());
        assert!(event.to.is_none());
    }

    #[test]
    fn test_decode_update() {
        let event = ChangeEvent::from_document(doc! {
            "_id": {"_data": "8264"},
            "operationType": "update",
            "fullDocument": null,
            "documentKey": {"_id": 1},
            "updateDescription": {"updatedFields": {"name": "bob"}, "removedFields": ["age"]},
            "ns": {"db": "app", "coll": "users"},
        })
        .unwrap();

        assert_eq!(event.operation_type, OperationType::Update);
        assert!(event.full_document.is_empty());
        let desc = event.update_description.unwrap();
        assert_eq!(desc.updated_fields, r#"{"name":"bob"}"#);
        assert_eq!(desc.removed_fields, vec!["age".to_string()]);
    }

    #[test]
    fn test_update_without_description_is_invalid() {
        let result = ChangeEvent::from_document(doc! {
            "_id": {"_data": "8264"},
            "operationType": "update",
            "documentKey": {"_id": 1},
            "ns": {"db": "app", "coll": "users"},
        });
        assert!(matches!(result, Err(Error::InvalidEvent(_))));
    }

    #[test]
    fn test_description_dropped_for_non_update() {
        let mut doc = insert_doc();
        doc.insert(
            "updateDescription",
            doc! {"updatedFields": {}, "removedFields": []},
        );
        let event = ChangeEvent::from_document(doc).unwrap();
        assert!(event.update_description.is_none());
    }

    #[test]
    fn test_decode_rename() {
        let event = ChangeEvent::from_document(doc! {
            "_id": {"_data": "8265"},
            "operationType": "rename",
            "ns": {"db": "app", "coll": "users"},
            "to": {"db": "app", "coll": "people"},
        })
        .unwrap();

        assert_eq!(event.operation_type, OperationType::Rename);
        assert_eq!(event.to.unwrap().coll, "people");
        assert!(event.document_key.is_empty());
    }

    #[test]
    fn test_rename_without_target_is_invalid() {
        let result = ChangeEvent::from_document(doc! {
            "_id": {"_data": "8265"},
            "operationType": "rename",
            "ns": {"db": "app", "coll": "users"},
        });
        assert!(matches!(result, Err(Error::InvalidEvent(_))));
    }

    #[test]
    fn test_decode_invalidate_without_namespace() {
        let event = ChangeEvent::from_document(doc! {
            "_id": {"_data": "8266"},
            "operationType": "invalidate",
        })
        .unwrap();
        assert_eq!(event.operation_type, OperationType::Invalidate);
        assert!(event.namespace.db.is_empty());
    }

    #[test]
    fn test_unknown_operation_kept() {
        let mut doc = insert_doc();
        doc.insert("operationType", "shardCollection");
        let event = ChangeEvent::from_document(doc).unwrap();
        assert_eq!(
            event.operation_type,
            OperationType::Other("shardCollection".into())
        );
        assert_eq!(event.operation_type.to_string(), "shardCollection");
    }

    #[test]
    fn test_missing_operation_type_fails_decode() {
        let result = ChangeEvent::from_document(doc! {"_id": {"_data": "1"}});
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_json_body() {
        let event = ChangeEvent::from_document(insert_doc()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["operation_type"], "insert");
        assert_eq!(json["full_document"]["name"], "alice");
        assert_eq!(json["namespace"]["coll"], "users");
        assert!(json["update_description"].is_null());
        assert!(json["to"].is_null());
    }

    #[test]
    fn test_avro_body_decodes_with_schema() {
        let event = ChangeEvent::from_document(insert_doc()).unwrap();
        let bytes = event.to_avro().unwrap();

        let schema = avro_schema().unwrap();
        let value = apache_avro::from_avro_datum(schema, &mut bytes.as_slice(), None).unwrap();
        let Value::Record(fields) = value else {
            panic!("expected record, got {value:?}");
        };
        assert_eq!(fields[0], ("_id".to_string(), Value::String(event.id.clone())));
        assert_eq!(
            fields[1],
            ("operationType".to_string(), Value::String("insert".into()))
        );
    }
}
