use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::error::{invalid_argument, CollectionResult};
use crate::collection::model::{DocumentId, Timestamp};

/// Field name to value mapping carried by a document.
pub type FieldMap = BTreeMap<String, Value>;

pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Fields owned by the remote store. Payloads may never carry them.
pub const RESERVED_FIELDS: [&str; 3] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD];

/// A document as mirrored from the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    created_at: Timestamp,
    updated_at: Timestamp,
    #[serde(flatten)]
    fields: FieldMap,
}

impl Document {
    pub fn new(
        id: DocumentId,
        created_at: Timestamp,
        updated_at: Timestamp,
        fields: FieldMap,
    ) -> Self {
        Self {
            id,
            created_at,
            updated_at,
            fields,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns whether every entry of `patch` is present here with the same value.
    pub fn contains_fields(&self, patch: &FieldMap) -> bool {
        patch
            .iter()
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }

    /// Replaces the listed fields, leaving identity and the others untouched.
    pub(crate) fn merge_fields(&mut self, patch: &FieldMap) {
        for (name, value) in patch {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    pub(crate) fn set_updated_at(&mut self, updated_at: Timestamp) {
        self.updated_at = updated_at;
    }

    /// JSON object with the fields plus `id`, `created_at` and `updated_at`.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.clone());
        }
        object.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        object.insert(CREATED_AT_FIELD.to_string(), self.created_at.to_json());
        object.insert(UPDATED_AT_FIELD.to_string(), self.updated_at.to_json());
        Value::Object(object)
    }

    /// Decodes the document (including `id` and timestamps) into `T`.
    pub fn decode<T>(&self) -> CollectionResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.to_json()).map_err(|err| {
            invalid_argument(format!("Failed to decode document {}: {err}", self.id))
        })
    }
}

/// Snapshot order: `created_at` descending, ties broken by id so the order is total.
pub fn newest_first(left: &Document, right: &Document) -> Ordering {
    right
        .created_at
        .cmp(&left.created_at)
        .then_with(|| left.id.cmp(&right.id))
}

/// Converts a JSON object into a field map.
pub fn fields_from_json(value: Value) -> CollectionResult<FieldMap> {
    match value {
        Value::Object(object) => Ok(object.into_iter().collect()),
        other => Err(invalid_argument(format!(
            "Document payload must be a JSON object, got {other}"
        ))),
    }
}

/// Serializes `record` into a field map.
pub fn to_fields<T>(record: &T) -> CollectionResult<FieldMap>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(record)
        .map_err(|err| invalid_argument(format!("Failed to encode document payload: {err}")))?;
    fields_from_json(value)
}

/// Rejects payloads that try to set store-owned fields.
pub(crate) fn validate_payload(fields: &FieldMap) -> CollectionResult<()> {
    if let Some(reserved) = RESERVED_FIELDS
        .iter()
        .find(|name| fields.contains_key(**name))
    {
        return Err(invalid_argument(format!(
            "Field \"{reserved}\" is assigned by the remote store and cannot be written"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review(id: &str, millis: i64) -> Document {
        let fields = fields_from_json(json!({ "name": "Dana", "rating": 5 })).unwrap();
        let at = Timestamp::from_millis(millis);
        Document::new(DocumentId::new(id).unwrap(), at, at, fields)
    }

    #[derive(Deserialize)]
    struct Review {
        id: String,
        name: String,
        rating: u8,
        created_at: Timestamp,
    }

    #[test]
    fn decodes_into_typed_record() {
        let document = review("r1", 2_000);
        let decoded: Review = document.decode().unwrap();
        assert_eq!(decoded.id, "r1");
        assert_eq!(decoded.name, "Dana");
        assert_eq!(decoded.rating, 5);
        assert_eq!(decoded.created_at, Timestamp::from_millis(2_000));
    }

    #[test]
    fn serde_round_trip_keeps_fields_flat() {
        let document = review("r1", 2_000);
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["name"], "Dana");
        assert_eq!(value["id"], "r1");
        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, document);
    }

    #[test]
    fn newest_first_orders_by_creation_then_id() {
        let mut documents = vec![review("a", 1_000), review("c", 3_000), review("b", 3_000)];
        documents.sort_by(newest_first);
        let ids: Vec<&str> = documents.iter().map(|d| d.id().as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn reserved_fields_are_rejected() {
        let fields = fields_from_json(json!({ "name": "x", "created_at": 1 })).unwrap();
        assert!(validate_payload(&fields).is_err());
        let fields = fields_from_json(json!({ "name": "x" })).unwrap();
        assert!(validate_payload(&fields).is_ok());
    }

    #[test]
    fn contains_fields_checks_values() {
        let document = review("r1", 1);
        let same = fields_from_json(json!({ "rating": 5 })).unwrap();
        let different = fields_from_json(json!({ "rating": 4 })).unwrap();
        assert!(document.contains_fields(&same));
        assert!(!document.contains_fields(&different));
        assert!(fields_from_json(json!([1, 2])).is_err());
    }
}
