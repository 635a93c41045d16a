use serde::Serialize;
use serde_json::Value;

use crate::collection::error::{invalid_argument, CollectionResult};
use crate::collection::model::{
    fields_from_json, to_fields, validate_payload, CollectionKey, DocumentId, FieldMap,
    CREATED_AT_FIELD, ID_FIELD, RESERVED_FIELDS,
};
use crate::collection::remote::{OrderDirection, RemoteCollectionSourceArc};

/// A document to write under a fixed id during first-run seeding.
#[derive(Clone, Debug, PartialEq)]
pub struct SeedDocument {
    pub id: DocumentId,
    pub fields: FieldMap,
}

impl SeedDocument {
    pub fn new(id: DocumentId, fields: FieldMap) -> CollectionResult<Self> {
        validate_payload(&fields)?;
        Ok(Self { id, fields })
    }

    /// Builds a seed from a JSON object carrying its own string `id`.
    ///
    /// Timestamps present in the object are dropped; the store assigns them.
    pub fn from_json(value: Value) -> CollectionResult<Self> {
        let mut fields = fields_from_json(value)?;
        let id = match fields.remove(ID_FIELD) {
            Some(Value::String(id)) => DocumentId::new(id)?,
            Some(other) => {
                return Err(invalid_argument(format!(
                    "Seed document id must be a string, got {other}"
                )))
            }
            None => return Err(invalid_argument("Seed document is missing an \"id\" field")),
        };
        for field in RESERVED_FIELDS {
            fields.remove(field);
        }
        Ok(Self { id, fields })
    }

    pub fn from_record<T: Serialize>(record: &T) -> CollectionResult<Self> {
        let fields = to_fields(record)?;
        let value = Value::Object(fields.into_iter().collect());
        Self::from_json(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { written: usize },
    AlreadyPresent { existing: usize },
}

/// Writes bootstrap data into collections that are still empty.
#[derive(Clone)]
pub struct CollectionSeeder {
    source: RemoteCollectionSourceArc,
}

impl CollectionSeeder {
    pub fn new(source: RemoteCollectionSourceArc) -> Self {
        Self { source }
    }

    /// Writes `documents` into `key` unless a one-shot read finds it non-empty.
    ///
    /// Stops at the first failed write; documents written before it stay.
    pub async fn seed_if_empty(
        &self,
        key: &CollectionKey,
        documents: Vec<SeedDocument>,
    ) -> CollectionResult<SeedOutcome> {
        let existing = self
            .source
            .fetch(key, CREATED_AT_FIELD, OrderDirection::Descending)
            .await?;
        if !existing.is_empty() {
            log::info!("{key} already holds {} documents", existing.len());
            return Ok(SeedOutcome::AlreadyPresent {
                existing: existing.len(),
            });
        }

        log::info!("seeding {key} with {} documents", documents.len());
        let mut written = 0;
        for document in documents {
            self.source.put(key, &document.id, document.fields).await?;
            written += 1;
        }
        log::info!("seeded {key}");
        Ok(SeedOutcome::Seeded { written })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::error::{unavailable, CollectionErrorCode};
    use crate::collection::remote::InMemoryCollectionSource;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Serialize)]
    struct Door {
        id: &'static str,
        name: &'static str,
        price: u32,
    }

    fn doors() -> CollectionKey {
        CollectionKey::new("doors").unwrap()
    }

    #[test]
    fn seed_from_json_strips_reserved_fields() {
        let seed = SeedDocument::from_json(json!({
            "id": "door-1",
            "name": "Oak",
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(seed.id.as_str(), "door-1");
        assert_eq!(seed.fields.len(), 1);
    }

    #[test]
    fn seed_requires_string_id() {
        let err = SeedDocument::from_json(json!({ "name": "Oak" })).unwrap_err();
        assert_eq!(err.code, CollectionErrorCode::InvalidArgument);
        assert!(SeedDocument::from_json(json!({ "id": 7 })).is_err());
    }

    #[tokio::test]
    async fn seeds_only_empty_collections() {
        let source = InMemoryCollectionSource::new();
        let seeder = CollectionSeeder::new(Arc::new(source.clone()));
        let seeds = vec![
            SeedDocument::from_record(&Door { id: "d1", name: "Oak", price: 100 }).unwrap(),
            SeedDocument::from_record(&Door { id: "d2", name: "Pine", price: 80 }).unwrap(),
        ];

        let first = seeder.seed_if_empty(&doors(), seeds.clone()).await.unwrap();
        assert_eq!(first, SeedOutcome::Seeded { written: 2 });

        let second = seeder.seed_if_empty(&doors(), seeds).await.unwrap();
        assert_eq!(second, SeedOutcome::AlreadyPresent { existing: 2 });

        let stored = source.documents(&doors());
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|d| d.id().as_str() == "d1"));
    }

    #[tokio::test]
    async fn write_failure_stops_seeding() {
        let source = InMemoryCollectionSource::new();
        let seeder = CollectionSeeder::new(Arc::new(source.clone()));
        source.fail_next_write(unavailable("offline"));
        let seed = SeedDocument::from_json(json!({ "id": "main", "name": "Shop" })).unwrap();
        let err = seeder.seed_if_empty(&doors(), vec![seed]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(source.documents(&doors()).is_empty());
    }
}
