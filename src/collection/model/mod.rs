mod document;
mod key;
mod timestamp;

pub(crate) use document::validate_payload;
pub use document::{
    fields_from_json, newest_first, to_fields, Document, FieldMap, CREATED_AT_FIELD, ID_FIELD,
    RESERVED_FIELDS, UPDATED_AT_FIELD,
};
pub use key::{CollectionKey, DocumentId};
pub use timestamp::Timestamp;
