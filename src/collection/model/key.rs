use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::collection::error::{invalid_argument, CollectionResult};

/// Name of a logical collection at the remote store, e.g. `reviews`.
///
/// A key identifies exactly one snapshot cache and one upstream subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionKey(String);

impl CollectionKey {
    pub fn new(name: impl Into<String>) -> CollectionResult<Self> {
        let name = name.into();
        validate_segment("Collection name", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CollectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for CollectionKey {
    type Error = crate::collection::error::CollectionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Stable document identity assigned by the remote store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

const PLACEHOLDER_PREFIX: &str = "local:";

impl DocumentId {
    pub fn new(id: impl Into<String>) -> CollectionResult<Self> {
        let id = id.into();
        validate_segment("Document id", &id)?;
        Ok(Self(id))
    }

    /// Builds a locally generated id used while an add awaits its server id.
    pub(crate) fn placeholder(seed: &str) -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{seed}"))
    }

    pub(crate) fn from_server(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether this id was generated locally for a pending add.
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for DocumentId {
    type Error = crate::collection::error::CollectionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

fn validate_segment(kind: &str, value: &str) -> CollectionResult<()> {
    if value.trim().is_empty() {
        return Err(invalid_argument(format!("{kind} must not be empty")));
    }
    if value.contains('/') {
        return Err(invalid_argument(format!(
            "{kind} \"{value}\" must not contain '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::error::CollectionErrorCode;

    #[test]
    fn accepts_plain_names() {
        let key = CollectionKey::new("catalog-items").unwrap();
        assert_eq!(key.as_str(), "catalog-items");
        assert_eq!(key.to_string(), "catalog-items");
    }

    #[test]
    fn rejects_blank_and_nested_names() {
        let err = CollectionKey::new("  ").unwrap_err();
        assert_eq!(err.code, CollectionErrorCode::InvalidArgument);
        assert!(CollectionKey::try_from("doors/main").is_err());
        assert!(DocumentId::new("").is_err());
    }

    #[test]
    fn placeholder_ids_are_recognised() {
        let id = DocumentId::placeholder("abc");
        assert!(id.is_placeholder());
        assert!(!DocumentId::new("r1").unwrap().is_placeholder());
    }
}
