use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque backend identifier.
///
/// Each backend hands out its own flavour: the SQLite store uses rowids, the
/// object store uses UUIDs. Identifiers from different flavours never compare
/// equal, so an entity hydrated from one store can never be mistaken for a row
/// of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordId {
    Row(i64),
    Object(Uuid),
}

impl RecordId {
    /// Allocate a fresh object-store identifier.
    pub fn new_object() -> Self {
        RecordId::Object(Uuid::new_v4())
    }

    pub fn as_row(&self) -> Option<i64> {
        match self {
            RecordId::Row(id) => Some(*id),
            RecordId::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<Uuid> {
        match self {
            RecordId::Object(id) => Some(*id),
            RecordId::Row(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Row(id) => write!(f, "row:{id}"),
            RecordId::Object(id) => write!(f, "obj:{id}"),
        }
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub RecordId);

        impl $name {
            pub fn record(&self) -> RecordId {
                self.0
            }
        }

        impl From<RecordId> for $name {
            fn from(id: RecordId) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_id!(
    /// Identifier of a stored feed row.
    FeedId
);
typed_id!(
    /// Identifier of a stored article row.
    ArticleId
);
typed_id!(
    /// Identifier of a stored enclosure row.
    EnclosureId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_and_object_ids_never_collide() {
        let row = RecordId::Row(1);
        let obj = RecordId::new_object();
        assert_ne!(row, obj);
        assert_eq!(row.as_row(), Some(1));
        assert!(row.as_object().is_none());
        assert!(obj.as_object().is_some());
    }

    #[test]
    fn test_display_is_prefixed() {
        assert_eq!(FeedId(RecordId::Row(42)).to_string(), "row:42");
        let id = RecordId::new_object();
        assert!(ArticleId(id).to_string().starts_with("obj:"));
    }

    #[test]
    fn test_typed_id_serializes_transparently() {
        let id = EnclosureId(RecordId::Row(7));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"Row":7}"#);
        let back: EnclosureId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
