use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use cosync_common::types::DocumentId;

/// A capability over a set of documents: everything, or an explicit list.
/// Serializes as `"*"` or as a JSON array of document ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    All,
    Only(BTreeSet<DocumentId>),
}

impl Access {
    pub fn allows(&self, document_id: &str) -> bool {
        match self {
            Access::All => true,
            Access::Only(docs) => docs.contains(document_id),
        }
    }

    pub fn none() -> Self {
        Access::Only(BTreeSet::new())
    }
}

impl Serialize for Access {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Access::All => serializer.serialize_str("*"),
            Access::Only(docs) => docs.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Access {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Wildcard(String),
            List(BTreeSet<String>),
        }
        match Wire::deserialize(deserializer)? {
            Wire::Wildcard(s) if s == "*" => Ok(Access::All),
            Wire::Wildcard(s) => Err(serde::de::Error::custom(format!(
                "expected \"*\" or a list of document ids, got \"{s}\""
            ))),
            Wire::List(docs) => Ok(Access::Only(docs)),
        }
    }
}

/// Capability record attached to an authenticated principal and echoed in
/// `auth_success`. `sync_request` requires read, `delta` requires write;
/// admin implies both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_read: Access,
    pub can_write: Access,
    pub is_admin: bool,
}

impl Permissions {
    pub fn admin() -> Self {
        Self {
            can_read: Access::All,
            can_write: Access::All,
            is_admin: true,
        }
    }

    pub fn read_write_all() -> Self {
        Self {
            can_read: Access::All,
            can_write: Access::All,
            is_admin: false,
        }
    }

    pub fn none() -> Self {
        Self {
            can_read: Access::none(),
            can_write: Access::none(),
            is_admin: false,
        }
    }

    pub fn can_read_document(&self, document_id: &str) -> bool {
        self.is_admin || self.can_read.allows(document_id)
    }

    pub fn can_write_document(&self, document_id: &str) -> bool {
        self.is_admin || self.can_write.allows(document_id)
    }
}
