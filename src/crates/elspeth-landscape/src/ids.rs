//! Opaque identifiers for audit entities
//!
//! Every audit table keys its rows with one of these newtypes. They are
//! UUIDv4-backed, serialize as strings on the wire, and are deliberately
//! opaque: no component may derive meaning from the textual form, and
//! substring matching of identifiers is forbidden everywhere in the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID (used when loading from storage).
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parses the string form produced by `Display`.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// Identifies a single execution of a pipeline.
    RunId
);
entity_id!(
    /// Identifies a compiled graph vertex within a run.
    NodeId
);
entity_id!(
    /// Identifies a directed graph edge within a run.
    EdgeId
);
entity_id!(
    /// Identifies a source row; stable across token forks and expansions.
    RowId
);
entity_id!(
    /// Identifies one row instance flowing along one DAG path.
    TokenId
);
entity_id!(
    /// Identifies one attempt of one token at one node.
    StateId
);
entity_id!(
    /// Identifies a routing event emitted by a gate invocation.
    EventId
);
entity_id!(
    /// Identifies a batch absorbed by an aggregation node.
    BatchId
);
entity_id!(
    /// Identifies an externally observable sink write.
    ArtifactId
);
entity_id!(
    /// Shared by all children of one fork.
    ForkGroupId
);
entity_id!(
    /// Shared by all parents merged into one coalesced token.
    JoinGroupId
);
entity_id!(
    /// Shared by all children of one expansion.
    ExpandGroupId
);
entity_id!(
    /// Identifies an external call recorded by a transform.
    CallId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(TokenId::generate(), TokenId::generate());
    }

    #[test]
    fn test_display_round_trip() {
        let id = RunId::generate();
        assert_eq!(RunId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_serde_transparent() {
        let id = NodeId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
