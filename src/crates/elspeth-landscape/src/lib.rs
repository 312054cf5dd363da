//! # elspeth-landscape - Audit Model and Lineage Recorder
//!
//! This crate is the audit foundation of the elspeth engine. It owns every
//! identity in the system (content hashes, entity IDs), the audit record
//! types, the append-only [`Landscape`] recorder trait with its in-memory
//! and SQLite backends, the content-addressed payload store, and the
//! derived-outcome read model.
//!
//! ## Core Concepts
//!
//! ### Content-addressed identity
//!
//! All `*_hash` columns derive from [`canonical::stable_hash`] - SHA-256
//! over an RFC 8785 canonical JSON encoding - so identical semantic content
//! yields identical hashes in any process.
//!
//! ### Append-only recording
//!
//! The [`Landscape`] trait is the single write path for audit data. Every
//! operation either commits or fails with an [`AuditError`] that callers
//! treat as fatal: the engine prefers failing a run over losing its audit
//! trail.
//!
//! ### Derived outcomes
//!
//! A token's terminal classification ([`RowOutcome`]) is never stored; it
//! is derived at query time from node states, routing events, batch
//! membership, and lineage. See [`outcome::explain_run`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use elspeth_landscape::{InMemoryLandscape, Landscape};
//! use elspeth_landscape::canonical::CANONICAL_VERSION;
//! use serde_json::json;
//!
//! # async fn example() -> elspeth_landscape::Result<()> {
//! let landscape = InMemoryLandscape::new();
//! let run = landscape.begin_run(&json!({"pipeline": "demo"}), CANONICAL_VERSION).await?;
//! // ... register nodes, create rows/tokens, record states ...
//! # Ok(())
//! # }
//! ```

pub mod canonical;
pub mod error;
pub mod ids;
pub mod memory;
pub mod outcome;
pub mod payload;
pub mod records;
pub mod recorder;
pub mod sqlite;

pub use canonical::{canonical_json, hash_bytes, stable_hash, CANONICAL_VERSION};
pub use error::{AuditError, PayloadError, Result};
pub use ids::{
    ArtifactId, BatchId, CallId, EdgeId, EventId, ExpandGroupId, ForkGroupId, JoinGroupId, NodeId,
    RowId, RunId, StateId, TokenId,
};
pub use memory::InMemoryLandscape;
pub use outcome::{derive_outcome, explain_run, RowOutcome, RunExplain, TokenExplain};
pub use payload::{FsPayloadStore, InMemoryPayloadStore, PayloadStore};
pub use records::{
    Artifact, Batch, BatchMember, BatchOutput, BatchStatus, CallRecord, Determinism, EdgeRecord,
    NodeRecord, NodeState, NodeStateStatus, NodeType, PayloadKind, PayloadRef, PayloadSlot,
    RouteMode, RoutingEvent, RoutingKind, RowRecord, Run, RunStatus, TokenParent, TokenRecord,
    ValidationFailure,
};
pub use recorder::{
    ArtifactSpec, CallSpec, Landscape, NodeOutput, NodeRegistration, NodeStateCompletion,
    NodeStateStart, DEFAULT_INLINE_THRESHOLD_BYTES,
};
pub use sqlite::SqliteLandscape;
