//! Audit record types
//!
//! These structs are the rows of the audit database: one type per table,
//! serde-derived, with `chrono` timestamps. The recorder is their only
//! writer. Apart from the documented mutable fields (run status and
//! completion, node-state completion, batch status) every record is
//! append-only, so the types carry no interior mutability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{
    ArtifactId, BatchId, CallId, EdgeId, EventId, ExpandGroupId, ForkGroupId, JoinGroupId, NodeId,
    RowId, RunId, StateId, TokenId,
};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Role of a compiled graph vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Source,
    Transform,
    Gate,
    Aggregation,
    Coalesce,
    Sink,
}

impl NodeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Transform => "transform",
            Self::Gate => "gate",
            Self::Aggregation => "aggregation",
            Self::Coalesce => "coalesce",
            Self::Sink => "sink",
        }
    }
}

/// Declared determinism class of a plugin.
///
/// Recorded per node so that replay tooling can distinguish reproducible
/// stages from those that read the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    Deterministic,
    Seeded,
    Nondeterministic,
    IoRead,
}

impl Determinism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Seeded => "seeded",
            Self::Nondeterministic => "nondeterministic",
            Self::IoRead => "io_read",
        }
    }
}

/// Status of one token's attempt at one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    Running,
    Completed,
    Failed,
    Retried,
    Skipped,
}

impl NodeStateStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retried => "retried",
            Self::Skipped => "skipped",
        }
    }

    /// Whether this status closes the attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Kind of routing decision a gate produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    Continue,
    RouteToSink,
    ForkToPaths,
}

impl RoutingKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::RouteToSink => "route_to_sink",
            Self::ForkToPaths => "fork_to_paths",
        }
    }
}

/// Whether a routed token terminates at the destination or also continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    #[default]
    Move,
    Copy,
}

impl RouteMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Copy => "copy",
        }
    }
}

/// Lifecycle status of an aggregation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Executing,
    Completed,
    Failed,
}

impl BatchStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What an externalized payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Row,
    Aggregate,
    Error,
    Context,
}

impl PayloadKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Aggregate => "aggregate",
            Self::Error => "error",
            Self::Context => "context",
        }
    }
}

/// Reference to a blob in the content-addressed payload store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub content_hash: String,
    pub size_bytes: u64,
    pub kind: PayloadKind,
}

/// A payload recorded on a node state or batch output.
///
/// Small payloads are stored inline; payloads over the recorder's
/// externalization threshold live in the payload store and are referenced
/// by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "storage")]
pub enum PayloadSlot {
    /// No payload (e.g. the input of a source node state).
    Absent,
    /// Payload stored inline in the audit record.
    Inline { data: Value },
    /// Payload externalized to the payload store.
    External { reference: PayloadRef },
}

impl PayloadSlot {
    /// Inline data, if present.
    #[must_use]
    pub fn inline(&self) -> Option<&Value> {
        match self {
            Self::Inline { data } => Some(data),
            _ => None,
        }
    }

    /// External reference, if present.
    #[must_use]
    pub fn external(&self) -> Option<&PayloadRef> {
        match self {
            Self::External { reference } => Some(reference),
            _ => None,
        }
    }
}

/// A single execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// `stable_hash` of the resolved pipeline configuration.
    pub config_hash: String,
    /// Canonicalization scheme the run's hashes were produced under.
    pub canonical_version: String,
}

/// A compiled graph vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub plugin_name: String,
    pub node_type: NodeType,
    pub plugin_version: String,
    pub determinism: Determinism,
    /// Original plugin options as configured.
    pub config: Value,
    pub config_hash: String,
    pub input_schema_hash: Option<String>,
    pub output_schema_hash: Option<String>,
    /// Position along the linear spine, where applicable.
    pub sequence: Option<u32>,
}

/// A directed graph edge.
///
/// `label` is a route label (`"continue"`, `"suspicious"`, ...), never a
/// sink name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub edge_id: EdgeId,
    pub run_id: RunId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub label: String,
    pub mode: RouteMode,
}

/// The unit of source data; persists across token forks and expansions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub row_id: RowId,
    pub run_id: RunId,
    pub source_node_id: NodeId,
    /// Ordinal of this row within its source.
    pub row_index: u64,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// One row instance flowing along one DAG path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: TokenId,
    pub row_id: RowId,
    pub created_at: DateTime<Utc>,
    pub fork_group_id: Option<ForkGroupId>,
    pub join_group_id: Option<JoinGroupId>,
    pub expand_group_id: Option<ExpandGroupId>,
    pub branch_name: Option<String>,
    pub step_in_pipeline: Option<u32>,
}

/// Parent/child lineage edge between tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParent {
    pub token_id: TokenId,
    pub parent_token_id: TokenId,
    pub ordinal: u32,
}

/// One attempt of one token at one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub state_id: StateId,
    pub token_id: TokenId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub status: NodeStateStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    pub input_payload: PayloadSlot,
    pub output_payload: PayloadSlot,
    pub duration_ms: Option<u64>,
    pub error_json: Option<Value>,
    pub context_before: Option<Value>,
    pub context_after: Option<Value>,
    /// Index of the stage within the work item's path.
    pub step_index: u32,
}

/// A gate decision, including `continue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub event_id: EventId,
    pub state_id: StateId,
    pub kind: RoutingKind,
    /// Ordered route labels or sink identifiers.
    pub destinations: Vec<String>,
    pub mode: RouteMode,
    /// Immutable decision rationale as supplied by the gate.
    pub reason: Value,
    pub recorded_at: DateTime<Utc>,
}

/// A group of input tokens absorbed by an aggregation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_json: Option<Value>,
}

/// Membership of one input token in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub batch_id: BatchId,
    pub token_id: TokenId,
    pub ordinal: u32,
}

/// One row a batch produced on flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub batch_id: BatchId,
    pub ordinal: u32,
    pub data_hash: String,
    pub payload: PayloadSlot,
}

/// An externally observable write by a sink. Recorded only on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub state_id: StateId,
    /// `file`, `database`, `webhook`, ...
    pub kind: String,
    pub path_or_uri: String,
    pub content_hash: Option<String>,
    pub size_bytes: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// A source-side quarantine record for a row that never became a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub run_id: RunId,
    pub source_node_id: NodeId,
    pub row_index: u64,
    pub reason: String,
    /// Externalized raw row, when retained.
    pub raw_data_ref: Option<PayloadRef>,
    pub recorded_at: DateTime<Utc>,
}

/// An outbound call made by a transform, recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub state_id: StateId,
    /// Logical target, e.g. an API name or URL template.
    pub target: String,
    pub request_hash: Option<String>,
    pub response_hash: Option<String>,
    pub status: String,
    pub duration_ms: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}
