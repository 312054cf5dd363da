//! The `Landscape` recorder trait
//!
//! The recorder is the only writer to audit tables. Executors, the token
//! manager, and the orchestrator all go through this trait; nothing else in
//! the engine touches audit state. The trait is async so backends are free
//! to do real I/O, and every operation either commits or fails with an
//! [`AuditError`] the caller must treat as fatal for the enclosing
//! operation - recording failures are never silently swallowed.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryLandscape`](crate::memory::InMemoryLandscape) - reference
//!   implementation, used in tests and when auditing is configured off.
//! - [`SqliteLandscape`](crate::sqlite::SqliteLandscape) - embedded
//!   WAL-mode database for durable audit trails.
//!
//! # Write discipline
//!
//! Every write is an append. The only mutations permitted anywhere in the
//! schema are the documented ones: run `status`/`completed_at`, node-state
//! completion fields, and batch `status`/`completed_at`/`error_json`.
//! Backends must reject a second terminal transition for the same record
//! with [`AuditError::InvariantViolation`].

use async_trait::async_trait;
use serde_json::Value;

use crate::canonical::{canonical_json, stable_hash};
use crate::error::{AuditError, Result};
use crate::ids::{BatchId, NodeId, RowId, RunId, StateId, TokenId};
use crate::payload::PayloadStore;
use crate::records::{
    Artifact, Batch, BatchMember, BatchOutput, BatchStatus, CallRecord, Determinism, EdgeRecord,
    NodeRecord, NodeState, NodeStateStatus, NodeType, PayloadKind, PayloadRef, PayloadSlot,
    RouteMode, RoutingEvent, RoutingKind, RowRecord, Run, RunStatus, TokenParent, TokenRecord,
    ValidationFailure,
};

/// Default externalization threshold for inline payloads.
pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 8 * 1024;

/// Parameters for registering a graph vertex.
///
/// `node_id` is the compiler's explicit ID for the vertex; the recorder
/// never invents node identity. Registration is idempotent within a run,
/// keyed on `(run_id, plugin_name, node_type, config_hash, sequence)`:
/// re-registering the same identity tuple returns the original record.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub plugin_name: String,
    pub node_type: NodeType,
    pub plugin_version: String,
    pub determinism: Determinism,
    pub config: Value,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub sequence: Option<u32>,
}

/// Parameters for opening a node state.
#[derive(Debug, Clone)]
pub struct NodeStateStart {
    pub token_id: TokenId,
    pub node_id: NodeId,
    pub step_index: u32,
    pub attempt: u32,
    /// `None` for sources, which have no upstream input.
    pub input_data: Option<Value>,
    pub context_before: Option<Value>,
}

/// Output carried by a completed node state.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Single-row output.
    Single(Value),
    /// Multi-row output (expansion or aggregation flush). The recorded
    /// hash is the hash of the whole list.
    Multi(Vec<Value>),
}

impl NodeOutput {
    /// The output as one JSON value (multi-row outputs hash as a list).
    #[must_use]
    pub fn as_value(&self) -> Value {
        match self {
            Self::Single(row) => row.clone(),
            Self::Multi(rows) => Value::Array(rows.clone()),
        }
    }
}

/// Parameters for closing a node state.
#[derive(Debug, Clone)]
pub struct NodeStateCompletion {
    pub status: NodeStateStatus,
    pub output: Option<NodeOutput>,
    pub duration_ms: u64,
    pub error: Option<Value>,
    pub context_after: Option<Value>,
}

/// Parameters for recording a sink artifact.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub state_id: StateId,
    pub kind: String,
    pub path_or_uri: String,
    pub content_hash: Option<String>,
    pub size_bytes: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// Parameters for recording an outbound call made by a transform.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub state_id: StateId,
    pub target: String,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub status: String,
    pub duration_ms: Option<u64>,
}

/// Append-only audit recorder.
///
/// See the module docs for the write discipline. Read methods exist solely
/// for the explain/outcome read model and for tests; they never mutate.
#[async_trait]
pub trait Landscape: Send + Sync {
    // --- run lifecycle ---

    /// Opens a run, hashing the resolved configuration.
    async fn begin_run(&self, config: &Value, canonical_version: &str) -> Result<Run>;

    /// Terminates a run exactly once.
    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> Result<()>;

    // --- graph registration ---

    /// Registers a vertex; idempotent within a run.
    async fn register_node(&self, registration: NodeRegistration) -> Result<NodeRecord>;

    /// Registers an edge; idempotent within a run keyed on
    /// `(run_id, from, to, label)`.
    async fn register_edge(
        &self,
        run_id: RunId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        label: &str,
        mode: RouteMode,
    ) -> Result<EdgeRecord>;

    // --- rows and tokens ---

    /// Records a source row.
    async fn create_row(
        &self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        data: &Value,
    ) -> Result<RowRecord>;

    /// Creates the seed token for a row.
    async fn create_token(&self, row_id: RowId) -> Result<TokenRecord>;

    /// Creates one child token per branch, sharing a fresh `fork_group_id`.
    /// Each child gets a `TokenParent` row whose ordinal is its branch
    /// position.
    async fn fork_tokens(
        &self,
        parent_token_id: TokenId,
        branches: &[String],
        step_in_pipeline: Option<u32>,
    ) -> Result<Vec<TokenRecord>>;

    /// Creates `count` children sharing a fresh `expand_group_id`, each with
    /// a single `TokenParent` row whose ordinal is the child's position.
    async fn expand_token(
        &self,
        parent_token_id: TokenId,
        row_id: RowId,
        count: u32,
        step_in_pipeline: Option<u32>,
    ) -> Result<Vec<TokenRecord>>;

    /// Creates one token with every input recorded as a `TokenParent`,
    /// sharing a fresh `join_group_id`.
    async fn join_tokens(
        &self,
        parent_token_ids: &[TokenId],
        row_id: RowId,
        branch_name: &str,
        step_in_pipeline: Option<u32>,
    ) -> Result<TokenRecord>;

    // --- node states ---

    /// Opens an attempt. Fails if a `running` state already exists for the
    /// same `(token_id, node_id)`.
    async fn begin_node_state(&self, start: NodeStateStart) -> Result<NodeState>;

    /// Closes an attempt. Fails if the state is already terminal.
    async fn complete_node_state(
        &self,
        state_id: StateId,
        completion: NodeStateCompletion,
    ) -> Result<()>;

    // --- routing ---

    /// Records a gate decision. Gates call this exactly once per
    /// invocation, including for `continue`.
    async fn record_routing_event(
        &self,
        state_id: StateId,
        kind: RoutingKind,
        destinations: &[String],
        mode: RouteMode,
        reason: &Value,
    ) -> Result<RoutingEvent>;

    // --- batches ---

    async fn create_batch(&self, run_id: RunId, node_id: NodeId) -> Result<Batch>;

    /// Records a token's membership eagerly, before any flush. A token may be a
    /// member of at most one batch per node.
    async fn add_batch_member(
        &self,
        batch_id: BatchId,
        token_id: TokenId,
        ordinal: u32,
    ) -> Result<()>;

    /// Transitions batch status along `draft → executing → completed|failed`.
    async fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        error: Option<Value>,
    ) -> Result<()>;

    /// Records one flush output row. Only legal while the batch is
    /// `executing`.
    async fn record_batch_output(
        &self,
        batch_id: BatchId,
        ordinal: u32,
        data: &Value,
    ) -> Result<BatchOutput>;

    // --- artifacts, quarantine, calls ---

    /// Records a sink artifact. Written only on sink success.
    async fn record_artifact(&self, spec: ArtifactSpec) -> Result<Artifact>;

    /// Records a source-side quarantine for a row that never became a token.
    async fn record_validation_failure(
        &self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        reason: &str,
        raw_data: Option<&Value>,
    ) -> Result<()>;

    /// Records an outbound call made by a transform.
    async fn record_call(&self, spec: CallSpec) -> Result<CallRecord>;

    // --- read model (explain + tests) ---

    async fn get_run(&self, run_id: RunId) -> Result<Run>;
    async fn get_node(&self, node_id: NodeId) -> Result<NodeRecord>;
    async fn nodes_for_run(&self, run_id: RunId) -> Result<Vec<NodeRecord>>;
    async fn edges_for_run(&self, run_id: RunId) -> Result<Vec<EdgeRecord>>;
    async fn rows_for_run(&self, run_id: RunId) -> Result<Vec<RowRecord>>;
    async fn tokens_for_run(&self, run_id: RunId) -> Result<Vec<TokenRecord>>;
    async fn get_token(&self, token_id: TokenId) -> Result<TokenRecord>;
    async fn states_for_token(&self, token_id: TokenId) -> Result<Vec<NodeState>>;
    async fn routing_events_for_state(&self, state_id: StateId) -> Result<Vec<RoutingEvent>>;
    async fn batches_for_run(&self, run_id: RunId) -> Result<Vec<Batch>>;
    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch>;
    async fn batch_members(&self, batch_id: BatchId) -> Result<Vec<BatchMember>>;
    async fn batch_outputs(&self, batch_id: BatchId) -> Result<Vec<BatchOutput>>;
    /// Batches this token is a member of.
    async fn batch_membership(&self, token_id: TokenId) -> Result<Vec<BatchMember>>;
    async fn token_parents(&self, token_id: TokenId) -> Result<Vec<TokenParent>>;
    async fn children_of(&self, token_id: TokenId) -> Result<Vec<TokenId>>;
    async fn artifacts_for_state(&self, state_id: StateId) -> Result<Vec<Artifact>>;
    async fn calls_for_state(&self, state_id: StateId) -> Result<Vec<CallRecord>>;
    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>>;
    async fn validation_failures(&self, run_id: RunId) -> Result<Vec<ValidationFailure>>;
}

/// Hashes a payload and decides inline vs externalized storage.
///
/// Shared by both recorder backends. Returns the stable hash of the value
/// and the slot to persist.
pub async fn store_payload(
    store: &dyn PayloadStore,
    inline_threshold_bytes: usize,
    kind: PayloadKind,
    value: &Value,
) -> Result<(String, PayloadSlot)> {
    let bytes = canonical_json(value)?;
    let hash = stable_hash(value)?;
    if bytes.len() <= inline_threshold_bytes {
        return Ok((
            hash,
            PayloadSlot::Inline {
                data: value.clone(),
            },
        ));
    }
    let size_bytes = bytes.len() as u64;
    let stored = store.put(&bytes).await.map_err(AuditError::from)?;
    if stored != hash {
        // put() hashes the canonical bytes, so the two must agree.
        return Err(AuditError::InvariantViolation(format!(
            "payload store returned {stored} for content hashed {hash}"
        )));
    }
    let reference = PayloadRef {
        content_hash: hash.clone(),
        size_bytes,
        kind,
    };
    Ok((hash, PayloadSlot::External { reference }))
}
