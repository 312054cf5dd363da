//! In-memory landscape recorder
//!
//! **[`InMemoryLandscape`]** is the reference implementation of the
//! [`Landscape`] trait: every invariant the audit schema promises is
//! enforced here in plain Rust, and the SQLite backend mirrors this
//! behavior. It is used by the test suite and by runs configured with
//! auditing disabled, where lineage is still tracked for the duration of
//! the process but dropped at exit.
//!
//! All tables live behind a single `tokio::sync::RwLock`; recorder calls
//! are short and the lock is never held across an `.await` into plugin
//! code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::canonical::{self, stable_hash};
use crate::error::{AuditError, Result};
use crate::ids::{
    ArtifactId, BatchId, CallId, EdgeId, EventId, ExpandGroupId, ForkGroupId, JoinGroupId, NodeId,
    RowId, RunId, StateId, TokenId,
};
use crate::payload::{InMemoryPayloadStore, PayloadStore};
use crate::records::{
    Artifact, Batch, BatchMember, BatchOutput, BatchStatus, CallRecord, EdgeRecord, NodeRecord,
    NodeState, NodeStateStatus, PayloadKind, PayloadRef, PayloadSlot, RouteMode, RoutingEvent,
    RoutingKind, RowRecord, Run, RunStatus, TokenParent, TokenRecord, ValidationFailure,
};
use crate::recorder::{
    store_payload, ArtifactSpec, CallSpec, Landscape, NodeOutput, NodeRegistration,
    NodeStateCompletion, NodeStateStart, DEFAULT_INLINE_THRESHOLD_BYTES,
};

#[derive(Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    nodes: HashMap<NodeId, NodeRecord>,
    node_index: HashMap<(RunId, String), NodeId>,
    edges: Vec<EdgeRecord>,
    edge_index: HashMap<(RunId, NodeId, NodeId, String), EdgeId>,
    rows: HashMap<RowId, RowRecord>,
    tokens: HashMap<TokenId, TokenRecord>,
    token_parents: Vec<TokenParent>,
    node_states: HashMap<StateId, NodeState>,
    states_by_token: HashMap<TokenId, Vec<StateId>>,
    running_states: HashSet<(TokenId, NodeId)>,
    routing_events: HashMap<StateId, Vec<RoutingEvent>>,
    batches: HashMap<BatchId, Batch>,
    batch_members: HashMap<BatchId, Vec<BatchMember>>,
    member_index: HashMap<(TokenId, NodeId), BatchId>,
    batch_outputs: HashMap<BatchId, Vec<BatchOutput>>,
    artifacts: HashMap<StateId, Vec<Artifact>>,
    validation_failures: Vec<ValidationFailure>,
    calls: Vec<CallRecord>,
}

impl Tables {
    fn run(&self, run_id: RunId) -> Result<&Run> {
        self.runs
            .get(&run_id)
            .ok_or_else(|| AuditError::NotFound(format!("run {run_id}")))
    }

    fn node(&self, node_id: NodeId) -> Result<&NodeRecord> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| AuditError::NotFound(format!("node {node_id}")))
    }

    fn token(&self, token_id: TokenId) -> Result<&TokenRecord> {
        self.tokens
            .get(&token_id)
            .ok_or_else(|| AuditError::NotFound(format!("token {token_id}")))
    }

    fn insert_token(&mut self, token: TokenRecord) -> TokenRecord {
        self.tokens.insert(token.token_id, token.clone());
        token
    }
}

/// In-memory [`Landscape`] backend.
pub struct InMemoryLandscape {
    tables: Arc<RwLock<Tables>>,
    payload_store: Arc<dyn PayloadStore>,
    inline_threshold_bytes: usize,
}

impl InMemoryLandscape {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            payload_store: Arc::new(InMemoryPayloadStore::new()),
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD_BYTES,
        }
    }

    /// Uses an explicit payload store and externalization threshold.
    #[must_use]
    pub fn with_payload_store(
        payload_store: Arc<dyn PayloadStore>,
        inline_threshold_bytes: usize,
    ) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            payload_store,
            inline_threshold_bytes,
        }
    }

    async fn payload_slot(
        &self,
        kind: PayloadKind,
        value: &Value,
    ) -> Result<(String, PayloadSlot)> {
        store_payload(
            self.payload_store.as_ref(),
            self.inline_threshold_bytes,
            kind,
            value,
        )
        .await
    }
}

impl Default for InMemoryLandscape {
    fn default() -> Self {
        Self::new()
    }
}

fn node_identity_key(registration: &NodeRegistration, config_hash: &str) -> String {
    format!(
        "{}|{}|{}|{:?}",
        registration.plugin_name,
        registration.node_type.as_str(),
        config_hash,
        registration.sequence
    )
}

#[async_trait]
impl Landscape for InMemoryLandscape {
    async fn begin_run(&self, config: &Value, canonical_version: &str) -> Result<Run> {
        let run = Run {
            run_id: RunId::generate(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            config_hash: stable_hash(config)?,
            canonical_version: canonical_version.to_string(),
        };
        self.tables.write().await.runs.insert(run.run_id, run.clone());
        tracing::debug!(run_id = %run.run_id, config_hash = %run.config_hash, "run opened");
        Ok(run)
    }

    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AuditError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Err(AuditError::InvariantViolation(format!(
                "run {run_id} already terminated as {}",
                run.status.as_str()
            )));
        }
        run.status = status;
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn register_node(&self, registration: NodeRegistration) -> Result<NodeRecord> {
        let config_hash = stable_hash(&registration.config)?;
        let mut tables = self.tables.write().await;
        tables.run(registration.run_id)?;
        let key = (
            registration.run_id,
            node_identity_key(&registration, &config_hash),
        );
        if let Some(existing) = tables.node_index.get(&key) {
            return Ok(tables.nodes[existing].clone());
        }
        let input_schema_hash = registration
            .input_schema
            .as_ref()
            .map(stable_hash)
            .transpose()?;
        let output_schema_hash = registration
            .output_schema
            .as_ref()
            .map(stable_hash)
            .transpose()?;
        let node = NodeRecord {
            node_id: registration.node_id,
            run_id: registration.run_id,
            plugin_name: registration.plugin_name,
            node_type: registration.node_type,
            plugin_version: registration.plugin_version,
            determinism: registration.determinism,
            config: registration.config,
            config_hash,
            input_schema_hash,
            output_schema_hash,
            sequence: registration.sequence,
        };
        tables.node_index.insert(key, node.node_id);
        tables.nodes.insert(node.node_id, node.clone());
        Ok(node)
    }

    async fn register_edge(
        &self,
        run_id: RunId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        label: &str,
        mode: RouteMode,
    ) -> Result<EdgeRecord> {
        if from_node_id == to_node_id {
            return Err(AuditError::InvariantViolation(format!(
                "self-loop on node {from_node_id}"
            )));
        }
        let mut tables = self.tables.write().await;
        tables.run(run_id)?;
        tables.node(from_node_id)?;
        tables.node(to_node_id)?;
        let key = (run_id, from_node_id, to_node_id, label.to_string());
        if let Some(edge_id) = tables.edge_index.get(&key) {
            let existing = tables
                .edges
                .iter()
                .find(|e| e.edge_id == *edge_id)
                .expect("indexed edge exists");
            return Ok(existing.clone());
        }
        let edge = EdgeRecord {
            edge_id: EdgeId::generate(),
            run_id,
            from_node_id,
            to_node_id,
            label: label.to_string(),
            mode,
        };
        tables.edge_index.insert(key, edge.edge_id);
        tables.edges.push(edge.clone());
        Ok(edge)
    }

    async fn create_row(
        &self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        data: &Value,
    ) -> Result<RowRecord> {
        let mut tables = self.tables.write().await;
        tables.run(run_id)?;
        tables.node(source_node_id)?;
        let row = RowRecord {
            row_id: RowId::generate(),
            run_id,
            source_node_id,
            row_index,
            data: data.clone(),
            created_at: Utc::now(),
        };
        tables.rows.insert(row.row_id, row.clone());
        Ok(row)
    }

    async fn create_token(&self, row_id: RowId) -> Result<TokenRecord> {
        let mut tables = self.tables.write().await;
        if !tables.rows.contains_key(&row_id) {
            return Err(AuditError::NotFound(format!("row {row_id}")));
        }
        let token = TokenRecord {
            token_id: TokenId::generate(),
            row_id,
            created_at: Utc::now(),
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: None,
        };
        Ok(tables.insert_token(token))
    }

    async fn fork_tokens(
        &self,
        parent_token_id: TokenId,
        branches: &[String],
        step_in_pipeline: Option<u32>,
    ) -> Result<Vec<TokenRecord>> {
        let mut tables = self.tables.write().await;
        let row_id = tables.token(parent_token_id)?.row_id;
        let fork_group_id = ForkGroupId::generate();
        let mut children = Vec::with_capacity(branches.len());
        for (ordinal, branch) in branches.iter().enumerate() {
            let token = TokenRecord {
                token_id: TokenId::generate(),
                row_id,
                created_at: Utc::now(),
                fork_group_id: Some(fork_group_id),
                join_group_id: None,
                expand_group_id: None,
                branch_name: Some(branch.clone()),
                step_in_pipeline,
            };
            tables.token_parents.push(TokenParent {
                token_id: token.token_id,
                parent_token_id,
                ordinal: ordinal as u32,
            });
            children.push(tables.insert_token(token));
        }
        Ok(children)
    }

    async fn expand_token(
        &self,
        parent_token_id: TokenId,
        row_id: RowId,
        count: u32,
        step_in_pipeline: Option<u32>,
    ) -> Result<Vec<TokenRecord>> {
        let mut tables = self.tables.write().await;
        tables.token(parent_token_id)?;
        if !tables.rows.contains_key(&row_id) {
            return Err(AuditError::NotFound(format!("row {row_id}")));
        }
        let expand_group_id = ExpandGroupId::generate();
        let mut children = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let token = TokenRecord {
                token_id: TokenId::generate(),
                row_id,
                created_at: Utc::now(),
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: Some(expand_group_id),
                branch_name: None,
                step_in_pipeline,
            };
            tables.token_parents.push(TokenParent {
                token_id: token.token_id,
                parent_token_id,
                ordinal,
            });
            children.push(tables.insert_token(token));
        }
        Ok(children)
    }

    async fn join_tokens(
        &self,
        parent_token_ids: &[TokenId],
        row_id: RowId,
        branch_name: &str,
        step_in_pipeline: Option<u32>,
    ) -> Result<TokenRecord> {
        if parent_token_ids.is_empty() {
            return Err(AuditError::InvariantViolation(
                "join requires at least one parent token".to_string(),
            ));
        }
        let mut tables = self.tables.write().await;
        for parent in parent_token_ids {
            tables.token(*parent)?;
        }
        let token = TokenRecord {
            token_id: TokenId::generate(),
            row_id,
            created_at: Utc::now(),
            fork_group_id: None,
            join_group_id: Some(JoinGroupId::generate()),
            expand_group_id: None,
            branch_name: Some(branch_name.to_string()),
            step_in_pipeline,
        };
        for (ordinal, parent) in parent_token_ids.iter().enumerate() {
            tables.token_parents.push(TokenParent {
                token_id: token.token_id,
                parent_token_id: *parent,
                ordinal: ordinal as u32,
            });
        }
        Ok(tables.insert_token(token))
    }

    async fn begin_node_state(&self, start: NodeStateStart) -> Result<NodeState> {
        let (input_hash, input_payload) = match &start.input_data {
            Some(data) => {
                let (hash, slot) = self.payload_slot(PayloadKind::Row, data).await?;
                (Some(hash), slot)
            }
            None => (None, PayloadSlot::Absent),
        };
        let mut tables = self.tables.write().await;
        tables.token(start.token_id)?;
        tables.node(start.node_id)?;
        let guard_key = (start.token_id, start.node_id);
        if tables.running_states.contains(&guard_key) {
            return Err(AuditError::InvariantViolation(format!(
                "token {} already has a running state at node {}",
                start.token_id, start.node_id
            )));
        }
        let state = NodeState {
            state_id: StateId::generate(),
            token_id: start.token_id,
            node_id: start.node_id,
            attempt: start.attempt,
            status: NodeStateStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input_hash,
            output_hash: None,
            input_payload,
            output_payload: PayloadSlot::Absent,
            duration_ms: None,
            error_json: None,
            context_before: start.context_before,
            context_after: None,
            step_index: start.step_index,
        };
        tables.running_states.insert(guard_key);
        tables
            .states_by_token
            .entry(start.token_id)
            .or_default()
            .push(state.state_id);
        tables.node_states.insert(state.state_id, state.clone());
        Ok(state)
    }

    async fn complete_node_state(
        &self,
        state_id: StateId,
        completion: NodeStateCompletion,
    ) -> Result<()> {
        if !completion.status.is_terminal() {
            return Err(AuditError::InvariantViolation(
                "complete_node_state requires a terminal status".to_string(),
            ));
        }
        let (output_hash, output_payload) = match &completion.output {
            Some(output) => {
                let value = output.as_value();
                let kind = match output {
                    NodeOutput::Single(_) => PayloadKind::Row,
                    NodeOutput::Multi(_) => PayloadKind::Aggregate,
                };
                let (hash, slot) = self.payload_slot(kind, &value).await?;
                (Some(hash), slot)
            }
            None => (None, PayloadSlot::Absent),
        };
        let mut tables = self.tables.write().await;
        let state = tables
            .node_states
            .get_mut(&state_id)
            .ok_or_else(|| AuditError::NotFound(format!("node state {state_id}")))?;
        if state.status.is_terminal() {
            return Err(AuditError::InvariantViolation(format!(
                "node state {state_id} already terminal as {}",
                state.status.as_str()
            )));
        }
        state.status = completion.status;
        state.completed_at = Some(Utc::now());
        state.output_hash = output_hash;
        state.output_payload = output_payload;
        state.duration_ms = Some(completion.duration_ms);
        state.error_json = completion.error;
        state.context_after = completion.context_after;
        let guard_key = (state.token_id, state.node_id);
        tables.running_states.remove(&guard_key);
        Ok(())
    }

    async fn record_routing_event(
        &self,
        state_id: StateId,
        kind: RoutingKind,
        destinations: &[String],
        mode: RouteMode,
        reason: &Value,
    ) -> Result<RoutingEvent> {
        let mut tables = self.tables.write().await;
        if !tables.node_states.contains_key(&state_id) {
            return Err(AuditError::NotFound(format!("node state {state_id}")));
        }
        let event = RoutingEvent {
            event_id: EventId::generate(),
            state_id,
            kind,
            destinations: destinations.to_vec(),
            mode,
            // Deep copy so later mutation of the caller's value cannot
            // rewrite the recorded reason.
            reason: reason.clone(),
            recorded_at: Utc::now(),
        };
        tables
            .routing_events
            .entry(state_id)
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    async fn create_batch(&self, run_id: RunId, node_id: NodeId) -> Result<Batch> {
        let mut tables = self.tables.write().await;
        tables.run(run_id)?;
        tables.node(node_id)?;
        let batch = Batch {
            batch_id: BatchId::generate(),
            run_id,
            node_id,
            status: BatchStatus::Draft,
            created_at: Utc::now(),
            completed_at: None,
            error_json: None,
        };
        tables.batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    async fn add_batch_member(
        &self,
        batch_id: BatchId,
        token_id: TokenId,
        ordinal: u32,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let node_id = {
            let batch = tables
                .batches
                .get(&batch_id)
                .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
            if batch.status != BatchStatus::Draft {
                return Err(AuditError::InvariantViolation(format!(
                    "batch {batch_id} is {}; members may only join a draft batch",
                    batch.status.as_str()
                )));
            }
            batch.node_id
        };
        tables.token(token_id)?;
        let member_key = (token_id, node_id);
        if let Some(existing) = tables.member_index.get(&member_key) {
            return Err(AuditError::InvariantViolation(format!(
                "token {token_id} is already a member of batch {existing} at node {node_id}"
            )));
        }
        tables.member_index.insert(member_key, batch_id);
        tables
            .batch_members
            .entry(batch_id)
            .or_default()
            .push(BatchMember {
                batch_id,
                token_id,
                ordinal,
            });
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        error: Option<Value>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let batch = tables
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
        let legal = matches!(
            (batch.status, status),
            (BatchStatus::Draft, BatchStatus::Executing)
                | (BatchStatus::Executing, BatchStatus::Completed)
                | (BatchStatus::Executing, BatchStatus::Failed)
                | (BatchStatus::Draft, BatchStatus::Failed)
        );
        if !legal {
            return Err(AuditError::InvariantViolation(format!(
                "illegal batch transition {} -> {}",
                batch.status.as_str(),
                status.as_str()
            )));
        }
        batch.status = status;
        batch.error_json = error;
        if matches!(status, BatchStatus::Completed | BatchStatus::Failed) {
            batch.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_batch_output(
        &self,
        batch_id: BatchId,
        ordinal: u32,
        data: &Value,
    ) -> Result<BatchOutput> {
        let (data_hash, payload) = self.payload_slot(PayloadKind::Aggregate, data).await?;
        let mut tables = self.tables.write().await;
        let batch = tables
            .batches
            .get(&batch_id)
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
        if batch.status != BatchStatus::Executing {
            return Err(AuditError::InvariantViolation(format!(
                "batch {batch_id} is {}; outputs require an executing batch",
                batch.status.as_str()
            )));
        }
        let output = BatchOutput {
            batch_id,
            ordinal,
            data_hash,
            payload,
        };
        tables
            .batch_outputs
            .entry(batch_id)
            .or_default()
            .push(output.clone());
        Ok(output)
    }

    async fn record_artifact(&self, spec: ArtifactSpec) -> Result<Artifact> {
        let mut tables = self.tables.write().await;
        if !tables.node_states.contains_key(&spec.state_id) {
            return Err(AuditError::NotFound(format!("node state {}", spec.state_id)));
        }
        let artifact = Artifact {
            artifact_id: ArtifactId::generate(),
            state_id: spec.state_id,
            kind: spec.kind,
            path_or_uri: spec.path_or_uri,
            content_hash: spec.content_hash,
            size_bytes: spec.size_bytes,
            idempotency_key: spec.idempotency_key,
        };
        tables
            .artifacts
            .entry(spec.state_id)
            .or_default()
            .push(artifact.clone());
        Ok(artifact)
    }

    async fn record_validation_failure(
        &self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        reason: &str,
        raw_data: Option<&Value>,
    ) -> Result<()> {
        let raw_data_ref = match raw_data {
            Some(data) => {
                let bytes = canonical::canonical_json(data)?;
                let hash = self
                    .payload_store
                    .put(&bytes)
                    .await
                    .map_err(AuditError::from)?;
                Some(PayloadRef {
                    content_hash: hash,
                    size_bytes: bytes.len() as u64,
                    kind: PayloadKind::Row,
                })
            }
            None => None,
        };
        let mut tables = self.tables.write().await;
        tables.run(run_id)?;
        tables.node(source_node_id)?;
        tables.validation_failures.push(ValidationFailure {
            run_id,
            source_node_id,
            row_index,
            reason: reason.to_string(),
            raw_data_ref,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn record_call(&self, spec: CallSpec) -> Result<CallRecord> {
        let request_hash = spec.request.as_ref().map(stable_hash).transpose()?;
        let response_hash = spec.response.as_ref().map(stable_hash).transpose()?;
        let mut tables = self.tables.write().await;
        if !tables.node_states.contains_key(&spec.state_id) {
            return Err(AuditError::NotFound(format!("node state {}", spec.state_id)));
        }
        let call = CallRecord {
            call_id: CallId::generate(),
            state_id: spec.state_id,
            target: spec.target,
            request_hash,
            response_hash,
            status: spec.status,
            duration_ms: spec.duration_ms,
            recorded_at: Utc::now(),
        };
        tables.calls.push(call.clone());
        Ok(call)
    }

    // --- read model ---

    async fn get_run(&self, run_id: RunId) -> Result<Run> {
        Ok(self.tables.read().await.run(run_id)?.clone())
    }

    async fn get_node(&self, node_id: NodeId) -> Result<NodeRecord> {
        Ok(self.tables.read().await.node(node_id)?.clone())
    }

    async fn nodes_for_run(&self, run_id: RunId) -> Result<Vec<NodeRecord>> {
        let tables = self.tables.read().await;
        let mut nodes: Vec<NodeRecord> = tables
            .nodes
            .values()
            .filter(|n| n.run_id == run_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.sequence, n.node_id));
        Ok(nodes)
    }

    async fn edges_for_run(&self, run_id: RunId) -> Result<Vec<EdgeRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn rows_for_run(&self, run_id: RunId) -> Result<Vec<RowRecord>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<RowRecord> = tables
            .rows
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.row_index);
        Ok(rows)
    }

    async fn tokens_for_run(&self, run_id: RunId) -> Result<Vec<TokenRecord>> {
        let tables = self.tables.read().await;
        let row_ids: HashSet<RowId> = tables
            .rows
            .values()
            .filter(|r| r.run_id == run_id)
            .map(|r| r.row_id)
            .collect();
        let mut tokens: Vec<TokenRecord> = tables
            .tokens
            .values()
            .filter(|t| row_ids.contains(&t.row_id))
            .cloned()
            .collect();
        tokens.sort_by_key(|t| (t.created_at, t.token_id));
        Ok(tokens)
    }

    async fn get_token(&self, token_id: TokenId) -> Result<TokenRecord> {
        Ok(self.tables.read().await.token(token_id)?.clone())
    }

    async fn states_for_token(&self, token_id: TokenId) -> Result<Vec<NodeState>> {
        let tables = self.tables.read().await;
        let mut states: Vec<NodeState> = tables
            .states_by_token
            .get(&token_id)
            .map(|ids| ids.iter().map(|id| tables.node_states[id].clone()).collect())
            .unwrap_or_default();
        states.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.attempt.cmp(&b.attempt))
        });
        Ok(states)
    }

    async fn routing_events_for_state(&self, state_id: StateId) -> Result<Vec<RoutingEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .routing_events
            .get(&state_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn batches_for_run(&self, run_id: RunId) -> Result<Vec<Batch>> {
        let tables = self.tables.read().await;
        let mut batches: Vec<Batch> = tables
            .batches
            .values()
            .filter(|b| b.run_id == run_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.created_at, b.batch_id));
        Ok(batches)
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
        let tables = self.tables.read().await;
        tables
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))
    }

    async fn batch_members(&self, batch_id: BatchId) -> Result<Vec<BatchMember>> {
        let tables = self.tables.read().await;
        let mut members = tables
            .batch_members
            .get(&batch_id)
            .cloned()
            .unwrap_or_default();
        members.sort_by_key(|m| m.ordinal);
        Ok(members)
    }

    async fn batch_outputs(&self, batch_id: BatchId) -> Result<Vec<BatchOutput>> {
        let tables = self.tables.read().await;
        let mut outputs = tables
            .batch_outputs
            .get(&batch_id)
            .cloned()
            .unwrap_or_default();
        outputs.sort_by_key(|o| o.ordinal);
        Ok(outputs)
    }

    async fn batch_membership(&self, token_id: TokenId) -> Result<Vec<BatchMember>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batch_members
            .values()
            .flatten()
            .filter(|m| m.token_id == token_id)
            .cloned()
            .collect())
    }

    async fn token_parents(&self, token_id: TokenId) -> Result<Vec<TokenParent>> {
        let tables = self.tables.read().await;
        let mut parents: Vec<TokenParent> = tables
            .token_parents
            .iter()
            .filter(|p| p.token_id == token_id)
            .cloned()
            .collect();
        parents.sort_by_key(|p| p.ordinal);
        Ok(parents)
    }

    async fn children_of(&self, token_id: TokenId) -> Result<Vec<TokenId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .token_parents
            .iter()
            .filter(|p| p.parent_token_id == token_id)
            .map(|p| p.token_id)
            .collect())
    }

    async fn artifacts_for_state(&self, state_id: StateId) -> Result<Vec<Artifact>> {
        let tables = self.tables.read().await;
        Ok(tables
            .artifacts
            .get(&state_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn calls_for_state(&self, state_id: StateId) -> Result<Vec<CallRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .calls
            .iter()
            .filter(|c| c.state_id == state_id)
            .cloned()
            .collect())
    }

    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let tables = self.tables.read().await;
        let mut result = Vec::new();
        for (state_id, artifacts) in &tables.artifacts {
            let state = &tables.node_states[state_id];
            let token = &tables.tokens[&state.token_id];
            let row = &tables.rows[&token.row_id];
            if row.run_id == run_id {
                result.extend(artifacts.iter().cloned());
            }
        }
        Ok(result)
    }

    async fn validation_failures(&self, run_id: RunId) -> Result<Vec<ValidationFailure>> {
        let tables = self.tables.read().await;
        Ok(tables
            .validation_failures
            .iter()
            .filter(|v| v.run_id == run_id)
            .cloned()
            .collect())
    }
}
