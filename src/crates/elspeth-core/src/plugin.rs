//! Plugin protocol surface
//!
//! Six protocols - source, transform, gate, aggregation, coalesce, sink -
//! each an async trait with a small descriptor surface (`name`,
//! `plugin_version`, `determinism`, schemas) and optional lifecycle hooks.
//! Concrete plugin implementations and their discovery/registration live
//! outside this crate; the engine programs against these traits only.
//!
//! # Trust model
//!
//! Validation lives at the edges and nowhere else:
//!
//! 1. **Sources are trust boundaries.** They declare an output schema; the
//!    orchestrator validates every incoming row against it in strict mode
//!    and quarantines or discards failures per
//!    [`ValidationFailurePolicy`].
//! 2. **Transforms and gates trust their inputs.** The DAG compiler proved
//!    the schemas line up; a mismatch at runtime is an upstream bug and
//!    crashes the run via [`PluginError::Type`].
//! 3. **Sinks revalidate only if their external system demands it.**
//!
//! The engine enforces exactly one structural rule: sources must declare a
//! schema. It never inserts validators between internal stages.
//!
//! # Statefulness
//!
//! Transforms, gates, and coalesces are stateless across calls and take
//! `&self`; the engine shares them freely between workers. Sources, sinks,
//! and aggregations are stateful (`&mut self`) and are serialized behind
//! their executors.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use elspeth_landscape::{
    CallSpec, Determinism, Landscape, NodeId, PayloadStore, RunId, StateId,
};

use crate::error::{PluginError, PluginResult};
use crate::rate_limit::RateLimiter;
use crate::results::{AcceptResult, GateResult, SinkReceipt, TransformResult};
use crate::schema::Schema;

/// What to do with a source row that fails schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValidationFailurePolicy {
    /// Record the failure and drop the raw row.
    #[default]
    Discard,
    /// Record the failure and write the raw row through the named sink.
    Quarantine(String),
}

/// Runtime context handed to every plugin call.
///
/// Carries identity, resolved options, and optional handles into the audit
/// machinery. All handles are optional: a plugin must behave identically
/// whether or not a recorder or payload store is attached.
#[derive(Clone)]
pub struct PluginContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub plugin_name: String,
    /// Resolved plugin options from the configuration.
    pub config: Value,
    landscape: Option<Arc<dyn Landscape>>,
    payload_store: Option<Arc<dyn PayloadStore>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    /// The node state currently open for this call, when one exists.
    state_id: Option<StateId>,
}

impl PluginContext {
    #[must_use]
    pub fn new(run_id: RunId, node_id: NodeId, plugin_name: &str, config: Value) -> Self {
        Self {
            run_id,
            node_id,
            plugin_name: plugin_name.to_string(),
            config,
            landscape: None,
            payload_store: None,
            rate_limiter: None,
            state_id: None,
        }
    }

    #[must_use]
    pub fn with_landscape(mut self, landscape: Arc<dyn Landscape>) -> Self {
        self.landscape = Some(landscape);
        self
    }

    #[must_use]
    pub fn with_payload_store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.payload_store = Some(store);
        self
    }

    #[must_use]
    pub(crate) fn with_state(mut self, state_id: StateId) -> Self {
        self.state_id = Some(state_id);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn payload_store(&self) -> Option<&Arc<dyn PayloadStore>> {
        self.payload_store.as_ref()
    }

    /// Blocks until the shared limiter grants `tokens` for `category`.
    /// A no-op when no limiter is attached.
    pub async fn rate_limit(&self, category: &str, tokens: f64) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(category, tokens).await;
        }
    }

    /// Opens a tracing span for a sub-operation. A no-op sink applies when
    /// no subscriber is installed.
    #[must_use]
    pub fn start_span(&self, name: &'static str) -> tracing::Span {
        tracing::info_span!(
            "plugin_op",
            op = name,
            plugin = %self.plugin_name,
            node_id = %self.node_id
        )
    }

    /// Records an outbound call in the audit trail, attached to the
    /// currently open node state.
    pub async fn record_call(
        &self,
        target: &str,
        request: Option<Value>,
        response: Option<Value>,
        status: &str,
        duration_ms: Option<u64>,
    ) -> PluginResult<()> {
        let (Some(landscape), Some(state_id)) = (&self.landscape, self.state_id) else {
            return Ok(());
        };
        landscape
            .record_call(CallSpec {
                state_id,
                target: target.to_string(),
                request,
                response,
                status: status.to_string(),
                duration_ms,
            })
            .await
            .map_err(|e| PluginError::Fatal(format!("call record failed: {e}")))?;
        Ok(())
    }
}

/// Yields rows into the pipeline. The only stage allowed to read the
/// outside world unvalidated, which is why it must declare a schema.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }

    /// Declared shape of emitted rows. Mandatory for sources.
    fn output_schema(&self) -> &Schema;

    /// Policy for rows that fail schema validation.
    fn on_validation_failure(&self) -> ValidationFailurePolicy {
        ValidationFailurePolicy::Discard
    }

    /// Called once when the node is registered, before `on_start`.
    async fn on_register(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_start(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Pulls the next raw row; `None` once exhausted.
    async fn next_row(&mut self, ctx: &PluginContext) -> PluginResult<Option<Value>>;

    async fn on_complete(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

/// Rewrites rows one at a time. Trusts its input per the trust model.
#[async_trait]
pub trait TransformPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> Option<&Schema> {
        None
    }

    fn output_schema(&self) -> Option<&Schema> {
        None
    }

    /// Whether a multi-row success expands into child tokens. Without
    /// this flag a multi-row result is a programming error.
    fn creates_tokens(&self) -> bool {
        false
    }

    async fn on_register(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn process(&self, row: Value, ctx: &PluginContext) -> PluginResult<TransformResult>;

    async fn on_complete(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

/// Decides where rows go. Produces exactly one routing event per
/// evaluation - silence is forbidden.
#[async_trait]
pub trait GatePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> Option<&Schema> {
        None
    }

    /// Gates pass rows through; their output schema defaults to their
    /// input schema.
    fn output_schema(&self) -> Option<&Schema> {
        self.input_schema()
    }

    async fn on_register(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn evaluate(&self, row: Value, ctx: &PluginContext) -> PluginResult<GateResult>;

    async fn on_complete(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

/// Buffers rows and flushes them as batches. The executor owns the row
/// buffer and batch bookkeeping; the plugin owns the aggregate itself.
#[async_trait]
pub trait AggregationPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> Option<&Schema> {
        None
    }

    fn output_schema(&self) -> Option<&Schema> {
        None
    }

    async fn on_register(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_start(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Offers a row to the current batch.
    async fn accept(&mut self, row: Value, ctx: &PluginContext) -> PluginResult<AcceptResult>;

    /// Whether the plugin's own state demands a flush, checked after each
    /// accept in addition to the configured triggers.
    fn should_trigger(&self) -> bool {
        false
    }

    /// Emits the batch's output rows. Cardinality depends on the
    /// configured output mode; `passthrough` must return exactly as many
    /// rows as were buffered.
    async fn flush(&mut self, ctx: &PluginContext) -> PluginResult<Vec<Value>>;

    /// Clears plugin state after a flush (success or failure).
    fn reset(&mut self);

    async fn on_complete(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

/// Merges forked siblings back into one row.
#[async_trait]
pub trait CoalescePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    async fn on_register(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Merges the arrived branch rows (ordered by branch arrival) into
    /// the joined row.
    async fn merge(&self, rows: Vec<Value>, ctx: &PluginContext) -> PluginResult<Value>;

    async fn on_complete(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

/// Writes rows to the outside world.
#[async_trait]
pub trait SinkPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }

    /// Sinks must be configured with a schema; the engine does not infer
    /// one.
    fn input_schema(&self) -> &Schema;

    /// Whether a write may be safely repeated. Non-idempotent sinks
    /// receive each row at most once per run: the engine will not replay
    /// a sink step on retry.
    fn idempotent(&self) -> bool {
        false
    }

    async fn on_register(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_start(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Writes one row; the receipt becomes the recorded artifact.
    async fn write(&mut self, row: &Value, ctx: &PluginContext) -> PluginResult<SinkReceipt>;

    /// Optional periodic flush.
    async fn flush(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    async fn on_complete(&mut self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}
