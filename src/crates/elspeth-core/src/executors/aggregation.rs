//! Aggregation executor
//!
//! Owns the per-node row buffer, the batch protocol, and the flush
//! semantics for the three output modes. All mutable state lives behind
//! one async mutex, so the executor is safe to share across workers.
//!
//! Batch protocol: the first buffered row creates a `draft` batch and
//! every accepted token's membership is recorded before any flush. On
//! flush the batch transitions `draft → executing`, outputs are recorded,
//! then `executing → completed`; on failure every buffered token fails
//! atomically with the batch.
//!
//! | mode          | input tokens              | outputs                    |
//! |---------------|---------------------------|----------------------------|
//! | `single`      | consumed                  | 1 row on the trigger token |
//! | `passthrough` | continue with their rows  | N rows for N inputs        |
//! | `transform`   | consumed                  | M rows as expanded tokens  |

use std::time::Instant;

use serde_json::json;
use tokio::sync::Mutex;

use elspeth_landscape::{BatchId, BatchStatus, NodeId, NodeOutput, NodeStateStatus};

use super::ExecutorEnv;
use crate::config::{AggregationOutputMode, TriggerConfig};
use crate::error::{EngineError, Result};
use crate::plugin::{AggregationPlugin, PluginContext};
use crate::telemetry::{TelemetryEvent, TelemetryEventType};
use crate::tokens::Token;

/// What an aggregation step did with a token.
#[derive(Debug)]
pub enum AggregationOutcome {
    /// Absorbed into the open batch; no downstream work yet.
    Buffered,
    /// The plugin declined the row; the token continues unmodified.
    Skipped(Token),
    /// A flush ran; these tokens continue downstream with their new rows.
    Flushed(Vec<Token>),
}

struct Buffered {
    token: Token,
    ordinal: u32,
}

struct Inner {
    plugin: Box<dyn AggregationPlugin>,
    buffer: Vec<Buffered>,
    batch_id: Option<BatchId>,
    opened_at: Option<Instant>,
    buffered_bytes: usize,
}

/// Guards one aggregation node's buffer and drives its flushes.
pub struct AggregationExecutor {
    node_id: NodeId,
    plugin_name: String,
    trigger: TriggerConfig,
    output_mode: AggregationOutputMode,
    inner: Mutex<Inner>,
}

impl AggregationExecutor {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        plugin: Box<dyn AggregationPlugin>,
        trigger: TriggerConfig,
        output_mode: AggregationOutputMode,
    ) -> Self {
        let plugin_name = plugin.name().to_string();
        Self {
            node_id,
            plugin_name,
            trigger,
            output_mode,
            inner: Mutex::new(Inner {
                plugin,
                buffer: Vec::new(),
                batch_id: None,
                opened_at: None,
                buffered_bytes: 0,
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Offers one token to the buffer, flushing when a trigger fires.
    pub async fn accept(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        token: Token,
        step_index: u32,
    ) -> Result<AggregationOutcome> {
        let mut inner = self.inner.lock().await;
        let accept = inner
            .plugin
            .accept(token.data.clone(), ctx)
            .await
            .map_err(|e| EngineError::Batch {
                stage: self.plugin_name.clone(),
                message: format!("accept failed: {e}"),
            })?;
        if !accept.accepted {
            return Ok(AggregationOutcome::Skipped(token));
        }

        // First member opens the batch; membership is recorded eagerly.
        let batch_id = match inner.batch_id {
            Some(batch_id) => batch_id,
            None => {
                let batch = env.landscape.create_batch(env.run_id, self.node_id).await?;
                inner.batch_id = Some(batch.batch_id);
                inner.opened_at = Some(Instant::now());
                self.emit_batch_event(env, batch.batch_id, BatchStatus::Draft).await;
                batch.batch_id
            }
        };
        let ordinal = inner.buffer.len() as u32;
        env.landscape
            .add_batch_member(batch_id, token.token_id, ordinal)
            .await?;
        inner.buffered_bytes += serde_json::to_vec(&token.data).map(|b| b.len()).unwrap_or(0);
        inner.buffer.push(Buffered { token, ordinal });

        if self.should_flush(&inner, accept.trigger) {
            let flushed = self.flush_locked(env, ctx, &mut inner, step_index).await?;
            return Ok(AggregationOutcome::Flushed(flushed));
        }
        Ok(AggregationOutcome::Buffered)
    }

    fn should_flush(&self, inner: &Inner, plugin_trigger: bool) -> bool {
        if plugin_trigger || inner.plugin.should_trigger() {
            return true;
        }
        if let Some(count) = self.trigger.count {
            if inner.buffer.len() >= count {
                return true;
            }
        }
        if let Some(max_bytes) = self.trigger.max_bytes {
            if inner.buffered_bytes >= max_bytes {
                return true;
            }
        }
        if let (Some(max_duration), Some(opened_at)) = (self.trigger.max_duration, inner.opened_at)
        {
            if opened_at.elapsed() >= max_duration {
                return true;
            }
        }
        false
    }

    /// Flushes a non-empty buffer regardless of trigger state. Called at
    /// source exhaustion.
    pub async fn flush_pending(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        step_index: u32,
    ) -> Result<Vec<Token>> {
        let mut inner = self.inner.lock().await;
        if inner.buffer.is_empty() {
            return Ok(Vec::new());
        }
        self.flush_locked(env, ctx, &mut inner, step_index).await
    }

    async fn flush_locked(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        inner: &mut Inner,
        step_index: u32,
    ) -> Result<Vec<Token>> {
        let batch_id = inner
            .batch_id
            .ok_or_else(|| EngineError::Internal("flush without an open batch".to_string()))?;
        env.landscape
            .update_batch_status(batch_id, BatchStatus::Executing, None)
            .await?;
        self.emit_batch_event(env, batch_id, BatchStatus::Executing).await;

        let started = Instant::now();
        let flush_result = inner.plugin.flush(ctx).await;
        let rows = match flush_result {
            Ok(rows) => rows,
            Err(err) => {
                return self
                    .fail_batch(env, inner, batch_id, format!("flush failed: {err}"))
                    .await;
            }
        };

        // Passthrough cardinality is a hard contract.
        if self.output_mode == AggregationOutputMode::Passthrough
            && rows.len() != inner.buffer.len()
        {
            let message = format!(
                "passthrough flush returned {} rows for {} buffered inputs",
                rows.len(),
                inner.buffer.len()
            );
            return self.fail_batch(env, inner, batch_id, message).await;
        }
        if rows.is_empty() {
            return self
                .fail_batch(env, inner, batch_id, "flush produced no rows".to_string())
                .await;
        }

        for (ordinal, row) in rows.iter().enumerate() {
            env.landscape
                .record_batch_output(batch_id, ordinal as u32, row)
                .await?;
        }

        let emitted = match self.output_mode {
            AggregationOutputMode::Single => {
                let trigger = inner.buffer.last().expect("non-empty buffer");
                let row = rows.into_iter().next().expect("one output row");
                let state = env
                    .open_state(
                        trigger.token.token_id,
                        self.node_id,
                        step_index,
                        1,
                        Some(&trigger.token.data),
                    )
                    .await?;
                env.close_state(
                    &state,
                    NodeStateStatus::Completed,
                    Some(NodeOutput::Single(row.clone())),
                    started,
                    None,
                )
                .await?;
                let mut carrier = trigger.token.clone();
                carrier.data = row;
                vec![carrier]
            }
            AggregationOutputMode::Passthrough => {
                let mut emitted = Vec::with_capacity(inner.buffer.len());
                for (buffered, row) in inner.buffer.iter().zip(rows) {
                    let state = env
                        .open_state(
                            buffered.token.token_id,
                            self.node_id,
                            step_index,
                            1,
                            Some(&buffered.token.data),
                        )
                        .await?;
                    env.close_state(
                        &state,
                        NodeStateStatus::Completed,
                        Some(NodeOutput::Single(row.clone())),
                        started,
                        None,
                    )
                    .await?;
                    let mut token = buffered.token.clone();
                    token.data = row;
                    emitted.push(token);
                }
                emitted
            }
            AggregationOutputMode::Transform => {
                let trigger = inner.buffer.last().expect("non-empty buffer");
                let state = env
                    .open_state(
                        trigger.token.token_id,
                        self.node_id,
                        step_index,
                        1,
                        Some(&trigger.token.data),
                    )
                    .await?;
                env.close_state(
                    &state,
                    NodeStateStatus::Completed,
                    Some(NodeOutput::Multi(rows.clone())),
                    started,
                    None,
                )
                .await?;
                let children = env.tokens.expand(&trigger.token, rows, step_index).await?;
                env.telemetry
                    .handle_event(
                        TelemetryEvent::new(TelemetryEventType::TokenExpanded, env.run_id)
                            .with_node(self.node_id)
                            .with_token(trigger.token.token_id)
                            .with_detail(json!({"children": children.len()})),
                    )
                    .await;
                children
            }
        };

        env.landscape
            .update_batch_status(batch_id, BatchStatus::Completed, None)
            .await?;
        self.emit_batch_event(env, batch_id, BatchStatus::Completed).await;
        tracing::debug!(
            stage = %self.plugin_name,
            batch_id = %batch_id,
            emitted = emitted.len(),
            "batch flushed"
        );

        inner.plugin.reset();
        inner.buffer.clear();
        inner.batch_id = None;
        inner.opened_at = None;
        inner.buffered_bytes = 0;
        Ok(emitted)
    }

    async fn fail_batch(
        &self,
        env: &ExecutorEnv,
        inner: &mut Inner,
        batch_id: BatchId,
        message: String,
    ) -> Result<Vec<Token>> {
        env.landscape
            .update_batch_status(batch_id, BatchStatus::Failed, Some(json!({"error": message})))
            .await?;
        self.emit_batch_event(env, batch_id, BatchStatus::Failed).await;
        inner.plugin.reset();
        inner.buffer.clear();
        inner.batch_id = None;
        inner.opened_at = None;
        inner.buffered_bytes = 0;
        Err(EngineError::Batch {
            stage: self.plugin_name.clone(),
            message,
        })
    }

    async fn emit_batch_event(&self, env: &ExecutorEnv, batch_id: BatchId, status: BatchStatus) {
        env.telemetry
            .handle_event(
                TelemetryEvent::new(TelemetryEventType::BatchStatusChanged, env.run_id)
                    .with_node(self.node_id)
                    .with_detail(json!({
                        "batch_id": batch_id.to_string(),
                        "status": status.as_str(),
                    })),
            )
            .await;
    }

    pub async fn on_register(&self, ctx: &PluginContext) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .plugin
            .on_register(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.plugin_name.clone(),
                message: e.to_string(),
            })
    }

    pub async fn on_start(&self, ctx: &PluginContext) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .plugin
            .on_start(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.plugin_name.clone(),
                message: e.to_string(),
            })
    }

    /// Best-effort close; errors are logged, not propagated.
    pub async fn on_complete(&self, ctx: &PluginContext) {
        let mut inner = self.inner.lock().await;
        if let Err(err) = inner.plugin.on_complete(ctx).await {
            tracing::warn!(stage = %self.plugin_name, error = %err, "aggregation close failed");
        }
    }
}
