//! Transform executor
//!
//! Wraps `TransformPlugin::process` with the audit envelope and the retry
//! loop. Each failed-but-retryable attempt is closed as `retried` before
//! the backoff sleep, so the audit trail carries one state per attempt
//! with monotonically increasing `attempt` numbers.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use elspeth_landscape::{NodeId, NodeOutput, NodeStateStatus};

use super::ExecutorEnv;
use crate::error::{EngineError, PluginError, Result};
use crate::plugin::{PluginContext, TransformPlugin};
use crate::results::TransformStatus;
use crate::retry::RetryConfig;
use crate::tokens::Token;

/// What a transform step produced, as seen by the row processor.
#[derive(Debug)]
pub enum TransformOutcome {
    /// Single-row success: the token advances with this row.
    Row(Value),
    /// Multi-row success from a `creates_tokens` transform: expansion.
    Rows(Vec<Value>),
    /// Intentionally excluded; no downstream work item.
    Filtered,
    /// Retries exhausted; the token fails, the run may continue.
    Failed { reason: Value, attempts: u32 },
}

/// Executes transforms with the audit envelope.
pub struct TransformExecutor {
    node_id: NodeId,
    plugin: Arc<dyn TransformPlugin>,
    retry: RetryConfig,
}

impl TransformExecutor {
    #[must_use]
    pub fn new(node_id: NodeId, plugin: Arc<dyn TransformPlugin>, retry: RetryConfig) -> Self {
        Self {
            node_id,
            plugin,
            retry,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub async fn on_register(&self, ctx: &PluginContext) -> Result<()> {
        self.plugin
            .on_register(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.plugin.name().to_string(),
                message: e.to_string(),
            })
    }

    pub async fn on_start(&self, ctx: &PluginContext) -> Result<()> {
        self.plugin
            .on_start(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.plugin.name().to_string(),
                message: e.to_string(),
            })
    }

    /// Best-effort close; errors are logged, not propagated.
    pub async fn on_complete(&self, ctx: &PluginContext) {
        if let Err(err) = self.plugin.on_complete(ctx).await {
            tracing::warn!(stage = self.plugin.name(), error = %err, "transform close failed");
        }
    }

    pub async fn execute(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        token: &Token,
        step_index: u32,
    ) -> Result<TransformOutcome> {
        let mut attempt = 1u32;
        loop {
            let state = env
                .open_state(
                    token.token_id,
                    self.node_id,
                    step_index,
                    attempt,
                    Some(&token.data),
                )
                .await?;
            let ctx = ctx.clone().with_state(state.state_id);
            let started = Instant::now();

            let call = self.plugin.process(token.data.clone(), &ctx).await;
            let (retryable, reason) = match call {
                Ok(result) => match result.status {
                    TransformStatus::Success => {
                        if !result.has_output_data() {
                            let reason = json!({
                                "fault": "success result must carry exactly one of row/rows"
                            });
                            env.close_state(
                                &state,
                                NodeStateStatus::Failed,
                                None,
                                started,
                                Some(reason),
                            )
                            .await?;
                            return Err(EngineError::Internal(format!(
                                "transform '{}' returned success without output data",
                                self.plugin.name()
                            )));
                        }
                        if let Some(rows) = result.rows {
                            if !self.plugin.creates_tokens() {
                                let reason = json!({
                                    "fault": "multi-row result from a transform without creates_tokens"
                                });
                                env.close_state(
                                    &state,
                                    NodeStateStatus::Failed,
                                    None,
                                    started,
                                    Some(reason),
                                )
                                .await?;
                                return Err(EngineError::Internal(format!(
                                    "transform '{}' returned multiple rows but does not create tokens",
                                    self.plugin.name()
                                )));
                            }
                            env.close_state(
                                &state,
                                NodeStateStatus::Completed,
                                Some(NodeOutput::Multi(rows.clone())),
                                started,
                                None,
                            )
                            .await?;
                            return Ok(TransformOutcome::Rows(rows));
                        }
                        let row = result.row.expect("has_output_data guarantees row");
                        env.close_state(
                            &state,
                            NodeStateStatus::Completed,
                            Some(NodeOutput::Single(row.clone())),
                            started,
                            None,
                        )
                        .await?;
                        return Ok(TransformOutcome::Row(row));
                    }
                    TransformStatus::Filtered => {
                        env.close_state(
                            &state,
                            NodeStateStatus::Completed,
                            None,
                            started,
                            result.reason,
                        )
                        .await?;
                        return Ok(TransformOutcome::Filtered);
                    }
                    TransformStatus::Error => {
                        let reason = result.reason.unwrap_or_else(|| json!("transform error"));
                        (result.retryable, reason)
                    }
                },
                Err(PluginError::Type(message)) => {
                    // Trust-model violation: upstream bug, crash the run.
                    env.close_state(
                        &state,
                        NodeStateStatus::Failed,
                        None,
                        started,
                        Some(json!({"type_error": message})),
                    )
                    .await?;
                    return Err(EngineError::PluginType {
                        stage: self.plugin.name().to_string(),
                        message,
                    });
                }
                Err(err) => (err.is_retryable(), json!({"error": err.to_string()})),
            };

            if retryable && self.retry.allows_retry(attempt) {
                env.close_state(
                    &state,
                    NodeStateStatus::Retried,
                    None,
                    started,
                    Some(reason.clone()),
                )
                .await?;
                let delay = self.retry.delay_after(attempt);
                tracing::warn!(
                    stage = self.plugin.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transform failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            env.close_state(
                &state,
                NodeStateStatus::Failed,
                None,
                started,
                Some(reason.clone()),
            )
            .await?;
            tracing::error!(
                stage = self.plugin.name(),
                attempts = attempt,
                "transform failed after all attempts"
            );
            return Ok(TransformOutcome::Failed {
                reason,
                attempts: attempt,
            });
        }
    }
}
