//! Sink executor
//!
//! Wraps `SinkPlugin::write`. On success it closes the node state and
//! records the artifact; on failure no artifact exists and the token's
//! outcome derives as failed. Non-idempotent sinks receive each row at
//! most once per run - the retry loop only runs when the sink declares
//! `idempotent`.

use std::time::Instant;

use serde_json::json;
use tokio::sync::Mutex;

use elspeth_landscape::{ArtifactSpec, NodeId, NodeOutput, NodeStateStatus};

use super::ExecutorEnv;
use crate::error::{EngineError, PluginError, Result};
use crate::plugin::{PluginContext, SinkPlugin};
use crate::retry::RetryConfig;
use crate::tokens::Token;

/// Result of driving one row into a sink.
#[derive(Debug)]
pub enum SinkOutcome {
    Written,
    /// Retries exhausted (or not permitted); the token fails.
    Failed { reason: serde_json::Value },
}

/// Executes sink writes with the audit envelope.
///
/// The plugin sits behind a mutex: sinks are stateful (`&mut self`) and
/// one sink instance may be shared by many workers.
pub struct SinkExecutor {
    node_id: NodeId,
    sink_name: String,
    plugin: Mutex<Box<dyn SinkPlugin>>,
    idempotent: bool,
    plugin_name: String,
    retry: RetryConfig,
}

impl SinkExecutor {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        sink_name: String,
        plugin: Box<dyn SinkPlugin>,
        retry: RetryConfig,
    ) -> Self {
        let idempotent = plugin.idempotent();
        let plugin_name = plugin.name().to_string();
        Self {
            node_id,
            sink_name,
            plugin: Mutex::new(plugin),
            idempotent,
            plugin_name,
            retry,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    /// Writes the token's row, recording state and artifact.
    pub async fn execute(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        token: &Token,
        step_index: u32,
    ) -> Result<SinkOutcome> {
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

            let call = {
                let mut plugin = self.plugin.lock().await;
                plugin.write(&token.data, &ctx).await
            };
            match call {
                Ok(receipt) => {
                    env.close_state(
                        &state,
                        NodeStateStatus::Completed,
                        Some(NodeOutput::Single(token.data.clone())),
                        started,
                        None,
                    )
                    .await?;
                    env.landscape
                        .record_artifact(ArtifactSpec {
                            state_id: state.state_id,
                            kind: receipt.kind,
                            path_or_uri: receipt.path_or_uri,
                            content_hash: receipt.content_hash,
                            size_bytes: receipt.size_bytes,
                            idempotency_key: receipt.idempotency_key,
                        })
                        .await?;
                    return Ok(SinkOutcome::Written);
                }
                Err(PluginError::Type(message)) => {
                    env.close_state(
                        &state,
                        NodeStateStatus::Failed,
                        None,
                        started,
                        Some(json!({"type_error": message})),
                    )
                    .await?;
                    return Err(EngineError::PluginType {
                        stage: self.plugin_name.clone(),
                        message,
                    });
                }
                Err(err) => {
                    let reason = json!({"error": err.to_string()});
                    // Replaying a non-idempotent sink could double-write
                    // the external system; fail instead.
                    if err.is_retryable() && self.idempotent && self.retry.allows_retry(attempt) {
                        env.close_state(
                            &state,
                            NodeStateStatus::Retried,
                            None,
                            started,
                            Some(reason),
                        )
                        .await?;
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
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
                        sink = %self.sink_name,
                        attempts = attempt,
                        "sink write failed"
                    );
                    return Ok(SinkOutcome::Failed { reason });
                }
            }
        }
    }

    /// Writes a raw quarantined row without token or node state. Used for
    /// source validation failures, which never become tokens.
    pub async fn write_raw(&self, ctx: &PluginContext, row: &serde_json::Value) -> Result<()> {
        let mut plugin = self.plugin.lock().await;
        plugin
            .write(row, ctx)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::StageFailed {
                stage: self.plugin_name.clone(),
                attempts: 1,
                reason: e.to_string(),
            })
    }

    pub async fn on_register(&self, ctx: &PluginContext) -> Result<()> {
        let mut plugin = self.plugin.lock().await;
        plugin
            .on_register(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.plugin_name.clone(),
                message: e.to_string(),
            })
    }

    pub async fn on_start(&self, ctx: &PluginContext) -> Result<()> {
        let mut plugin = self.plugin.lock().await;
        plugin
            .on_start(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.plugin_name.clone(),
                message: e.to_string(),
            })
    }

    /// Best-effort close; errors are logged, not propagated.
    pub async fn on_complete(&self, ctx: &PluginContext) {
        let mut plugin = self.plugin.lock().await;
        if let Err(err) = plugin.flush(ctx).await {
            tracing::warn!(sink = %self.sink_name, error = %err, "sink flush failed");
        }
        if let Err(err) = plugin.on_complete(ctx).await {
            tracing::warn!(sink = %self.sink_name, error = %err, "sink close failed");
        }
    }
}
