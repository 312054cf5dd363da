//! Gate executor
//!
//! Wraps `GatePlugin::evaluate`. Every invocation records exactly one
//! routing event - including plain `continue` - before the node state
//! closes; a gate that decided silently would break the auditability
//! guarantee, so silence here is a hard error path that never exists.
//!
//! Plugins return route **labels**. The executor owns the gate's route
//! table and resolves labels to sink names before recording; the recorded
//! event carries the resolved destinations, and the processor receives a
//! fully resolved decision it can act on without consulting the routes
//! again. A label the configuration never declared is a programming error
//! and crashes the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use elspeth_landscape::{NodeId, NodeOutput, NodeStateStatus, RouteMode, RoutingKind, StateId};

use super::ExecutorEnv;
use crate::config::RouteTarget;
use crate::error::{EngineError, PluginError, Result};
use crate::plugin::{GatePlugin, PluginContext};
use crate::retry::RetryConfig;
use crate::telemetry::{TelemetryEvent, TelemetryEventType};
use crate::tokens::Token;

/// A gate decision with its labels resolved against the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRouting {
    /// Proceed along the spine.
    Continue,
    /// Divert to these sinks (by name, resolvable only through the
    /// graph's sink-ID map).
    ToSinks { sinks: Vec<String>, mode: RouteMode },
    /// Fork one child per branch name.
    Fork { branches: Vec<String> },
}

/// What a gate step produced, as seen by the row processor.
#[derive(Debug)]
pub enum GateOutcome {
    Decided {
        row: serde_json::Value,
        routing: ResolvedRouting,
        state_id: StateId,
    },
    /// Retries exhausted; the token fails.
    Failed { reason: serde_json::Value },
}

/// Executes gates with the audit envelope.
pub struct GateExecutor {
    node_id: NodeId,
    plugin: Arc<dyn GatePlugin>,
    routes: BTreeMap<String, RouteTarget>,
    retry: RetryConfig,
}

impl GateExecutor {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        plugin: Arc<dyn GatePlugin>,
        routes: BTreeMap<String, RouteTarget>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            node_id,
            plugin,
            routes,
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
            tracing::warn!(stage = self.plugin.name(), error = %err, "gate close failed");
        }
    }

    /// Resolves a route-to-sink label list to sink names.
    fn resolve_sinks(&self, labels: &[String]) -> Result<Vec<String>> {
        let mut sinks = Vec::with_capacity(labels.len());
        for label in labels {
            match self.routes.get(label) {
                Some(RouteTarget::Sink { name, .. }) => sinks.push(name.clone()),
                Some(RouteTarget::Continue) => {
                    return Err(EngineError::Internal(format!(
                        "gate '{}' used continue-route label '{label}' as a sink destination",
                        self.plugin.name()
                    )));
                }
                None => {
                    return Err(EngineError::Internal(format!(
                        "gate '{}' routed to undeclared label '{label}'",
                        self.plugin.name()
                    )));
                }
            }
        }
        Ok(sinks)
    }

    pub async fn execute(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        token: &Token,
        step_index: u32,
    ) -> Result<GateOutcome> {
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

            match self.plugin.evaluate(token.data.clone(), &ctx).await {
                Ok(result) => {
                    let action = result.action;
                    let (routing, destinations) = match action.kind {
                        RoutingKind::Continue => (ResolvedRouting::Continue, Vec::new()),
                        RoutingKind::RouteToSink => {
                            let sinks = match self.resolve_sinks(&action.destinations) {
                                Ok(sinks) => sinks,
                                Err(err) => {
                                    env.close_state(
                                        &state,
                                        NodeStateStatus::Failed,
                                        None,
                                        started,
                                        Some(json!({"routing_error": err.to_string()})),
                                    )
                                    .await?;
                                    return Err(err);
                                }
                            };
                            (
                                ResolvedRouting::ToSinks {
                                    sinks: sinks.clone(),
                                    mode: action.mode,
                                },
                                sinks,
                            )
                        }
                        RoutingKind::ForkToPaths => (
                            ResolvedRouting::Fork {
                                branches: action.destinations.clone(),
                            },
                            action.destinations.clone(),
                        ),
                    };
                    // The decision is recorded before the state closes;
                    // the reason is deep-copied by the recorder.
                    env.landscape
                        .record_routing_event(
                            state.state_id,
                            action.kind,
                            &destinations,
                            action.mode,
                            &action.reason,
                        )
                        .await?;
                    env.close_state(
                        &state,
                        NodeStateStatus::Completed,
                        Some(NodeOutput::Single(result.row.clone())),
                        started,
                        None,
                    )
                    .await?;
                    env.telemetry
                        .handle_event(
                            TelemetryEvent::new(TelemetryEventType::RoutingDecided, env.run_id)
                                .with_node(self.node_id)
                                .with_token(token.token_id)
                                .with_state(state.state_id)
                                .with_detail(json!({
                                    "kind": action.kind.as_str(),
                                    "destinations": destinations,
                                    "mode": action.mode.as_str(),
                                })),
                        )
                        .await;
                    return Ok(GateOutcome::Decided {
                        row: result.row,
                        routing,
                        state_id: state.state_id,
                    });
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
                        stage: self.plugin.name().to_string(),
                        message,
                    });
                }
                Err(err) => {
                    let reason = json!({"error": err.to_string()});
                    if err.is_retryable() && self.retry.allows_retry(attempt) {
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
                    return Ok(GateOutcome::Failed { reason });
                }
            }
        }
    }
}
