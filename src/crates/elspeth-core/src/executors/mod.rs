//! Stage executors
//!
//! An executor wraps one stage invocation with the full audit envelope:
//! open a node state, hash the input, emit "node started", call the
//! plugin, hash the output, close the node state, emit "node completed",
//! and handle retries. Plugins never touch the recorder for their own
//! states; the envelope is the executor's job and is identical across
//! stage kinds.

mod aggregation;
mod coalesce;
mod gate;
mod sink;
mod transform;

pub use aggregation::{AggregationExecutor, AggregationOutcome};
pub use coalesce::{CoalesceExecutor, CoalesceOutcome};
pub use gate::{GateExecutor, GateOutcome, ResolvedRouting};
pub use sink::{SinkExecutor, SinkOutcome};
pub use transform::{TransformExecutor, TransformOutcome};

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use elspeth_landscape::{
    Landscape, NodeId, NodeOutput, NodeState, NodeStateCompletion, NodeStateStart, NodeStateStatus,
    RunId, TokenId,
};

use crate::error::Result;
use crate::telemetry::{TelemetryEvent, TelemetryEventType, TelemetryManager};
use crate::tokens::TokenManager;

/// Shared handles every executor needs.
#[derive(Clone)]
pub struct ExecutorEnv {
    pub run_id: RunId,
    pub landscape: Arc<dyn Landscape>,
    pub telemetry: Arc<TelemetryManager>,
    pub tokens: Arc<TokenManager>,
}

impl ExecutorEnv {
    /// Opens a node state and emits the started event.
    pub(crate) async fn open_state(
        &self,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        attempt: u32,
        input_data: Option<&Value>,
    ) -> Result<NodeState> {
        let state = self
            .landscape
            .begin_node_state(NodeStateStart {
                token_id,
                node_id,
                step_index,
                attempt,
                input_data: input_data.cloned(),
                context_before: None,
            })
            .await?;
        self.telemetry
            .handle_event(
                TelemetryEvent::new(TelemetryEventType::NodeStarted, self.run_id)
                    .with_node(node_id)
                    .with_token(token_id)
                    .with_state(state.state_id)
                    .with_hashes(state.input_hash.clone(), None),
            )
            .await;
        Ok(state)
    }

    /// Closes a node state and emits the completed event.
    pub(crate) async fn close_state(
        &self,
        state: &NodeState,
        status: NodeStateStatus,
        output: Option<NodeOutput>,
        started: Instant,
        error: Option<Value>,
    ) -> Result<()> {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.landscape
            .complete_node_state(
                state.state_id,
                NodeStateCompletion {
                    status,
                    output,
                    duration_ms,
                    error,
                    context_after: None,
                },
            )
            .await?;
        self.telemetry
            .handle_event(
                TelemetryEvent::new(TelemetryEventType::NodeCompleted, self.run_id)
                    .with_node(state.node_id)
                    .with_token(state.token_id)
                    .with_state(state.state_id)
                    .with_detail(serde_json::json!({
                        "status": status.as_str(),
                        "duration_ms": duration_ms,
                    })),
            )
            .await;
        Ok(())
    }

}
