//! Derived row outcomes - the "explain" read model
//!
//! A token's terminal classification is **not stored**. It is derived at
//! query time from node states, routing events, batch membership, and token
//! parentage, so the audit tables stay append-only and the classification
//! logic can evolve without a migration. [`derive_outcome`] implements the
//! derivation; [`explain_run`] joins it with the per-token evidence for a
//! whole run.
//!
//! `Buffered` is the only non-terminal outcome: it means the token is
//! physically held in an aggregation buffer and will reappear with a
//! terminal outcome on flush - unless the run itself failed, in which case
//! buffered tokens resolve to `Failed`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{RunId, TokenId};
use crate::records::{
    BatchStatus, NodeState, NodeStateStatus, NodeType, RoutingEvent, RoutingKind, RouteMode,
    RunStatus, TokenRecord, ValidationFailure,
};
use crate::recorder::Landscape;

/// Terminal classification of a token, derived at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    /// Reached the end of its path and was written by the output sink.
    Completed,
    /// Terminated at a sink selected by a gate (`move` mode).
    Routed,
    /// Became the parent of fork children.
    Forked,
    /// Absorbed into an aggregation batch (`single`/`transform` modes).
    ConsumedInBatch,
    /// Merged into a joined token by a coalesce.
    Coalesced,
    /// Never became a token; failed source validation.
    Quarantined,
    /// A stage failed after exhausting retries, or the batch/run failed.
    Failed,
    /// Became the parent of expansion children.
    Expanded,
    /// Held in an aggregation buffer awaiting flush. Non-terminal.
    Buffered,
}

impl RowOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Routed => "routed",
            Self::Forked => "forked",
            Self::ConsumedInBatch => "consumed_in_batch",
            Self::Coalesced => "coalesced",
            Self::Quarantined => "quarantined",
            Self::Failed => "failed",
            Self::Expanded => "expanded",
            Self::Buffered => "buffered",
        }
    }

    /// Whether the outcome closes the token's story.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Buffered)
    }
}

/// One token's derived story: outcome plus the evidence it derives from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenExplain {
    pub token: TokenRecord,
    pub outcome: RowOutcome,
    /// Node states ordered by `started_at`, then `attempt`.
    pub states: Vec<NodeState>,
    /// Routing events across all of the token's states, in state order.
    pub routing: Vec<RoutingEvent>,
}

/// The explain read model for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExplain {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tokens: Vec<TokenExplain>,
    /// Rows quarantined at the source; these never became tokens.
    pub quarantined: Vec<ValidationFailure>,
}

/// Derives the final [`RowOutcome`] for one token.
pub async fn derive_outcome(
    landscape: &dyn Landscape,
    token_id: TokenId,
    run_status: RunStatus,
) -> Result<RowOutcome> {
    let run_failed = run_status == RunStatus::Failed;

    // Batch membership takes precedence: a consumed token may also carry
    // flush states or expansion children, and those must not reclassify
    // it. A token may be a member of several batches along the spine (one
    // per aggregation node); every one of them is examined.
    let membership = landscape.batch_membership(token_id).await?;
    if !membership.is_empty() {
        let mut batches = Vec::with_capacity(membership.len());
        for member in &membership {
            batches.push(landscape.get_batch(member.batch_id).await?);
        }
        for batch in &batches {
            match batch.status {
                BatchStatus::Failed => return Ok(RowOutcome::Failed),
                BatchStatus::Draft | BatchStatus::Executing => {
                    return Ok(if run_failed {
                        RowOutcome::Failed
                    } else {
                        RowOutcome::Buffered
                    });
                }
                BatchStatus::Completed => {}
            }
        }
        if has_expand_children(landscape, token_id).await? {
            // Transform-mode trigger token: consumed, its children carry
            // the outputs.
            return Ok(RowOutcome::ConsumedInBatch);
        }
        let states = landscape.states_for_token(token_id).await?;
        for batch in &batches {
            let reappeared = states
                .iter()
                .any(|s| s.node_id == batch.node_id && s.status == NodeStateStatus::Completed);
            if !reappeared {
                // Absorbed at this aggregation node and never re-emitted.
                return Ok(RowOutcome::ConsumedInBatch);
            }
        }
        // Passthrough member or single-mode carrier at every node it was
        // batched: the states after the flush decide.
        return derive_from_states(landscape, token_id, run_failed).await;
    }

    // Lineage next: a parent of derived tokens is classified by what it
    // spawned.
    let children = landscape.children_of(token_id).await?;
    if !children.is_empty() {
        let first_child = landscape.get_token(children[0]).await?;
        if first_child.expand_group_id.is_some() {
            return Ok(RowOutcome::Expanded);
        }
        if first_child.join_group_id.is_some() {
            return Ok(RowOutcome::Coalesced);
        }
        if first_child.fork_group_id.is_some() {
            return Ok(RowOutcome::Forked);
        }
    }

    derive_from_states(landscape, token_id, run_failed).await
}

async fn has_expand_children(landscape: &dyn Landscape, token_id: TokenId) -> Result<bool> {
    for child_id in landscape.children_of(token_id).await? {
        if landscape.get_token(child_id).await?.expand_group_id.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn derive_from_states(
    landscape: &dyn Landscape,
    token_id: TokenId,
    run_failed: bool,
) -> Result<RowOutcome> {
    let states = landscape.states_for_token(token_id).await?;
    let Some(last) = states.last() else {
        // A token with no attempts yet: in-flight, or dead with the run.
        return Ok(if run_failed {
            RowOutcome::Failed
        } else {
            RowOutcome::Buffered
        });
    };
    match last.status {
        NodeStateStatus::Failed => Ok(RowOutcome::Failed),
        // A trailing retried state means retries were cut short by the run.
        NodeStateStatus::Retried => Ok(RowOutcome::Failed),
        NodeStateStatus::Running => Ok(if run_failed {
            RowOutcome::Failed
        } else {
            RowOutcome::Buffered
        }),
        NodeStateStatus::Skipped | NodeStateStatus::Completed => {
            let node = landscape.get_node(last.node_id).await?;
            if node.node_type != NodeType::Sink {
                // Filtered row, or a path that legitimately ends mid-spine.
                return Ok(RowOutcome::Completed);
            }
            for state in &states {
                for event in landscape.routing_events_for_state(state.state_id).await? {
                    if event.kind == RoutingKind::RouteToSink && event.mode == RouteMode::Move {
                        return Ok(RowOutcome::Routed);
                    }
                }
            }
            Ok(RowOutcome::Completed)
        }
    }
}

/// Builds the explain read model for a run: every token's outcome joined
/// with its states and routing events, plus the quarantined rows.
pub async fn explain_run(landscape: &dyn Landscape, run_id: RunId) -> Result<RunExplain> {
    let run = landscape.get_run(run_id).await?;
    let mut tokens = Vec::new();
    for token in landscape.tokens_for_run(run_id).await? {
        let outcome = derive_outcome(landscape, token.token_id, run.status).await?;
        let states = landscape.states_for_token(token.token_id).await?;
        let mut routing = Vec::new();
        for state in &states {
            routing.extend(landscape.routing_events_for_state(state.state_id).await?);
        }
        tokens.push(TokenExplain {
            token,
            outcome,
            states,
            routing,
        });
    }
    let quarantined = landscape.validation_failures(run_id).await?;
    Ok(RunExplain {
        run_id,
        status: run.status,
        tokens,
        quarantined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CANONICAL_VERSION;
    use crate::ids::NodeId;
    use crate::memory::InMemoryLandscape;
    use crate::records::{Determinism, RouteMode};
    use crate::recorder::{NodeOutput, NodeRegistration, NodeStateCompletion, NodeStateStart};
    use serde_json::json;

    struct Fixture {
        landscape: InMemoryLandscape,
        run_id: RunId,
        source: NodeId,
        sink: NodeId,
        row_id: crate::ids::RowId,
    }

    async fn fixture() -> Fixture {
        let landscape = InMemoryLandscape::new();
        let run = landscape
            .begin_run(&json!({}), CANONICAL_VERSION)
            .await
            .unwrap();
        let source = landscape
            .register_node(NodeRegistration {
                node_id: NodeId::generate(),
                run_id: run.run_id,
                plugin_name: "src".to_string(),
                node_type: NodeType::Source,
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: json!({}),
                input_schema: None,
                output_schema: Some(json!({})),
                sequence: Some(0),
            })
            .await
            .unwrap();
        let sink = landscape
            .register_node(NodeRegistration {
                node_id: NodeId::generate(),
                run_id: run.run_id,
                plugin_name: "snk".to_string(),
                node_type: NodeType::Sink,
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: json!({}),
                input_schema: Some(json!({})),
                output_schema: None,
                sequence: None,
            })
            .await
            .unwrap();
        let row = landscape
            .create_row(run.run_id, source.node_id, 0, &json!({"id": 1}))
            .await
            .unwrap();
        Fixture {
            landscape,
            run_id: run.run_id,
            source: source.node_id,
            sink: sink.node_id,
            row_id: row.row_id,
        }
    }

    async fn complete_state_at(
        fx: &Fixture,
        token_id: TokenId,
        node_id: NodeId,
        status: crate::records::NodeStateStatus,
    ) -> crate::ids::StateId {
        let state = fx
            .landscape
            .begin_node_state(NodeStateStart {
                token_id,
                node_id,
                step_index: 0,
                attempt: 1,
                input_data: Some(json!({"id": 1})),
                context_before: None,
            })
            .await
            .unwrap();
        fx.landscape
            .complete_node_state(
                state.state_id,
                NodeStateCompletion {
                    status,
                    output: Some(NodeOutput::Single(json!({"id": 1}))),
                    duration_ms: 1,
                    error: None,
                    context_after: None,
                },
            )
            .await
            .unwrap();
        state.state_id
    }

    #[tokio::test]
    async fn test_buffered_resolves_to_failed_when_run_fails() {
        let fx = fixture().await;
        let token = fx.landscape.create_token(fx.row_id).await.unwrap();
        let batch = fx
            .landscape
            .create_batch(fx.run_id, fx.source)
            .await
            .unwrap();
        fx.landscape
            .add_batch_member(batch.batch_id, token.token_id, 0)
            .await
            .unwrap();

        let buffered = derive_outcome(&fx.landscape, token.token_id, RunStatus::Running)
            .await
            .unwrap();
        assert_eq!(buffered, RowOutcome::Buffered);
        assert!(!buffered.is_terminal());

        let failed = derive_outcome(&fx.landscape, token.token_id, RunStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed, RowOutcome::Failed);
    }

    #[tokio::test]
    async fn test_move_route_derives_routed_copy_derives_completed() {
        let fx = fixture().await;

        let moved = fx.landscape.create_token(fx.row_id).await.unwrap();
        let state_id =
            complete_state_at(&fx, moved.token_id, fx.sink, NodeStateStatus::Completed).await;
        fx.landscape
            .record_routing_event(
                state_id,
                RoutingKind::RouteToSink,
                &["flagged".to_string()],
                RouteMode::Move,
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(
            derive_outcome(&fx.landscape, moved.token_id, RunStatus::Completed)
                .await
                .unwrap(),
            RowOutcome::Routed
        );

        let copied = fx.landscape.create_token(fx.row_id).await.unwrap();
        let state_id =
            complete_state_at(&fx, copied.token_id, fx.sink, NodeStateStatus::Completed).await;
        fx.landscape
            .record_routing_event(
                state_id,
                RoutingKind::RouteToSink,
                &["mirror".to_string()],
                RouteMode::Copy,
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(
            derive_outcome(&fx.landscape, copied.token_id, RunStatus::Completed)
                .await
                .unwrap(),
            RowOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_failed_state_derives_failed() {
        let fx = fixture().await;
        let token = fx.landscape.create_token(fx.row_id).await.unwrap();
        complete_state_at(&fx, token.token_id, fx.source, NodeStateStatus::Failed).await;
        assert_eq!(
            derive_outcome(&fx.landscape, token.token_id, RunStatus::Completed)
                .await
                .unwrap(),
            RowOutcome::Failed
        );
    }
}
