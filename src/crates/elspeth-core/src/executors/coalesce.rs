//! Coalesce executor
//!
//! Collects forked siblings by fork group and, once its policy is
//! satisfied, merges them into one joined token whose parents are every
//! merged branch. Arrival order decides merge order. Pending groups that
//! cannot complete (a failed branch under `require_all`, a quorum never
//! reached) fail their arrived tokens; `best_effort` groups merge whatever
//! arrived when the run winds down.
//!
//! Every arrival leaves a terminal node state at the join point, whatever
//! happened to its group. A sibling reaching a group that already failed
//! fails with the group's recorded reason; a straggler reaching a group
//! that already merged closes as `skipped`. No token is discarded without
//! a record.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use elspeth_landscape::{ForkGroupId, NodeId, NodeOutput, NodeStateStatus};

use super::ExecutorEnv;
use crate::config::CoalescePolicy;
use crate::error::{EngineError, Result};
use crate::plugin::{CoalescePlugin, PluginContext};
use crate::tokens::Token;

/// What the coalesce did with an arriving token.
#[derive(Debug)]
pub enum CoalesceOutcome {
    /// Waiting for more branches.
    Held,
    /// Policy satisfied: the joined token continues downstream.
    Joined(Token),
    /// The group already merged without this token; it terminates with a
    /// `skipped` state.
    Late,
    /// The group cannot complete; every arrived token fails.
    GroupFailed { reason: Value },
}

/// How a group ended. Kept on the group so arrivals after resolution
/// still terminate correctly.
enum Resolution {
    Merged,
    Failed(String),
}

struct PendingGroup {
    expected: usize,
    arrived: Vec<Token>,
    failed_branches: usize,
    resolution: Option<Resolution>,
}

impl PendingGroup {
    fn fresh(expected: usize) -> Self {
        Self {
            expected,
            arrived: Vec::new(),
            failed_branches: 0,
            resolution: None,
        }
    }
}

/// Collects fork branches and merges them per policy.
pub struct CoalesceExecutor {
    node_id: NodeId,
    name: String,
    policy: CoalescePolicy,
    plugin: Box<dyn CoalescePlugin>,
    pending: Mutex<HashMap<ForkGroupId, PendingGroup>>,
}

impl CoalesceExecutor {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        name: String,
        policy: CoalescePolicy,
        plugin: Box<dyn CoalescePlugin>,
    ) -> Self {
        Self {
            node_id,
            name,
            policy,
            plugin,
            pending: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A forked token reached its join point.
    pub async fn arrive(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        token: Token,
        expected: usize,
        step_index: u32,
    ) -> Result<CoalesceOutcome> {
        let Some(fork_group_id) = token.fork_group_id else {
            return Err(EngineError::Internal(format!(
                "token {} reached coalesce '{}' without a fork group",
                token.token_id, self.name
            )));
        };
        let mut pending = self.pending.lock().await;
        let group = pending
            .entry(fork_group_id)
            .or_insert_with(|| PendingGroup::fresh(expected));

        // Arrivals after resolution still get a terminal state: the
        // group's recorded reason decides which kind.
        match &group.resolution {
            Some(Resolution::Failed(why)) => {
                let why = why.clone();
                drop(pending);
                return self.fail_group(env, vec![token], step_index, &why).await;
            }
            Some(Resolution::Merged) => {
                drop(pending);
                self.record_late(env, &token, step_index).await?;
                return Ok(CoalesceOutcome::Late);
            }
            None => {}
        }
        group.arrived.push(token);

        let ready = match self.policy {
            CoalescePolicy::RequireAll => {
                if group.failed_branches > 0 {
                    group.resolution =
                        Some(Resolution::Failed("a sibling branch failed".to_string()));
                    let arrived = std::mem::take(&mut group.arrived);
                    drop(pending);
                    return self
                        .fail_group(env, arrived, step_index, "a sibling branch failed")
                        .await;
                }
                group.arrived.len() == group.expected
            }
            CoalescePolicy::Quorum { threshold } => group.arrived.len() >= threshold,
            CoalescePolicy::BestEffort => group.arrived.len() == group.expected,
        };
        if !ready {
            return Ok(CoalesceOutcome::Held);
        }
        group.resolution = Some(Resolution::Merged);
        let arrived = std::mem::take(&mut group.arrived);
        drop(pending);
        self.merge_group(env, ctx, arrived, step_index).await
    }

    /// A branch of this group failed upstream and will never arrive.
    pub async fn branch_failed(
        &self,
        env: &ExecutorEnv,
        fork_group_id: ForkGroupId,
        expected: usize,
        step_index: u32,
    ) -> Result<Option<CoalesceOutcome>> {
        let mut pending = self.pending.lock().await;
        let group = pending
            .entry(fork_group_id)
            .or_insert_with(|| PendingGroup::fresh(expected));
        if group.resolution.is_some() {
            return Ok(None);
        }
        group.failed_branches += 1;
        match self.policy {
            CoalescePolicy::RequireAll => {
                // Resolved-by-failure, whether or not anyone has arrived
                // yet: siblings that show up later fail with this reason.
                group.resolution =
                    Some(Resolution::Failed("a sibling branch failed".to_string()));
                let arrived = std::mem::take(&mut group.arrived);
                drop(pending);
                if arrived.is_empty() {
                    return Ok(None);
                }
                Ok(Some(
                    self.fail_group(env, arrived, step_index, "a sibling branch failed")
                        .await?,
                ))
            }
            CoalescePolicy::Quorum { threshold } => {
                // The quorum can no longer be reached once too many
                // branches are gone.
                if group.expected - group.failed_branches < threshold {
                    group.resolution =
                        Some(Resolution::Failed("quorum unreachable".to_string()));
                    let arrived = std::mem::take(&mut group.arrived);
                    drop(pending);
                    if arrived.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(
                        self.fail_group(env, arrived, step_index, "quorum unreachable")
                            .await?,
                    ));
                }
                Ok(None)
            }
            CoalescePolicy::BestEffort => Ok(None),
        }
    }

    /// Resolves every group still pending at the end of the run.
    /// `best_effort` groups merge what arrived; anything else fails.
    pub async fn finalize(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        step_index: u32,
    ) -> Result<Vec<CoalesceOutcome>> {
        let groups: Vec<(ForkGroupId, Vec<Token>)> = {
            let mut pending = self.pending.lock().await;
            pending
                .iter_mut()
                .filter(|(_, group)| group.resolution.is_none() && !group.arrived.is_empty())
                .map(|(id, group)| {
                    group.resolution = Some(match self.policy {
                        CoalescePolicy::BestEffort => Resolution::Merged,
                        CoalescePolicy::RequireAll => {
                            Resolution::Failed("branches missing at run end".to_string())
                        }
                        CoalescePolicy::Quorum { .. } => {
                            Resolution::Failed("quorum not reached by run end".to_string())
                        }
                    });
                    (*id, std::mem::take(&mut group.arrived))
                })
                .collect()
        };
        let mut outcomes = Vec::new();
        for (_, arrived) in groups {
            let outcome = match self.policy {
                CoalescePolicy::BestEffort => self.merge_group(env, ctx, arrived, step_index).await?,
                CoalescePolicy::RequireAll => {
                    self.fail_group(env, arrived, step_index, "branches missing at run end")
                        .await?
                }
                CoalescePolicy::Quorum { .. } => {
                    self.fail_group(env, arrived, step_index, "quorum not reached by run end")
                        .await?
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn merge_group(
        &self,
        env: &ExecutorEnv,
        ctx: &PluginContext,
        arrived: Vec<Token>,
        step_index: u32,
    ) -> Result<CoalesceOutcome> {
        let rows: Vec<Value> = arrived.iter().map(|t| t.data.clone()).collect();
        let started = Instant::now();
        let merged = match self.plugin.merge(rows.clone(), ctx).await {
            Ok(merged) => merged,
            Err(err) => {
                return self
                    .fail_group(env, arrived, step_index, &format!("merge failed: {err}"))
                    .await;
            }
        };
        let joined = env
            .tokens
            .join(&arrived, merged.clone(), &self.name, step_index)
            .await?;
        let state = env
            .open_state(
                joined.token_id,
                self.node_id,
                step_index,
                1,
                Some(&Value::Array(rows)),
            )
            .await?;
        env.close_state(
            &state,
            NodeStateStatus::Completed,
            Some(NodeOutput::Single(merged)),
            started,
            None,
        )
        .await?;
        tracing::debug!(
            coalesce = %self.name,
            branches = arrived.len(),
            joined_token = %joined.token_id,
            "branches coalesced"
        );
        Ok(CoalesceOutcome::Joined(joined))
    }

    async fn fail_group(
        &self,
        env: &ExecutorEnv,
        arrived: Vec<Token>,
        step_index: u32,
        why: &str,
    ) -> Result<CoalesceOutcome> {
        let reason = json!({"coalesce": self.name, "error": why});
        for token in &arrived {
            let state = env
                .open_state(token.token_id, self.node_id, step_index, 1, Some(&token.data))
                .await?;
            env.close_state(
                &state,
                NodeStateStatus::Failed,
                None,
                Instant::now(),
                Some(reason.clone()),
            )
            .await?;
        }
        tracing::warn!(coalesce = %self.name, branches = arrived.len(), why, "join failed");
        Ok(CoalesceOutcome::GroupFailed { reason })
    }

    /// Terminal record for a straggler whose group already merged.
    async fn record_late(
        &self,
        env: &ExecutorEnv,
        token: &Token,
        step_index: u32,
    ) -> Result<()> {
        let state = env
            .open_state(token.token_id, self.node_id, step_index, 1, Some(&token.data))
            .await?;
        env.close_state(
            &state,
            NodeStateStatus::Skipped,
            None,
            Instant::now(),
            Some(json!({"coalesce": self.name, "skipped": "group already merged"})),
        )
        .await?;
        tracing::debug!(
            coalesce = %self.name,
            token = %token.token_id,
            "late arrival skipped; group already merged"
        );
        Ok(())
    }

    pub async fn on_register(&self, ctx: &PluginContext) -> Result<()> {
        self.plugin
            .on_register(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.name.clone(),
                message: e.to_string(),
            })
    }

    pub async fn on_start(&self, ctx: &PluginContext) -> Result<()> {
        self.plugin
            .on_start(ctx)
            .await
            .map_err(|e| EngineError::Lifecycle {
                stage: self.name.clone(),
                message: e.to_string(),
            })
    }

    /// Best-effort close; errors are logged, not propagated.
    pub async fn on_complete(&self, ctx: &PluginContext) {
        if let Err(err) = self.plugin.on_complete(ctx).await {
            tracing::warn!(coalesce = %self.name, error = %err, "coalesce close failed");
        }
    }
}
