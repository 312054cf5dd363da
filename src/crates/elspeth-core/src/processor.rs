//! Row processor - the per-step state machine
//!
//! A [`WorkItem`] is one token plus the step it resumes at. The processor
//! pops a work item and walks the token forward through the spine in
//! strict topological order, dispatching each step to its executor. Every
//! outcome either advances the token, terminates it (sink, filter,
//! failure, buffer, join), or produces child work items (fork, expansion,
//! flush) - children are returned to the caller for dispatch, never
//! processed inline, so a work item is always the unit of scheduling and
//! a given token at a given step belongs to exactly one worker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;

use elspeth_landscape::RouteMode;

use crate::error::{EngineError, Result};
use crate::executors::{
    AggregationExecutor, AggregationOutcome, CoalesceExecutor, CoalesceOutcome, ExecutorEnv,
    GateExecutor, GateOutcome, ResolvedRouting, SinkExecutor, SinkOutcome, TransformExecutor,
    TransformOutcome,
};
use crate::plugin::PluginContext;
use crate::telemetry::{TelemetryEvent, TelemetryEventType};
use crate::tokens::Token;

/// Where a forked token must report for joining.
#[derive(Debug, Clone)]
pub struct CoalesceTarget {
    /// Spine step index of the coalesce stage.
    pub step: usize,
    pub name: String,
    /// Branch count of the fork this token belongs to.
    pub expected: usize,
}

/// One schedulable unit: a token and where it resumes.
#[derive(Debug)]
pub struct WorkItem {
    pub token: Token,
    pub start_step: usize,
    pub coalesce: Option<CoalesceTarget>,
}

impl WorkItem {
    #[must_use]
    pub fn new(token: Token, start_step: usize) -> Self {
        Self {
            token,
            start_step,
            coalesce: None,
        }
    }
}

/// One spine stage bound to its executor and context.
pub enum StageRuntime {
    Transform(TransformExecutor),
    Gate(GateExecutor),
    Aggregation(Arc<AggregationExecutor>),
    Coalesce(Arc<CoalesceExecutor>),
}

/// A stage plus the plugin context it runs under.
pub struct Stage {
    pub runtime: StageRuntime,
    pub ctx: PluginContext,
}

/// A sink executor plus its context.
pub struct SinkStation {
    pub executor: Arc<SinkExecutor>,
    pub ctx: PluginContext,
}

/// Everything a worker needs to process work items.
pub struct PipelineRuntime {
    pub env: ExecutorEnv,
    pub stages: Vec<Stage>,
    /// Sink name -> executor; the only legal sink resolution path.
    pub sinks: BTreeMap<String, SinkStation>,
    pub output_sink: String,
    pub fail_fast: bool,
    /// Rows terminated at sinks (the `rows_processed` of the run result).
    pub rows_written: AtomicU64,
}

impl PipelineRuntime {
    fn output_station(&self) -> &SinkStation {
        &self.sinks[&self.output_sink]
    }

    /// First coalesce stage strictly after `step`, if any.
    fn coalesce_after(&self, step: usize) -> Option<(usize, &CoalesceExecutor)> {
        self.stages
            .iter()
            .enumerate()
            .skip(step + 1)
            .find_map(|(index, stage)| match &stage.runtime {
                StageRuntime::Coalesce(executor) => Some((index, executor.as_ref())),
                _ => None,
            })
    }
}

/// Walks one work item to a terminal outcome, returning any child work
/// items it spawned.
pub async fn process_work_item(
    runtime: &PipelineRuntime,
    item: WorkItem,
) -> Result<Vec<WorkItem>> {
    let env = &runtime.env;
    let mut token = item.token;
    let mut step = item.start_step;
    let mut coalesce = item.coalesce;

    loop {
        // A forked token reaching its join point is consumed there.
        if let Some(target) = coalesce.clone() {
            if step == target.step {
                let stage = &runtime.stages[step];
                let StageRuntime::Coalesce(executor) = &stage.runtime else {
                    return Err(EngineError::Internal(format!(
                        "coalesce target step {step} is not a coalesce stage"
                    )));
                };
                match executor
                    .arrive(env, &stage.ctx, token, target.expected, step as u32)
                    .await?
                {
                    // Held tokens wait inside the group; Late tokens were
                    // already closed with a skipped state by the executor.
                    CoalesceOutcome::Held | CoalesceOutcome::Late => return Ok(Vec::new()),
                    CoalesceOutcome::GroupFailed { reason } => {
                        if runtime.fail_fast {
                            return Err(EngineError::StageFailed {
                                stage: target.name,
                                attempts: 1,
                                reason: reason.to_string(),
                            });
                        }
                        return Ok(Vec::new());
                    }
                    CoalesceOutcome::Joined(joined) => {
                        token = joined;
                        step = target.step + 1;
                        coalesce = None;
                        continue;
                    }
                }
            }
        }

        // Past the last stage: the spine ends at the output sink.
        if step >= runtime.stages.len() {
            let station = runtime.output_station();
            return match station
                .executor
                .execute(env, &station.ctx, &token, step as u32)
                .await?
            {
                SinkOutcome::Written => {
                    runtime.rows_written.fetch_add(1, Ordering::Relaxed);
                    Ok(Vec::new())
                }
                SinkOutcome::Failed { reason } => {
                    fail_branch(runtime, &token, &coalesce).await?;
                    if runtime.fail_fast {
                        return Err(EngineError::StageFailed {
                            stage: runtime.output_sink.clone(),
                            attempts: 1,
                            reason: reason.to_string(),
                        });
                    }
                    Ok(Vec::new())
                }
            };
        }

        let stage = &runtime.stages[step];
        match &stage.runtime {
            StageRuntime::Transform(executor) => {
                match executor.execute(env, &stage.ctx, &token, step as u32).await? {
                    TransformOutcome::Row(row) => {
                        token.data = row;
                        step += 1;
                    }
                    TransformOutcome::Rows(rows) => {
                        let children = env.tokens.expand(&token, rows, step as u32 + 1).await?;
                        env.telemetry
                            .handle_event(
                                TelemetryEvent::new(TelemetryEventType::TokenExpanded, env.run_id)
                                    .with_node(executor.node_id())
                                    .with_token(token.token_id)
                                    .with_detail(json!({"children": children.len()})),
                            )
                            .await;
                        return Ok(children
                            .into_iter()
                            .map(|child| WorkItem {
                                token: child,
                                start_step: step + 1,
                                coalesce: coalesce.clone(),
                            })
                            .collect());
                    }
                    TransformOutcome::Filtered => return Ok(Vec::new()),
                    TransformOutcome::Failed { reason, attempts } => {
                        fail_branch(runtime, &token, &coalesce).await?;
                        if runtime.fail_fast {
                            return Err(EngineError::StageFailed {
                                stage: format!("step {step}"),
                                attempts,
                                reason: reason.to_string(),
                            });
                        }
                        return Ok(Vec::new());
                    }
                }
            }

            StageRuntime::Gate(executor) => {
                match executor.execute(env, &stage.ctx, &token, step as u32).await? {
                    GateOutcome::Failed { reason } => {
                        fail_branch(runtime, &token, &coalesce).await?;
                        if runtime.fail_fast {
                            return Err(EngineError::StageFailed {
                                stage: format!("step {step}"),
                                attempts: 1,
                                reason: reason.to_string(),
                            });
                        }
                        return Ok(Vec::new());
                    }
                    GateOutcome::Decided { row, routing, .. } => {
                        token.data = row;
                        match routing {
                            ResolvedRouting::Continue => {
                                step += 1;
                            }
                            ResolvedRouting::ToSinks { sinks, mode } => {
                                for name in &sinks {
                                    let station = &runtime.sinks[name];
                                    match station
                                        .executor
                                        .execute(env, &station.ctx, &token, step as u32)
                                        .await?
                                    {
                                        SinkOutcome::Written => {
                                            if mode == RouteMode::Move {
                                                runtime
                                                    .rows_written
                                                    .fetch_add(1, Ordering::Relaxed);
                                            }
                                        }
                                        SinkOutcome::Failed { reason } => {
                                            fail_branch(runtime, &token, &coalesce).await?;
                                            if runtime.fail_fast {
                                                return Err(EngineError::StageFailed {
                                                    stage: name.clone(),
                                                    attempts: 1,
                                                    reason: reason.to_string(),
                                                });
                                            }
                                            return Ok(Vec::new());
                                        }
                                    }
                                }
                                if mode == RouteMode::Move {
                                    return Ok(Vec::new());
                                }
                                // copy mode: the original token continues
                                // down the spine after the sink write.
                                step += 1;
                            }
                            ResolvedRouting::Fork { branches } => {
                                let children =
                                    env.tokens.fork(&token, &branches, step as u32 + 1).await?;
                                env.telemetry
                                    .handle_event(
                                        TelemetryEvent::new(
                                            TelemetryEventType::TokenForked,
                                            env.run_id,
                                        )
                                        .with_node(executor.node_id())
                                        .with_token(token.token_id)
                                        .with_detail(json!({"branches": branches})),
                                    )
                                    .await;
                                let target = runtime.coalesce_after(step).map(|(index, exec)| {
                                    CoalesceTarget {
                                        step: index,
                                        name: exec.name().to_string(),
                                        expected: children.len(),
                                    }
                                });
                                return Ok(children
                                    .into_iter()
                                    .map(|child| WorkItem {
                                        token: child,
                                        start_step: step + 1,
                                        coalesce: target.clone(),
                                    })
                                    .collect());
                            }
                        }
                    }
                }
            }

            StageRuntime::Aggregation(executor) => {
                match executor.accept(env, &stage.ctx, token, step as u32).await? {
                    AggregationOutcome::Buffered => return Ok(Vec::new()),
                    AggregationOutcome::Skipped(returned) => {
                        token = returned;
                        step += 1;
                    }
                    AggregationOutcome::Flushed(tokens) => {
                        return Ok(tokens
                            .into_iter()
                            .map(|flushed| WorkItem {
                                token: flushed,
                                start_step: step + 1,
                                coalesce: coalesce.clone(),
                            })
                            .collect());
                    }
                }
            }

            // A token walking the spine without a fork passes a coalesce
            // stage untouched.
            StageRuntime::Coalesce(_) => {
                step += 1;
            }
        }
    }
}

/// Tells the downstream coalesce (if any) that this branch will never
/// arrive.
async fn fail_branch(
    runtime: &PipelineRuntime,
    token: &Token,
    coalesce: &Option<CoalesceTarget>,
) -> Result<()> {
    let Some(target) = coalesce else {
        return Ok(());
    };
    let Some(fork_group_id) = token.fork_group_id else {
        return Ok(());
    };
    let StageRuntime::Coalesce(executor) = &runtime.stages[target.step].runtime else {
        return Ok(());
    };
    executor
        .branch_failed(&runtime.env, fork_group_id, target.expected, target.step as u32)
        .await?;
    Ok(())
}
