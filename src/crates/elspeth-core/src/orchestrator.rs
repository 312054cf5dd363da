//! Orchestrator - the top-level run loop
//!
//! Owns the whole lifecycle of a run: compile the graph, open the run and
//! register its topology, start every plugin, pump the source through the
//! work pool, flush aggregation buffers and finalize coalesces once the
//! source is exhausted, then wind everything down in an order that
//! preserves the audit trail even when the run fails.
//!
//! Failure discipline: recoverable conditions (a quarantined source row, a
//! token that exhausted its retries) are recorded and the run continues.
//! Non-recoverable ones (type violations, batch failures, audit write
//! failures) stop dispatch - in-flight work items complete, `on_complete`
//! hooks still run best-effort, telemetry still drains, and the run is
//! marked failed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::task::JoinSet;

use elspeth_landscape::{
    FsPayloadStore, InMemoryLandscape, InMemoryPayloadStore, Landscape, NodeOutput,
    NodeRegistration, NodeStateStatus, PayloadStore, RunId, RunStatus, SqliteLandscape,
    CANONICAL_VERSION,
};

use crate::config::{PayloadBackend, PipelineDefinition, StageDefinition};
use crate::error::{EngineError, Result};
use crate::executors::{
    AggregationExecutor, CoalesceExecutor, CoalesceOutcome, ExecutorEnv, GateExecutor,
    SinkExecutor, TransformExecutor,
};
use crate::graph::ExecutionGraph;
use crate::plugin::{PluginContext, ValidationFailurePolicy};
use crate::rate_limit::RateLimiter;
use crate::processor::{
    process_work_item, PipelineRuntime, SinkStation, Stage, StageRuntime, WorkItem,
};
use crate::telemetry::{TelemetryEvent, TelemetryEventType, TelemetryExporter, TelemetryManager};
use crate::tokens::TokenManager;

/// What a run returned to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Rows terminated at sinks. Failed rows are not counted.
    pub rows_processed: u64,
}

/// Drives pipelines end to end.
#[derive(Default)]
pub struct Orchestrator {
    landscape_override: Option<Arc<dyn Landscape>>,
    payload_override: Option<Arc<dyn PayloadStore>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    exporters: Vec<Box<dyn TelemetryExporter>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an explicit recorder instead of the configured backend.
    /// Callers that inspect the audit trail after the run keep their own
    /// handle this way.
    #[must_use]
    pub fn with_landscape(mut self, landscape: Arc<dyn Landscape>) -> Self {
        self.landscape_override = Some(landscape);
        self
    }

    #[must_use]
    pub fn with_payload_store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.payload_override = Some(store);
        self
    }

    /// Shares a token-bucket limiter with every plugin context.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn with_exporter(mut self, exporter: Box<dyn TelemetryExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Compiles and runs a pipeline to completion.
    pub async fn run(self, definition: PipelineDefinition) -> Result<RunResult> {
        let graph = ExecutionGraph::compile(&definition)?;
        self.run_with_graph(definition, graph).await
    }

    /// Runs a pipeline against a pre-compiled graph.
    pub async fn run_with_graph(
        self,
        definition: PipelineDefinition,
        graph: ExecutionGraph,
    ) -> Result<RunResult> {
        let settings = definition.settings.clone();

        let payload_store: Arc<dyn PayloadStore> = match &self.payload_override {
            Some(store) => store.clone(),
            None => match settings.payload_store.backend {
                PayloadBackend::Memory => Arc::new(InMemoryPayloadStore::new()),
                PayloadBackend::Filesystem => {
                    let base_path = settings.payload_store.base_path.as_deref().ok_or_else(
                        || {
                            EngineError::Graph(crate::error::GraphValidationError::Invalid(
                                "filesystem payload store requires base_path".to_string(),
                            ))
                        },
                    )?;
                    Arc::new(FsPayloadStore::open(base_path).await.map_err(|e| {
                        EngineError::Audit(elspeth_landscape::AuditError::Storage(e.to_string()))
                    })?)
                }
            },
        };
        let inline_threshold_bytes = settings.payload_store.inline_threshold_bytes;
        let landscape: Arc<dyn Landscape> = match &self.landscape_override {
            Some(landscape) => landscape.clone(),
            None => match (&settings.landscape.enabled, &settings.landscape.url) {
                (true, Some(url)) => Arc::new(SqliteLandscape::open(
                    url,
                    payload_store.clone(),
                    inline_threshold_bytes,
                )?),
                // Disabled auditing still records in memory for the
                // duration of the process; nothing survives exit.
                _ => Arc::new(InMemoryLandscape::with_payload_store(
                    payload_store.clone(),
                    inline_threshold_bytes,
                )),
            },
        };

        let run = landscape
            .begin_run(&definition.config_value(), CANONICAL_VERSION)
            .await?;
        let run_id = run.run_id;
        tracing::info!(run_id = %run_id, config_hash = %run.config_hash, "run started");

        // Register the compiled topology under the graph's explicit IDs.
        for node_id in graph.topological_order() {
            let info = graph.node_info(*node_id).expect("topo order yields known nodes");
            landscape
                .register_node(NodeRegistration {
                    node_id: info.node_id,
                    run_id,
                    plugin_name: info.plugin_name.clone(),
                    node_type: info.node_type,
                    plugin_version: info.plugin_version.clone(),
                    determinism: info.determinism,
                    config: info.options.clone(),
                    input_schema: info.input_schema.clone(),
                    output_schema: info.output_schema.clone(),
                    sequence: info.sequence,
                })
                .await?;
        }
        for edge in graph.edges() {
            landscape
                .register_edge(run_id, edge.from, edge.to, &edge.label, edge.mode)
                .await?;
        }

        let telemetry = Arc::new(TelemetryManager::new(
            settings.telemetry.clone(),
            self.exporters,
        ));
        let env = ExecutorEnv {
            run_id,
            landscape: landscape.clone(),
            telemetry: telemetry.clone(),
            tokens: Arc::new(TokenManager::new(landscape.clone())),
        };

        // Bind stages and sinks to their executors.
        let PipelineDefinition {
            source,
            stages,
            sinks,
            output_sink,
            settings: _,
        } = definition;

        let rate_limiter = self.rate_limiter.clone();
        let make_ctx = |node_id, plugin_name: &str, options: &serde_json::Value| {
            let ctx = PluginContext::new(run_id, node_id, plugin_name, options.clone())
                .with_landscape(landscape.clone())
                .with_payload_store(payload_store.clone());
            match &rate_limiter {
                Some(limiter) => ctx.with_rate_limiter(limiter.clone()),
                None => ctx,
            }
        };

        let mut bound_stages = Vec::with_capacity(stages.len());
        for (index, stage) in stages.into_iter().enumerate() {
            let node_id = graph.stage_id_map()[index];
            let bound = match stage {
                StageDefinition::Transform { plugin, options, retry } => {
                    let plugin: Arc<dyn crate::plugin::TransformPlugin> = Arc::from(plugin);
                    let ctx = make_ctx(node_id, plugin.name(), &options);
                    Stage {
                        runtime: StageRuntime::Transform(TransformExecutor::new(
                            node_id,
                            plugin,
                            retry.unwrap_or_else(|| settings.retry.clone()),
                        )),
                        ctx,
                    }
                }
                StageDefinition::Gate { plugin, options, routes } => {
                    let plugin: Arc<dyn crate::plugin::GatePlugin> = Arc::from(plugin);
                    let ctx = make_ctx(node_id, plugin.name(), &options);
                    Stage {
                        runtime: StageRuntime::Gate(GateExecutor::new(
                            node_id,
                            plugin,
                            routes,
                            settings.retry.clone(),
                        )),
                        ctx,
                    }
                }
                StageDefinition::Aggregation { plugin, options, trigger, output_mode } => {
                    let ctx = make_ctx(node_id, plugin.name(), &options);
                    Stage {
                        runtime: StageRuntime::Aggregation(Arc::new(AggregationExecutor::new(
                            node_id,
                            plugin,
                            trigger,
                            output_mode,
                        ))),
                        ctx,
                    }
                }
                StageDefinition::Coalesce { plugin, options, name, policy } => {
                    let ctx = make_ctx(node_id, plugin.name(), &options);
                    Stage {
                        runtime: StageRuntime::Coalesce(Arc::new(CoalesceExecutor::new(
                            node_id, name, policy, plugin,
                        ))),
                        ctx,
                    }
                }
            };
            bound_stages.push(bound);
        }

        let mut bound_sinks = std::collections::BTreeMap::new();
        for (name, sink) in sinks {
            let node_id = graph.sink_id_map()[&name];
            let ctx = make_ctx(node_id, sink.plugin.name(), &sink.options);
            bound_sinks.insert(
                name.clone(),
                SinkStation {
                    executor: Arc::new(SinkExecutor::new(
                        node_id,
                        name,
                        sink.plugin,
                        settings.retry.clone(),
                    )),
                    ctx,
                },
            );
        }

        let runtime = Arc::new(PipelineRuntime {
            env: env.clone(),
            stages: bound_stages,
            sinks: bound_sinks,
            output_sink,
            fail_fast: settings.concurrency.fail_fast,
            rows_written: AtomicU64::new(0),
        });

        let mut source_plugin = source.plugin;
        let source_node_id = graph.source_id();
        let source_ctx = make_ctx(source_node_id, source_plugin.name(), &source.options);

        let mut fatal: Option<EngineError> = None;

        // on_start everywhere; errors fail the run before any row moves.
        if let Err(err) = start_plugins(&runtime, &mut source_plugin, &source_ctx).await {
            fatal = Some(err);
        }

        let mut pool = WorkPool::new(runtime.clone(), settings.concurrency.max_workers);

        // Pump the source.
        if fatal.is_none() {
            let policy = source_plugin.on_validation_failure();
            let schema = source_plugin.output_schema().clone();
            let mut row_index: u64 = 0;
            loop {
                let next = match source_plugin.next_row(&source_ctx).await {
                    Ok(next) => next,
                    Err(err) => {
                        fatal = Some(EngineError::StageFailed {
                            stage: source_plugin.name().to_string(),
                            attempts: 1,
                            reason: err.to_string(),
                        });
                        break;
                    }
                };
                let Some(raw) = next else { break };
                let index = row_index;
                row_index += 1;

                let issues = schema.validate(&raw);
                if !issues.is_empty() {
                    if let Err(err) = quarantine_row(
                        &runtime, &env, source_node_id, index, &raw, &issues, &policy,
                    )
                    .await
                    {
                        fatal = Some(err);
                        break;
                    }
                    continue;
                }

                let seeded = seed_row(&env, source_node_id, index, raw).await;
                match seeded {
                    Ok(item) => pool.push(item),
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                }
                if let Err(err) = pool.drain().await {
                    fatal = Some(err);
                    break;
                }
            }
        }

        if fatal.is_none() {
            if let Err(err) = pool.drain().await {
                fatal = Some(err);
            }
        }

        // Source exhausted: flush every non-empty aggregation buffer in
        // topological order, repeating while flushes feed later buffers.
        if fatal.is_none() {
            if let Err(err) = flush_aggregations(&runtime, &env, &mut pool).await {
                fatal = Some(err);
            }
        }

        // Resolve coalesce groups still waiting.
        if fatal.is_none() {
            if let Err(err) = finalize_coalesces(&runtime, &env, &mut pool).await {
                fatal = Some(err);
            }
        }

        // Wind-down: best-effort hooks, then the audit record, then
        // telemetry.
        complete_plugins(&runtime, &mut source_plugin, &source_ctx).await;

        let status = if fatal.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if let Err(err) = landscape.complete_run(run_id, status).await {
            tracing::error!(run_id = %run_id, error = %err, "failed to record run completion");
        }
        telemetry.shutdown().await;

        let rows_processed = runtime.rows_written.load(Ordering::Relaxed);
        if let Some(err) = &fatal {
            tracing::error!(run_id = %run_id, error = %err, rows_processed, "run failed");
        } else {
            tracing::info!(run_id = %run_id, rows_processed, "run completed");
        }
        Ok(RunResult {
            run_id,
            status,
            rows_processed,
        })
    }
}

async fn start_plugins(
    runtime: &PipelineRuntime,
    source: &mut Box<dyn crate::plugin::SourcePlugin>,
    source_ctx: &PluginContext,
) -> Result<()> {
    source
        .on_register(source_ctx)
        .await
        .map_err(|e| EngineError::Lifecycle {
            stage: source.name().to_string(),
            message: e.to_string(),
        })?;
    source
        .on_start(source_ctx)
        .await
        .map_err(|e| EngineError::Lifecycle {
            stage: source.name().to_string(),
            message: e.to_string(),
        })?;
    for stage in &runtime.stages {
        match &stage.runtime {
            StageRuntime::Transform(executor) => {
                executor.on_register(&stage.ctx).await?;
                executor.on_start(&stage.ctx).await?;
            }
            StageRuntime::Gate(executor) => {
                executor.on_register(&stage.ctx).await?;
                executor.on_start(&stage.ctx).await?;
            }
            StageRuntime::Aggregation(executor) => {
                executor.on_register(&stage.ctx).await?;
                executor.on_start(&stage.ctx).await?;
            }
            StageRuntime::Coalesce(executor) => {
                executor.on_register(&stage.ctx).await?;
                executor.on_start(&stage.ctx).await?;
            }
        }
    }
    for station in runtime.sinks.values() {
        station.executor.on_register(&station.ctx).await?;
        station.executor.on_start(&station.ctx).await?;
    }
    Ok(())
}

/// `on_complete` is best-effort by contract: failures are logged and do
/// not change the run status.
async fn complete_plugins(
    runtime: &PipelineRuntime,
    source: &mut Box<dyn crate::plugin::SourcePlugin>,
    source_ctx: &PluginContext,
) {
    if let Err(err) = source.on_complete(source_ctx).await {
        tracing::warn!(stage = source.name(), error = %err, "source close failed");
    }
    for stage in &runtime.stages {
        match &stage.runtime {
            StageRuntime::Transform(executor) => executor.on_complete(&stage.ctx).await,
            StageRuntime::Gate(executor) => executor.on_complete(&stage.ctx).await,
            StageRuntime::Aggregation(executor) => executor.on_complete(&stage.ctx).await,
            StageRuntime::Coalesce(executor) => executor.on_complete(&stage.ctx).await,
        }
    }
    for station in runtime.sinks.values() {
        station.executor.on_complete(&station.ctx).await;
    }
}

/// Records a row's audit trail at the source and seeds its token.
async fn seed_row(
    env: &ExecutorEnv,
    source_node_id: elspeth_landscape::NodeId,
    row_index: u64,
    raw: serde_json::Value,
) -> Result<WorkItem> {
    let row = env
        .landscape
        .create_row(env.run_id, source_node_id, row_index, &raw)
        .await?;
    let token = env.tokens.seed(row.row_id, raw.clone()).await?;
    let started = Instant::now();
    let state = env
        .open_state(token.token_id, source_node_id, 0, 1, None)
        .await?;
    env.close_state(
        &state,
        NodeStateStatus::Completed,
        Some(NodeOutput::Single(raw)),
        started,
        None,
    )
    .await?;
    Ok(WorkItem::new(token, 0))
}

/// Records a quarantine and optionally writes the raw row to the
/// configured quarantine sink. The row never becomes a token.
async fn quarantine_row(
    runtime: &PipelineRuntime,
    env: &ExecutorEnv,
    source_node_id: elspeth_landscape::NodeId,
    row_index: u64,
    raw: &serde_json::Value,
    issues: &[String],
    policy: &ValidationFailurePolicy,
) -> Result<()> {
    let reason = issues.join("; ");
    env.landscape
        .record_validation_failure(env.run_id, source_node_id, row_index, &reason, Some(raw))
        .await?;
    env.telemetry
        .handle_event(
            TelemetryEvent::new(TelemetryEventType::Quarantine, env.run_id)
                .with_node(source_node_id)
                .with_detail(json!({"row_index": row_index, "reason": reason})),
        )
        .await;
    tracing::warn!(row_index, reason = %reason, "source row quarantined");
    if let ValidationFailurePolicy::Quarantine(sink_name) = policy {
        let station = &runtime.sinks[sink_name];
        station.executor.write_raw(&station.ctx, raw).await?;
    }
    Ok(())
}

async fn flush_aggregations(
    runtime: &Arc<PipelineRuntime>,
    env: &ExecutorEnv,
    pool: &mut WorkPool,
) -> Result<()> {
    loop {
        let mut produced = false;
        for (index, stage) in runtime.stages.iter().enumerate() {
            let StageRuntime::Aggregation(executor) = &stage.runtime else {
                continue;
            };
            let flushed = executor.flush_pending(env, &stage.ctx, index as u32).await?;
            if flushed.is_empty() {
                continue;
            }
            produced = true;
            for token in flushed {
                pool.push(WorkItem::new(token, index + 1));
            }
            pool.drain().await?;
        }
        if !produced {
            return Ok(());
        }
    }
}

async fn finalize_coalesces(
    runtime: &Arc<PipelineRuntime>,
    env: &ExecutorEnv,
    pool: &mut WorkPool,
) -> Result<()> {
    for (index, stage) in runtime.stages.iter().enumerate() {
        let StageRuntime::Coalesce(executor) = &stage.runtime else {
            continue;
        };
        for outcome in executor.finalize(env, &stage.ctx, index as u32).await? {
            if let CoalesceOutcome::Joined(token) = outcome {
                pool.push(WorkItem::new(token, index + 1));
            }
        }
        pool.drain().await?;
    }
    Ok(())
}

/// Work-item scheduler: single-threaded inline by default, a bounded
/// `JoinSet` pool when `max_workers > 1`. On a fatal error no new items
/// are dispatched; in-flight items finish so their audit states close.
struct WorkPool {
    runtime: Arc<PipelineRuntime>,
    queue: VecDeque<WorkItem>,
    max_workers: usize,
}

impl WorkPool {
    fn new(runtime: Arc<PipelineRuntime>, max_workers: usize) -> Self {
        Self {
            runtime,
            queue: VecDeque::new(),
            max_workers: max_workers.max(1),
        }
    }

    fn push(&mut self, item: WorkItem) {
        self.queue.push_back(item);
    }

    async fn drain(&mut self) -> Result<()> {
        if self.max_workers == 1 {
            while let Some(item) = self.queue.pop_front() {
                let children = process_work_item(&self.runtime, item).await?;
                self.queue.extend(children);
            }
            return Ok(());
        }

        let mut tasks: JoinSet<Result<Vec<WorkItem>>> = JoinSet::new();
        let mut fatal: Option<EngineError> = None;
        loop {
            while fatal.is_none()
                && tasks.len() < self.max_workers
                && !self.queue.is_empty()
            {
                let item = self.queue.pop_front().expect("queue checked non-empty");
                let runtime = self.runtime.clone();
                tasks.spawn(async move { process_work_item(&runtime, item).await });
            }
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(children)) => {
                    if fatal.is_none() {
                        self.queue.extend(children);
                    }
                }
                Ok(Err(err)) => {
                    if fatal.is_none() {
                        tracing::error!(error = %err, "worker failed; draining in-flight items");
                        fatal = Some(err);
                        self.queue.clear();
                    }
                }
                Err(join_err) => {
                    if fatal.is_none() {
                        fatal = Some(EngineError::Internal(format!(
                            "worker panicked: {join_err}"
                        )));
                        self.queue.clear();
                    }
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
