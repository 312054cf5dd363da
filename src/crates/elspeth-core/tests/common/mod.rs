//! Test plugins shared by the scenario tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use elspeth_core::{
    AcceptResult, GateResult, PluginContext, PluginResult, RoutingAction, Schema, SinkReceipt,
    TransformResult, ValidationFailurePolicy,
};
use elspeth_core::{
    AggregationPlugin, CoalescePlugin, GatePlugin, SinkPlugin, SourcePlugin, TransformPlugin,
};
use elspeth_landscape::RouteMode;

/// Source yielding a fixed list of rows.
pub struct VecSource {
    rows: std::vec::IntoIter<Value>,
    schema: Schema,
    policy: ValidationFailurePolicy,
}

impl VecSource {
    pub fn new(rows: Vec<Value>, schema: Schema) -> Self {
        Self {
            rows: rows.into_iter(),
            schema,
            policy: ValidationFailurePolicy::Discard,
        }
    }

    pub fn with_quarantine(mut self, sink: &str) -> Self {
        self.policy = ValidationFailurePolicy::Quarantine(sink.to_string());
        self
    }
}

#[async_trait]
impl SourcePlugin for VecSource {
    fn name(&self) -> &str {
        "vec_source"
    }

    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn on_validation_failure(&self) -> ValidationFailurePolicy {
        self.policy.clone()
    }

    async fn next_row(&mut self, _ctx: &PluginContext) -> PluginResult<Option<Value>> {
        Ok(self.rows.next())
    }
}

/// Doubles the `score` field.
pub struct DoubleScore;

#[async_trait]
impl TransformPlugin for DoubleScore {
    fn name(&self) -> &str {
        "double_score"
    }

    async fn process(&self, mut row: Value, _ctx: &PluginContext) -> PluginResult<TransformResult> {
        let score = row["score"].as_i64().unwrap_or(0);
        row["score"] = json!(score * 2);
        Ok(TransformResult::success(row))
    }
}

/// Routes rows with `score >= threshold` to the `high` route label.
pub struct ScoreGate {
    pub threshold: i64,
}

#[async_trait]
impl GatePlugin for ScoreGate {
    fn name(&self) -> &str {
        "score_gate"
    }

    async fn evaluate(&self, row: Value, _ctx: &PluginContext) -> PluginResult<GateResult> {
        let score = row["score"].as_i64().unwrap_or(0);
        let action = if score >= self.threshold {
            RoutingAction::route_to(
                vec!["high".to_string()],
                RouteMode::Move,
                json!({"rule": format!("score {score} >= {}", self.threshold)}),
            )
        } else {
            RoutingAction::proceed(json!({"rule": format!("score {score} below threshold")}))
        };
        Ok(GateResult::new(row, action))
    }
}

/// Forks every row into the given branches.
pub struct ForkGate {
    pub branches: Vec<String>,
}

#[async_trait]
impl GatePlugin for ForkGate {
    fn name(&self) -> &str {
        "fork_gate"
    }

    async fn evaluate(&self, row: Value, _ctx: &PluginContext) -> PluginResult<GateResult> {
        let action = RoutingAction::fork_to(self.branches.clone(), json!({"rule": "fan out"}));
        Ok(GateResult::new(row, action))
    }
}

/// Explodes an array field into one row per element.
pub struct JsonExplode {
    pub array_field: String,
    pub output_field: String,
    pub include_index: bool,
}

#[async_trait]
impl TransformPlugin for JsonExplode {
    fn name(&self) -> &str {
        "json_explode"
    }

    fn creates_tokens(&self) -> bool {
        true
    }

    async fn process(&self, row: Value, _ctx: &PluginContext) -> PluginResult<TransformResult> {
        let items = row[&self.array_field]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut rows = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut out = row.clone();
            out.as_object_mut().unwrap().remove(&self.array_field);
            out[&self.output_field] = item;
            if self.include_index {
                out[format!("{}_index", self.output_field)] = json!(index);
            }
            rows.push(out);
        }
        Ok(TransformResult::success_multi(rows))
    }
}

/// Passthrough aggregation enriching each buffered row with the batch
/// size.
#[derive(Default)]
pub struct EnrichBatch {
    buffered: Vec<Value>,
}

#[async_trait]
impl AggregationPlugin for EnrichBatch {
    fn name(&self) -> &str {
        "enrich_batch"
    }

    async fn accept(&mut self, row: Value, _ctx: &PluginContext) -> PluginResult<AcceptResult> {
        self.buffered.push(row);
        Ok(AcceptResult::accepted())
    }

    async fn flush(&mut self, _ctx: &PluginContext) -> PluginResult<Vec<Value>> {
        let size = self.buffered.len();
        Ok(self
            .buffered
            .drain(..)
            .map(|mut row| {
                row["batch_size"] = json!(size);
                row["enriched"] = json!(true);
                row
            })
            .collect())
    }

    fn reset(&mut self) {
        self.buffered.clear();
    }
}

/// Transform-mode aggregation grouping buffered rows by `category`.
#[derive(Default)]
pub struct GroupByCategory {
    buffered: Vec<Value>,
}

#[async_trait]
impl AggregationPlugin for GroupByCategory {
    fn name(&self) -> &str {
        "group_by_category"
    }

    async fn accept(&mut self, row: Value, _ctx: &PluginContext) -> PluginResult<AcceptResult> {
        self.buffered.push(row);
        Ok(AcceptResult::accepted())
    }

    async fn flush(&mut self, _ctx: &PluginContext) -> PluginResult<Vec<Value>> {
        let mut groups: std::collections::BTreeMap<String, (u64, i64)> = Default::default();
        for row in self.buffered.drain(..) {
            let category = row["category"].as_str().unwrap_or("unknown").to_string();
            let amount = row["amount"].as_i64().unwrap_or(0);
            let entry = groups.entry(category).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += amount;
        }
        Ok(groups
            .into_iter()
            .map(|(category, (count, total))| {
                json!({"category": category, "count": count, "total": total})
            })
            .collect())
    }

    fn reset(&mut self) {
        self.buffered.clear();
    }
}

/// Aggregation whose flush always fails; for batch-atomicity tests.
#[derive(Default)]
pub struct ExplodingBatch;

#[async_trait]
impl AggregationPlugin for ExplodingBatch {
    fn name(&self) -> &str {
        "exploding_batch"
    }

    async fn accept(&mut self, _row: Value, _ctx: &PluginContext) -> PluginResult<AcceptResult> {
        Ok(AcceptResult::accepted())
    }

    async fn flush(&mut self, _ctx: &PluginContext) -> PluginResult<Vec<Value>> {
        Err(elspeth_core::PluginError::Fatal(
            "aggregate computation failed".to_string(),
        ))
    }

    fn reset(&mut self) {}
}

/// Fails with a retryable error for the first `retryable_failures`
/// attempts, then either succeeds or fails permanently.
pub struct FlakyTransform {
    pub attempts: Arc<AtomicU32>,
    pub retryable_failures: u32,
    pub succeed_after: bool,
}

#[async_trait]
impl TransformPlugin for FlakyTransform {
    fn name(&self) -> &str {
        "flaky_transform"
    }

    async fn process(&self, mut row: Value, _ctx: &PluginContext) -> PluginResult<TransformResult> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.retryable_failures {
            return Ok(TransformResult::error(
                json!({"cause": "transient", "attempt": attempt}),
                true,
            ));
        }
        if self.succeed_after {
            row["attempts"] = json!(attempt);
            Ok(TransformResult::success(row))
        } else {
            Ok(TransformResult::error(
                json!({"cause": "permanent", "attempt": attempt}),
                false,
            ))
        }
    }
}

/// Fails its first invocation permanently; succeeds afterwards. Used to
/// kill exactly one fork branch.
pub struct FailOnceTransform {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl TransformPlugin for FailOnceTransform {
    fn name(&self) -> &str {
        "fail_once_transform"
    }

    async fn process(&self, row: Value, _ctx: &PluginContext) -> PluginResult<TransformResult> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(TransformResult::error(
                json!({"cause": "first call fails"}),
                false,
            ));
        }
        Ok(TransformResult::success(row))
    }
}

/// Enriches rows through a (simulated) external lookup, recording the
/// outbound call in the audit trail.
pub struct LookupTransform;

#[async_trait]
impl TransformPlugin for LookupTransform {
    fn name(&self) -> &str {
        "lookup_transform"
    }

    fn determinism(&self) -> elspeth_landscape::Determinism {
        elspeth_landscape::Determinism::IoRead
    }

    async fn process(&self, mut row: Value, ctx: &PluginContext) -> PluginResult<TransformResult> {
        ctx.rate_limit("lookup_api", 1.0).await;
        let response = json!({"verdict": "known"});
        ctx.record_call(
            "lookup_api",
            Some(row.clone()),
            Some(response.clone()),
            "ok",
            Some(2),
        )
        .await?;
        row["verdict"] = response["verdict"].clone();
        Ok(TransformResult::success(row))
    }
}

/// Merges forked branch rows into one object.
pub struct MergeBranches;

#[async_trait]
impl CoalescePlugin for MergeBranches {
    fn name(&self) -> &str {
        "merge_branches"
    }

    async fn merge(&self, rows: Vec<Value>, _ctx: &PluginContext) -> PluginResult<Value> {
        Ok(json!({"merged": rows.len(), "branches": rows}))
    }
}

/// Sink recording written rows in memory.
pub struct CollectSink {
    name: String,
    schema: Schema,
    pub written: Arc<Mutex<Vec<Value>>>,
}

impl CollectSink {
    pub fn new(name: &str, schema: Schema) -> (Self, Arc<Mutex<Vec<Value>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                name: name.to_string(),
                schema,
                written: written.clone(),
            },
            written,
        )
    }
}

#[async_trait]
impl SinkPlugin for CollectSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn write(&mut self, row: &Value, _ctx: &PluginContext) -> PluginResult<SinkReceipt> {
        let mut written = self.written.lock().unwrap();
        written.push(row.clone());
        Ok(SinkReceipt {
            kind: "memory".to_string(),
            path_or_uri: format!("mem://{}/{}", self.name, written.len()),
            content_hash: None,
            size_bytes: None,
            idempotency_key: None,
        })
    }
}

/// Sink that always fails its writes.
pub struct RejectingSink {
    schema: Schema,
}

impl RejectingSink {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl SinkPlugin for RejectingSink {
    fn name(&self) -> &str {
        "rejecting_sink"
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    async fn write(&mut self, _row: &Value, _ctx: &PluginContext) -> PluginResult<SinkReceipt> {
        Err(elspeth_core::PluginError::Fatal(
            "downstream unavailable".to_string(),
        ))
    }
}
