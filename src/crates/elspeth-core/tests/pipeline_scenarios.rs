//! End-to-end pipeline scenarios against the in-memory audit backend.

mod common;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use common::*;
use elspeth_core::{
    AggregationOutputMode, BackpressureMode, CoalescePolicy, EngineSettings, ExportError,
    FieldSpec, FieldType, GateResult, Granularity, Orchestrator, PipelineDefinition, PluginContext,
    PluginResult, RetryConfig, RouteTarget, RoutingAction, RunResult, Schema, SinkDefinition,
    SourceDefinition, StageDefinition, TelemetryEvent, TelemetryEventType, TelemetryExporter,
    TelemetryManager, TelemetrySettings, TriggerConfig,
};
use elspeth_landscape::{
    explain_run, InMemoryLandscape, Landscape, NodeId, NodeStateStatus, NodeType, RouteMode,
    RoutingKind, RowOutcome, RunId, RunStatus,
};

fn score_schema() -> Schema {
    Schema::new()
        .field("id", FieldSpec::required(FieldType::Int))
        .field("score", FieldSpec::required(FieldType::Int))
}

fn open_schema() -> Schema {
    Schema::new()
}

fn score_rows() -> Vec<Value> {
    vec![
        json!({"id": 1, "score": 75}),
        json!({"id": 2, "score": 45}),
        json!({"id": 3, "score": 90}),
    ]
}

fn sink(plugin: impl elspeth_core::SinkPlugin + 'static) -> SinkDefinition {
    SinkDefinition {
        plugin: Box::new(plugin),
        options: json!({}),
    }
}

fn definition(
    source: impl elspeth_core::SourcePlugin + 'static,
    stages: Vec<StageDefinition>,
    sinks: BTreeMap<String, SinkDefinition>,
    output_sink: &str,
) -> PipelineDefinition {
    PipelineDefinition {
        source: SourceDefinition {
            plugin: Box::new(source),
            options: json!({}),
        },
        stages,
        sinks,
        output_sink: output_sink.to_string(),
        settings: EngineSettings::default(),
    }
}

async fn run_recorded(
    definition: PipelineDefinition,
) -> (RunResult, Arc<InMemoryLandscape>) {
    let landscape = Arc::new(InMemoryLandscape::new());
    let result = Orchestrator::new()
        .with_landscape(landscape.clone())
        .run(definition)
        .await
        .expect("run completes");
    (result, landscape)
}

async fn node_types(
    landscape: &InMemoryLandscape,
    run_id: RunId,
) -> HashMap<NodeId, NodeType> {
    landscape
        .nodes_for_run(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| (n.node_id, n.node_type))
        .collect()
}

// Linear pipeline: source, doubling transform, one sink.
#[tokio::test]
async fn test_linear_pipeline_full_audit_trail() {
    let (results_sink, written) = CollectSink::new("results", score_schema());
    let def = definition(
        VecSource::new(score_rows(), score_schema()),
        vec![StageDefinition::Transform {
            plugin: Box::new(DoubleScore),
            options: json!({}),
            retry: None,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows_processed, 3);
    assert_eq!(
        written.lock().unwrap().clone(),
        vec![
            json!({"id": 1, "score": 150}),
            json!({"id": 2, "score": 90}),
            json!({"id": 3, "score": 180}),
        ]
    );

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 3);
    let types = node_types(&landscape, result.run_id).await;
    for token in &explain.tokens {
        assert_eq!(token.outcome, RowOutcome::Completed);
        assert!(token.routing.is_empty(), "no gates, no routing events");
        assert_eq!(token.states.len(), 3);
        let kinds: Vec<NodeType> = token.states.iter().map(|s| types[&s.node_id]).collect();
        assert_eq!(
            kinds,
            vec![NodeType::Source, NodeType::Transform, NodeType::Sink]
        );
        for state in &token.states {
            assert_eq!(state.status, NodeStateStatus::Completed);
        }
        let transform_state = &token.states[1];
        assert_ne!(transform_state.output_hash, transform_state.input_hash);
    }
    let artifacts = landscape.artifacts_for_run(result.run_id).await.unwrap();
    assert_eq!(artifacts.len(), 3);
}

// A gate routes above-threshold rows to a named sink.
#[tokio::test]
async fn test_gate_routes_to_sink_and_continues() {
    let (flagged_sink, flagged) = CollectSink::new("flagged", score_schema());
    let (results_sink, results) = CollectSink::new("results", score_schema());
    let def = definition(
        VecSource::new(score_rows(), score_schema()),
        vec![StageDefinition::Gate {
            plugin: Box::new(ScoreGate { threshold: 50 }),
            options: json!({"threshold": 50}),
            routes: BTreeMap::from([
                (
                    "high".to_string(),
                    RouteTarget::Sink {
                        name: "flagged".to_string(),
                        mode: RouteMode::Move,
                    },
                ),
                ("low".to_string(), RouteTarget::Continue),
            ]),
        }],
        BTreeMap::from([
            ("flagged".to_string(), sink(flagged_sink)),
            ("results".to_string(), sink(results_sink)),
        ]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 3);
    assert_eq!(flagged.lock().unwrap().len(), 2);
    assert_eq!(results.lock().unwrap().len(), 1);
    assert_eq!(results.lock().unwrap()[0]["id"], json!(2));

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    let mut routed = 0;
    let mut continued = 0;
    for token in &explain.tokens {
        assert_eq!(token.routing.len(), 1, "every gate pass records a decision");
        let event = &token.routing[0];
        match event.kind {
            RoutingKind::RouteToSink => {
                assert_eq!(event.destinations, vec!["flagged".to_string()]);
                assert_eq!(token.outcome, RowOutcome::Routed);
                routed += 1;
            }
            RoutingKind::Continue => {
                assert!(event.destinations.is_empty());
                assert_eq!(token.outcome, RowOutcome::Completed);
                continued += 1;
            }
            RoutingKind::ForkToPaths => panic!("no forks in this pipeline"),
        }
    }
    assert_eq!((routed, continued), (2, 1));
}

// Deaggregation: one order row explodes into one row per item.
#[tokio::test]
async fn test_json_explode_expands_tokens() {
    let schema = Schema::new()
        .field("order_id", FieldSpec::required(FieldType::Int))
        .field("items", FieldSpec::required(FieldType::Array));
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(
            vec![json!({
                "order_id": 3,
                "items": [{"sku": "A1"}, {"sku": "D4"}, {"sku": "E5"}],
            })],
            schema,
        ),
        vec![StageDefinition::Transform {
            plugin: Box::new(JsonExplode {
                array_field: "items".to_string(),
                output_field: "item".to_string(),
                include_index: true,
            }),
            options: json!({"array_field": "items"}),
            retry: None,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 3);
    let rows = written.lock().unwrap().clone();
    assert_eq!(rows.len(), 3);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row["order_id"], json!(3));
        assert_eq!(row["item_index"], json!(i));
        assert!(row.get("items").is_none());
    }

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 4);
    let parent = explain
        .tokens
        .iter()
        .find(|t| t.token.expand_group_id.is_none())
        .unwrap();
    assert_eq!(parent.outcome, RowOutcome::Expanded);

    let children: Vec<_> = explain
        .tokens
        .iter()
        .filter(|t| t.token.expand_group_id.is_some())
        .collect();
    assert_eq!(children.len(), 3);
    let group = children[0].token.expand_group_id;
    let mut ordinals = Vec::new();
    for child in &children {
        assert_eq!(child.token.expand_group_id, group);
        assert_eq!(child.outcome, RowOutcome::Completed);
        let parents = landscape.token_parents(child.token.token_id).await.unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].parent_token_id, parent.token.token_id);
        ordinals.push(parents[0].ordinal);
    }
    ordinals.sort_unstable();
    assert_eq!(ordinals, vec![0, 1, 2]);
}

// Passthrough aggregation preserves token identity.
#[tokio::test]
async fn test_aggregation_passthrough_preserves_tokens() {
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(score_rows(), score_schema()),
        vec![StageDefinition::Aggregation {
            plugin: Box::new(EnrichBatch::default()),
            options: json!({}),
            trigger: TriggerConfig::count(3),
            output_mode: AggregationOutputMode::Passthrough,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 3);
    for row in written.lock().unwrap().iter() {
        assert_eq!(row["batch_size"], json!(3));
        assert_eq!(row["enriched"], json!(true));
    }

    let batches = landscape.batches_for_run(result.run_id).await.unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(
        landscape.batch_members(batch.batch_id).await.unwrap().len(),
        3
    );
    assert_eq!(
        landscape.batch_outputs(batch.batch_id).await.unwrap().len(),
        3
    );

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 3, "passthrough creates no tokens");
    for token in &explain.tokens {
        assert_eq!(token.outcome, RowOutcome::Completed);
    }
}

// Transform-mode aggregation groups inputs into fresh tokens.
#[tokio::test]
async fn test_aggregation_transform_mode_consumes_and_expands() {
    let rows = vec![
        json!({"id": 1, "category": "A", "amount": 10}),
        json!({"id": 2, "category": "A", "amount": 20}),
        json!({"id": 3, "category": "B", "amount": 5}),
        json!({"id": 4, "category": "A", "amount": 1}),
        json!({"id": 5, "category": "B", "amount": 7}),
    ];
    let schema = Schema::new()
        .field("id", FieldSpec::required(FieldType::Int))
        .field("category", FieldSpec::required(FieldType::String))
        .field("amount", FieldSpec::required(FieldType::Int));
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(rows, schema),
        vec![StageDefinition::Aggregation {
            plugin: Box::new(GroupByCategory::default()),
            options: json!({}),
            trigger: TriggerConfig::count(5),
            output_mode: AggregationOutputMode::Transform,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 2);
    assert_eq!(
        written.lock().unwrap().clone(),
        vec![
            json!({"category": "A", "count": 3, "total": 31}),
            json!({"category": "B", "count": 2, "total": 12}),
        ]
    );

    let batches = landscape.batches_for_run(result.run_id).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        landscape.batch_members(batches[0].batch_id).await.unwrap().len(),
        5
    );
    assert_eq!(
        landscape.batch_outputs(batches[0].batch_id).await.unwrap().len(),
        2
    );

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 7, "5 inputs + 2 outputs");
    let inputs: Vec<_> = explain
        .tokens
        .iter()
        .filter(|t| t.token.expand_group_id.is_none())
        .collect();
    let outputs: Vec<_> = explain
        .tokens
        .iter()
        .filter(|t| t.token.expand_group_id.is_some())
        .collect();
    assert_eq!(inputs.len(), 5);
    assert_eq!(outputs.len(), 2);
    for input in &inputs {
        assert_eq!(input.outcome, RowOutcome::ConsumedInBatch);
    }
    // Both outputs link back to the triggering (last) input token.
    let members = landscape.batch_members(batches[0].batch_id).await.unwrap();
    let trigger_token = members.last().unwrap().token_id;
    for output in &outputs {
        assert_eq!(output.outcome, RowOutcome::Completed);
        let parents = landscape.token_parents(output.token.token_id).await.unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].parent_token_id, trigger_token);
    }
}

// Retry with backoff, then permanent failure.
#[tokio::test]
async fn test_retry_then_fail_records_every_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let (results_sink, written) = CollectSink::new("results", score_schema());
    let mut def = definition(
        VecSource::new(vec![json!({"id": 1, "score": 10})], score_schema()),
        vec![StageDefinition::Transform {
            plugin: Box::new(FlakyTransform {
                attempts: attempts.clone(),
                retryable_failures: 2,
                succeed_after: false,
            }),
            options: json!({}),
            retry: Some(RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter: Duration::ZERO,
            }),
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    def.settings.retry = RetryConfig::default();
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.status, RunStatus::Completed, "one failed token does not fail the run");
    assert_eq!(result.rows_processed, 0);
    assert!(written.lock().unwrap().is_empty(), "no downstream work");

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 1);
    let token = &explain.tokens[0];
    assert_eq!(token.outcome, RowOutcome::Failed);

    let types = node_types(&landscape, result.run_id).await;
    let transform_states: Vec<_> = token
        .states
        .iter()
        .filter(|s| types[&s.node_id] == NodeType::Transform)
        .collect();
    assert_eq!(transform_states.len(), 3);
    let statuses: Vec<NodeStateStatus> =
        transform_states.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            NodeStateStatus::Retried,
            NodeStateStatus::Retried,
            NodeStateStatus::Failed,
        ]
    );
    assert_eq!(
        transform_states.iter().map(|s| s.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    // Backoff: >= 10ms between attempts 1-2, >= 20ms between 2-3.
    let gap_1 = transform_states[1].started_at - transform_states[0].started_at;
    let gap_2 = transform_states[2].started_at - transform_states[1].started_at;
    assert!(gap_1.num_milliseconds() >= 10, "gap_1 = {gap_1}");
    assert!(gap_2.num_milliseconds() >= 20, "gap_2 = {gap_2}");
}

// DROP back-pressure absorbs a burst without blocking the producer.
#[tokio::test]
async fn test_telemetry_drop_mode_burst() {
    struct SlowExporter {
        seen: Arc<std::sync::Mutex<Vec<u64>>>,
    }

    #[async_trait::async_trait]
    impl TelemetryExporter for SlowExporter {
        fn name(&self) -> &str {
            "slow"
        }
        async fn export(&mut self, event: &TelemetryEvent) -> Result<(), ExportError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.seen
                .lock()
                .unwrap()
                .push(event.detail["n"].as_u64().unwrap());
            Ok(())
        }
    }

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let manager = TelemetryManager::new(
        TelemetrySettings {
            granularity: Granularity::All,
            backpressure_mode: BackpressureMode::Drop,
            queue_capacity: 1000,
        },
        vec![Box::new(SlowExporter { seen: seen.clone() })],
    );

    let run_id = RunId::generate();
    let burst_started = Instant::now();
    for n in 0..2500u64 {
        manager
            .handle_event(
                TelemetryEvent::new(TelemetryEventType::NodeCompleted, run_id)
                    .with_detail(json!({"n": n})),
            )
            .await;
    }
    let burst_elapsed = burst_started.elapsed();
    assert!(
        burst_elapsed < Duration::from_secs(1),
        "producer must never block in DROP mode (took {burst_elapsed:?})"
    );

    let health = manager.health();
    assert!(
        health.events_dropped >= 1450,
        "expected most of the overflow dropped, got {}",
        health.events_dropped
    );
    manager.shutdown().await;

    // Accepted events reach the exporter in producer order.
    let seen = seen.lock().unwrap();
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(*seen, sorted);
    assert!(!seen.is_empty());
}

// Quarantine: invalid source rows never become tokens.
#[tokio::test]
async fn test_source_validation_quarantines_rows() {
    let (quarantine_sink, quarantined) = CollectSink::new("quarantine", open_schema());
    let (results_sink, written) = CollectSink::new("results", score_schema());
    let def = definition(
        VecSource::new(
            vec![
                json!({"id": 1, "score": 75}),
                json!({"id": 2}),
                json!({"id": "three", "score": 1}),
            ],
            score_schema(),
        )
        .with_quarantine("quarantine"),
        vec![],
        BTreeMap::from([
            ("results".to_string(), sink(results_sink)),
            ("quarantine".to_string(), sink(quarantine_sink)),
        ]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows_processed, 1);
    assert_eq!(written.lock().unwrap().len(), 1);
    assert_eq!(quarantined.lock().unwrap().len(), 2);

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 1, "quarantined rows never become tokens");
    assert_eq!(explain.quarantined.len(), 2);
    assert_eq!(explain.quarantined[0].row_index, 1);
    assert_eq!(explain.quarantined[1].row_index, 2);
}

// Copy-mode routing: the sink is written and the token still completes
// the spine.
#[tokio::test]
async fn test_copy_route_also_continues() {
    struct CopyGate;

    #[async_trait::async_trait]
    impl elspeth_core::GatePlugin for CopyGate {
        fn name(&self) -> &str {
            "copy_gate"
        }
        async fn evaluate(&self, row: Value, _ctx: &PluginContext) -> PluginResult<GateResult> {
            Ok(GateResult::new(
                row,
                RoutingAction::route_to(
                    vec!["mirror".to_string()],
                    RouteMode::Copy,
                    json!({"rule": "mirror everything"}),
                ),
            ))
        }
    }

    let (audit_sink, audited) = CollectSink::new("audit", score_schema());
    let (results_sink, written) = CollectSink::new("results", score_schema());
    let def = definition(
        VecSource::new(vec![json!({"id": 1, "score": 75})], score_schema()),
        vec![StageDefinition::Gate {
            plugin: Box::new(CopyGate),
            options: json!({}),
            routes: BTreeMap::from([(
                "mirror".to_string(),
                RouteTarget::Sink {
                    name: "audit".to_string(),
                    mode: RouteMode::Copy,
                },
            )]),
        }],
        BTreeMap::from([
            ("audit".to_string(), sink(audit_sink)),
            ("results".to_string(), sink(results_sink)),
        ]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(audited.lock().unwrap().len(), 1);
    assert_eq!(written.lock().unwrap().len(), 1);
    assert_eq!(result.rows_processed, 1, "copy writes are not terminal");

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 1);
    assert_eq!(explain.tokens[0].outcome, RowOutcome::Completed);
}

// Fork then coalesce: branches merge into one joined token.
#[tokio::test]
async fn test_fork_and_coalesce_merges_branches() {
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(vec![json!({"id": 7, "score": 10})], score_schema()),
        vec![
            StageDefinition::Gate {
                plugin: Box::new(ForkGate {
                    branches: vec!["fast".to_string(), "thorough".to_string()],
                }),
                options: json!({}),
                routes: BTreeMap::new(),
            },
            StageDefinition::Coalesce {
                plugin: Box::new(MergeBranches),
                options: json!({}),
                name: "rejoin".to_string(),
                policy: CoalescePolicy::RequireAll,
            },
        ],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 1);
    let rows = written.lock().unwrap().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["merged"], json!(2));

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 4, "seed + 2 branches + joined");

    let seed = explain
        .tokens
        .iter()
        .find(|t| t.token.fork_group_id.is_none() && t.token.join_group_id.is_none())
        .unwrap();
    assert_eq!(seed.outcome, RowOutcome::Forked);

    let branches: Vec<_> = explain
        .tokens
        .iter()
        .filter(|t| t.token.fork_group_id.is_some())
        .collect();
    assert_eq!(branches.len(), 2);
    for branch in &branches {
        assert_eq!(branch.outcome, RowOutcome::Coalesced);
    }

    let joined = explain
        .tokens
        .iter()
        .find(|t| t.token.join_group_id.is_some())
        .unwrap();
    assert_eq!(joined.outcome, RowOutcome::Completed);
    let parents = landscape.token_parents(joined.token.token_id).await.unwrap();
    assert_eq!(parents.len(), 2);
}

// A failed branch poisons its require_all group: the surviving sibling
// fails at the join point instead of vanishing from the audit trail.
#[tokio::test]
async fn test_failing_branch_fails_require_all_group() {
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(vec![json!({"id": 4, "score": 20})], score_schema()),
        vec![
            StageDefinition::Gate {
                plugin: Box::new(ForkGate {
                    branches: vec!["fast".to_string(), "thorough".to_string()],
                }),
                options: json!({}),
                routes: BTreeMap::new(),
            },
            StageDefinition::Transform {
                plugin: Box::new(FailOnceTransform {
                    calls: Arc::new(AtomicU32::new(0)),
                }),
                options: json!({}),
                retry: None,
            },
            StageDefinition::Coalesce {
                plugin: Box::new(MergeBranches),
                options: json!({}),
                name: "rejoin".to_string(),
                policy: CoalescePolicy::RequireAll,
            },
        ],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows_processed, 0);
    assert!(written.lock().unwrap().is_empty(), "no joined token reaches the sink");

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 3, "seed + 2 branches, no joined token");

    let seed = explain
        .tokens
        .iter()
        .find(|t| t.token.fork_group_id.is_none())
        .unwrap();
    assert_eq!(seed.outcome, RowOutcome::Forked);

    let branches: Vec<_> = explain
        .tokens
        .iter()
        .filter(|t| t.token.fork_group_id.is_some())
        .collect();
    assert_eq!(branches.len(), 2);
    for branch in &branches {
        assert_eq!(branch.outcome, RowOutcome::Failed);
    }

    // One branch died at the transform; its sibling must carry a failed
    // state at the coalesce node, not a stale upstream completion.
    let types = node_types(&landscape, result.run_id).await;
    let failed_at = |branch: &&elspeth_landscape::TokenExplain| {
        let last = branch.states.last().unwrap();
        assert_eq!(last.status, NodeStateStatus::Failed);
        types[&last.node_id]
    };
    let mut terminal_nodes: Vec<NodeType> = branches.iter().map(failed_at).collect();
    terminal_nodes.sort_by_key(|t| t.as_str());
    assert_eq!(terminal_nodes, vec![NodeType::Coalesce, NodeType::Transform]);
}

// Quorum: the join fires at the threshold; the straggler terminates with
// a skipped state instead of disappearing.
#[tokio::test]
async fn test_quorum_merges_at_threshold_and_skips_straggler() {
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(vec![json!({"id": 5, "score": 50})], score_schema()),
        vec![
            StageDefinition::Gate {
                plugin: Box::new(ForkGate {
                    branches: vec![
                        "first".to_string(),
                        "second".to_string(),
                        "third".to_string(),
                    ],
                }),
                options: json!({}),
                routes: BTreeMap::new(),
            },
            StageDefinition::Coalesce {
                plugin: Box::new(MergeBranches),
                options: json!({}),
                name: "rejoin".to_string(),
                policy: CoalescePolicy::Quorum { threshold: 2 },
            },
        ],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 1);
    let rows = written.lock().unwrap().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["merged"], json!(2), "the quorum merges, not the full fan-out");

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 5, "seed + 3 branches + joined");

    let joined = explain
        .tokens
        .iter()
        .find(|t| t.token.join_group_id.is_some())
        .unwrap();
    assert_eq!(joined.outcome, RowOutcome::Completed);
    let parents = landscape.token_parents(joined.token.token_id).await.unwrap();
    assert_eq!(parents.len(), 2);

    let branches: Vec<_> = explain
        .tokens
        .iter()
        .filter(|t| t.token.fork_group_id.is_some())
        .collect();
    assert_eq!(branches.len(), 3);
    let coalesced = branches
        .iter()
        .filter(|b| b.outcome == RowOutcome::Coalesced)
        .count();
    assert_eq!(coalesced, 2);

    // The straggler closes as skipped at the join point.
    let types = node_types(&landscape, result.run_id).await;
    let straggler = branches
        .iter()
        .find(|b| b.outcome != RowOutcome::Coalesced)
        .unwrap();
    assert_eq!(straggler.outcome, RowOutcome::Completed);
    let last = straggler.states.last().unwrap();
    assert_eq!(last.status, NodeStateStatus::Skipped);
    assert_eq!(types[&last.node_id], NodeType::Coalesce);
}

// Outbound calls made by transforms land in the audit trail.
#[tokio::test]
async fn test_transform_call_records_are_audited() {
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(vec![json!({"id": 9, "score": 3})], score_schema()),
        vec![StageDefinition::Transform {
            plugin: Box::new(LookupTransform),
            options: json!({}),
            retry: None,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 1);
    assert_eq!(written.lock().unwrap()[0]["verdict"], json!("known"));

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    let types = node_types(&landscape, result.run_id).await;
    let transform_state = explain.tokens[0]
        .states
        .iter()
        .find(|s| types[&s.node_id] == NodeType::Transform)
        .unwrap();
    let calls = landscape
        .calls_for_state(transform_state.state_id)
        .await
        .unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target, "lookup_api");
    assert_eq!(calls[0].status, "ok");
    assert!(calls[0].request_hash.is_some());
    assert!(calls[0].response_hash.is_some());
}

// Batch failure is atomic: every member fails with the batch.
#[tokio::test]
async fn test_batch_failure_fails_members_atomically() {
    let (results_sink, written) = CollectSink::new("results", open_schema());
    let def = definition(
        VecSource::new(
            vec![json!({"id": 1, "score": 1}), json!({"id": 2, "score": 2})],
            score_schema(),
        ),
        vec![StageDefinition::Aggregation {
            plugin: Box::new(ExplodingBatch),
            options: json!({}),
            trigger: TriggerConfig::count(2),
            output_mode: AggregationOutputMode::Single,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.rows_processed, 0);
    assert!(written.lock().unwrap().is_empty());

    let batches = landscape.batches_for_run(result.run_id).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, elspeth_landscape::BatchStatus::Failed);

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    for token in &explain.tokens {
        assert_eq!(token.outcome, RowOutcome::Failed);
    }
}

// A type violation crashes the run per the trust model.
#[tokio::test]
async fn test_type_violation_fails_run() {
    struct TrustingTransform;

    #[async_trait::async_trait]
    impl elspeth_core::TransformPlugin for TrustingTransform {
        fn name(&self) -> &str {
            "trusting_transform"
        }
        async fn process(
            &self,
            _row: Value,
            _ctx: &PluginContext,
        ) -> PluginResult<elspeth_core::TransformResult> {
            Err(elspeth_core::PluginError::Type(
                "expected object with numeric 'score'".to_string(),
            ))
        }
    }

    let (results_sink, _written) = CollectSink::new("results", score_schema());
    let def = definition(
        VecSource::new(vec![json!({"id": 1, "score": 1})], score_schema()),
        vec![StageDefinition::Transform {
            plugin: Box::new(TrustingTransform),
            options: json!({}),
            retry: None,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    let (result, _landscape) = run_recorded(def).await;
    assert_eq!(result.status, RunStatus::Failed);
}

// A failing sink fails the token, not the run.
#[tokio::test]
async fn test_sink_failure_fails_token_only() {
    let def = definition(
        VecSource::new(score_rows(), score_schema()),
        vec![],
        BTreeMap::from([("results".to_string(), sink(RejectingSink::new(score_schema())))]),
        "results",
    );
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows_processed, 0);
    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    for token in &explain.tokens {
        assert_eq!(token.outcome, RowOutcome::Failed);
    }
    assert!(landscape
        .artifacts_for_run(result.run_id)
        .await
        .unwrap()
        .is_empty());
}

// The parallel worker pool produces the same audit shape.
#[tokio::test]
async fn test_parallel_workers_complete_all_rows() {
    let rows: Vec<Value> = (0..20).map(|i| json!({"id": i, "score": i})).collect();
    let (results_sink, written) = CollectSink::new("results", score_schema());
    let mut def = definition(
        VecSource::new(rows, score_schema()),
        vec![StageDefinition::Transform {
            plugin: Box::new(DoubleScore),
            options: json!({}),
            retry: None,
        }],
        BTreeMap::from([("results".to_string(), sink(results_sink))]),
        "results",
    );
    def.settings.concurrency.max_workers = 4;
    let (result, landscape) = run_recorded(def).await;

    assert_eq!(result.rows_processed, 20);
    assert_eq!(written.lock().unwrap().len(), 20);
    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 20);
    assert!(explain
        .tokens
        .iter()
        .all(|t| t.outcome == RowOutcome::Completed));
}
