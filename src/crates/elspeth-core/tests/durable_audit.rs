//! End-to-end run against the SQLite audit backend.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use common::{CollectSink, DoubleScore, VecSource};
use elspeth_core::{
    EngineSettings, FieldSpec, FieldType, Orchestrator, PipelineDefinition, Schema,
    SinkDefinition, SourceDefinition, StageDefinition,
};
use elspeth_landscape::{
    explain_run, InMemoryPayloadStore, Landscape, RowOutcome, RunStatus, SqliteLandscape,
};

fn score_schema() -> Schema {
    Schema::new()
        .field("id", FieldSpec::required(FieldType::Int))
        .field("score", FieldSpec::required(FieldType::Int))
}

#[tokio::test]
async fn test_audit_trail_survives_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("landscape.db");
    let landscape = Arc::new(
        SqliteLandscape::open(&db_path, Arc::new(InMemoryPayloadStore::new()), 4096).unwrap(),
    );

    let (results_sink, written) = CollectSink::new("results", score_schema());
    let definition = PipelineDefinition {
        source: SourceDefinition {
            plugin: Box::new(VecSource::new(
                vec![
                    json!({"id": 1, "score": 75}),
                    json!({"id": 2, "score": 45}),
                ],
                score_schema(),
            )),
            options: json!({}),
        },
        stages: vec![StageDefinition::Transform {
            plugin: Box::new(DoubleScore),
            options: json!({}),
            retry: None,
        }],
        sinks: BTreeMap::from([(
            "results".to_string(),
            SinkDefinition {
                plugin: Box::new(results_sink),
                options: json!({}),
            },
        )]),
        output_sink: "results".to_string(),
        settings: EngineSettings::default(),
    };

    let result = Orchestrator::new()
        .with_landscape(landscape.clone())
        .run(definition)
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.rows_processed, 2);
    assert_eq!(written.lock().unwrap().len(), 2);

    // The run is queryable from the database itself.
    let run = landscape.get_run(result.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());

    let explain = explain_run(landscape.as_ref(), result.run_id).await.unwrap();
    assert_eq!(explain.tokens.len(), 2);
    for token in &explain.tokens {
        assert_eq!(token.outcome, RowOutcome::Completed);
        assert_eq!(token.states.len(), 3);
    }
    assert_eq!(
        landscape.artifacts_for_run(result.run_id).await.unwrap().len(),
        2
    );

    // Reopening the database sees the same run.
    drop(landscape);
    let reopened =
        SqliteLandscape::open(&db_path, Arc::new(InMemoryPayloadStore::new()), 4096).unwrap();
    let run = reopened.get_run(result.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}
