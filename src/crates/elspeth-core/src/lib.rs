//! # elspeth-core - Row-Oriented DAG Execution Engine
//!
//! The execution core of elspeth: a row pipeline engine that drives a
//! statically compiled DAG of pluggable stages - sources, transforms,
//! gates, aggregations, coalesces, sinks - while recording a complete,
//! content-addressed audit trail of every decision made about every row.
//!
//! The hard problem is not "process data"; it is **reproducible,
//! auditable processing with strong token lineage** through batching,
//! forking, routing, expansion, retries, and partial failures.
//!
//! ## Core Concepts
//!
//! ### 1. Compiled graphs
//!
//! [`ExecutionGraph::compile`] turns a validated [`PipelineDefinition`]
//! into a typed graph with explicit ID maps, validating acyclicity, sink
//! reachability, route consistency, and schema compatibility between
//! adjacent stages. Nothing at runtime ever guesses an identifier.
//!
//! ### 2. Tokens and lineage
//!
//! Every source row seeds a [`Token`]; forks, expansions, and joins
//! create child tokens whose parentage is recorded in the audit store.
//! A token's terminal outcome is never stored - it is derived from the
//! audit tables at query time (see `elspeth_landscape::outcome`).
//!
//! ### 3. The audit envelope
//!
//! Executors wrap every plugin call: open a node state, hash the input,
//! emit telemetry, call the plugin, hash the output, close the state,
//! handle retries. Audit write failures are fatal - the engine prefers
//! failing a run over losing its record of one.
//!
//! ### 4. Bounded telemetry
//!
//! The [`TelemetryManager`] fans events out to exporters through a
//! fixed-capacity queue with BLOCK/DROP back-pressure and full failure
//! isolation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use elspeth_core::{Orchestrator, PipelineDefinition};
//!
//! # async fn example(definition: PipelineDefinition) -> elspeth_core::Result<()> {
//! let result = Orchestrator::new().run(definition).await?;
//! println!("run {} finished: {:?}", result.run_id, result.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executors;
pub mod graph;
pub mod orchestrator;
pub mod plugin;
pub mod processor;
pub mod rate_limit;
pub mod results;
pub mod retry;
pub mod schema;
pub mod telemetry;
pub mod tokens;

pub use config::{
    AggregationOutputMode, BackpressureMode, CoalescePolicy, ConcurrencySettings, EngineSettings,
    Granularity, LandscapeSettings, PayloadBackend, PayloadStoreSettings, PipelineDefinition,
    RouteTarget, SinkDefinition, SourceDefinition, StageDefinition, TelemetrySettings,
    TriggerConfig,
};
pub use error::{EngineError, GraphValidationError, PluginError, PluginResult, Result};
pub use graph::{ExecutionGraph, GraphEdge, NodeInfo, CONTINUE_LABEL, QUARANTINE_LABEL};
pub use orchestrator::{Orchestrator, RunResult};
pub use plugin::{
    AggregationPlugin, CoalescePlugin, GatePlugin, PluginContext, SinkPlugin, SourcePlugin,
    TransformPlugin, ValidationFailurePolicy,
};
pub use processor::{CoalesceTarget, WorkItem};
pub use rate_limit::{RateLimitSpec, RateLimiter};
pub use results::{
    AcceptResult, GateResult, RoutingAction, SinkReceipt, TransformResult, TransformStatus,
};
pub use retry::RetryConfig;
pub use schema::{check_compatibility, FieldSpec, FieldType, Schema};
pub use telemetry::{
    ExportError, TelemetryEvent, TelemetryEventType, TelemetryExporter, TelemetryHealth,
    TelemetryManager,
};
pub use tokens::{Token, TokenManager};
