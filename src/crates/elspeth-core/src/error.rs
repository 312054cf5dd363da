//! Error types for graph compilation and pipeline execution
//!
//! The taxonomy mirrors the propagation policy: recoverable conditions
//! (source validation failures, retryable plugin errors, telemetry drops)
//! are handled where they occur and never appear here; everything in
//! [`EngineError`] is surfaced to the orchestrator, and most variants are
//! fatal to the run.
//!
//! # Error Hierarchy
//!
//! ```text
//! EngineError
//! ├── Graph         - configuration rejected at compile time
//! ├── PluginType    - a stage received data violating its declared schema
//! ├── StageFailed   - a stage exhausted its retries (token-fatal)
//! ├── Batch         - an aggregation flush failed (run-fatal)
//! ├── Audit         - a recorder/payload write failed (run-fatal)
//! ├── Lifecycle     - on_start/on_register failed (run-fatal)
//! └── Internal      - programming-error faults (run-fatal)
//! ```

use elspeth_landscape::AuditError;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while compiling a configuration into an execution graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphValidationError {
    /// A gate route names a sink that is not declared.
    #[error("gate '{gate}' routes label '{label}' to unknown sink '{sink}'")]
    UnknownRouteSink {
        gate: String,
        label: String,
        sink: String,
    },

    /// `output_sink` is not a declared sink name.
    #[error("output_sink '{0}' is not a declared sink")]
    UnknownOutputSink(String),

    /// The quarantine policy names a sink that is not declared.
    #[error("on_validation_failure routes to unknown sink '{0}'")]
    UnknownQuarantineSink(String),

    /// Topological sort failed.
    #[error("graph contains a cycle involving node '{0}'")]
    Cycle(String),

    /// A declared sink is not reachable from the source.
    #[error("sink '{0}' is not reachable from the source")]
    UnreachableSink(String),

    /// Adjacent stages disagree about the rows flowing between them.
    #[error("schema mismatch on edge {from} -> {to}: {issues:?}")]
    SchemaMismatch {
        from: String,
        to: String,
        issues: Vec<String>,
    },

    /// A token-creating transform sits between a gate and a coalesce,
    /// which has no defined join semantics.
    #[error("stage '{stage}' creates tokens between gate '{gate}' and coalesce '{coalesce}'")]
    ExpansionInsideForkJoin {
        stage: String,
        gate: String,
        coalesce: String,
    },

    /// Two sinks (or two coalesces) share a name.
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    /// The configuration is structurally unusable.
    #[error("invalid pipeline configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced to the orchestrator during a run.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Compile-time rejection; no run was started.
    #[error(transparent)]
    Graph(#[from] GraphValidationError),

    /// A stage received input inconsistent with its declared schema. Per
    /// the trust model this is an upstream configuration bug and crashes
    /// the run instead of being routed.
    #[error("type violation at stage '{stage}': {message}")]
    PluginType { stage: String, message: String },

    /// A stage exhausted its retry budget. Fatal for the token; fatal for
    /// the run only when `fail_fast` is set.
    #[error("stage '{stage}' failed after {attempts} attempt(s): {reason}")]
    StageFailed {
        stage: String,
        attempts: u32,
        reason: String,
    },

    /// An aggregation flush failed; every buffered token fails with it.
    #[error("aggregation '{stage}' batch failed: {message}")]
    Batch { stage: String, message: String },

    /// An audit write failed. Always fatal: the run cannot continue past
    /// a hole in its own record.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A lifecycle hook (`on_register`/`on_start`) failed.
    #[error("lifecycle hook failed for '{stage}': {message}")]
    Lifecycle { stage: String, message: String },

    /// An upstream programming error, e.g. a multi-row result from a
    /// transform that does not declare `creates_tokens`.
    #[error("internal fault: {0}")]
    Internal(String),
}

/// Errors a plugin may raise from its own code.
///
/// Retryability is an explicit property of the error, not of its type
/// hierarchy: [`PluginError::Retryable`] is the only variant the executors
/// will retry.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Transient failure; the executor may retry within its budget.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; the token fails without further attempts.
    #[error("{0}")]
    Fatal(String),

    /// Input inconsistent with the declared schema; crashes the run.
    #[error("{0}")]
    Type(String),
}

impl PluginError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Result type for plugin calls
pub type PluginResult<T> = std::result::Result<T, PluginError>;
