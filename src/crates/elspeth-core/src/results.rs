//! Stage result types
//!
//! This module defines what plugins hand back to their executors: a
//! [`TransformResult`] from transforms, a [`GateResult`] carrying a
//! [`RoutingAction`] from gates, and an [`AcceptResult`] from aggregations.
//! Control flow lives in these values, not in the error channel - a
//! filtered row and a retryable failure are results, not exceptions.
//!
//! # Example: transform outcomes
//!
//! ```rust
//! use elspeth_core::results::TransformResult;
//! use serde_json::json;
//!
//! let ok = TransformResult::success(json!({"id": 1, "score": 150}));
//! assert!(ok.has_output_data());
//!
//! let skip = TransformResult::filtered(json!({"rule": "score below floor"}));
//! let fail = TransformResult::error(json!({"cause": "upstream 503"}), true);
//! assert!(fail.retryable);
//! # let _ = (skip,);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use elspeth_landscape::{RouteMode, RoutingKind};

/// Status of a transform invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    Success,
    Error,
    /// The row is intentionally excluded from downstream processing.
    Filtered,
}

/// What a transform produced.
///
/// `success` carries exactly one of `row` (single-row) or `rows`
/// (multi-row); the executor asserts this with [`has_output_data`].
/// Multi-row success is only legal for transforms declaring
/// `creates_tokens`, or inside an aggregation flush.
///
/// [`has_output_data`]: TransformResult::has_output_data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub status: TransformStatus,
    pub row: Option<Value>,
    pub rows: Option<Vec<Value>>,
    /// Rationale for `error` and `filtered` results.
    pub reason: Option<Value>,
    pub retryable: bool,
}

impl TransformResult {
    /// Single-row success.
    #[must_use]
    pub fn success(row: Value) -> Self {
        Self {
            status: TransformStatus::Success,
            row: Some(row),
            rows: None,
            reason: None,
            retryable: false,
        }
    }

    /// Multi-row success (expansion or aggregation flush).
    #[must_use]
    pub fn success_multi(rows: Vec<Value>) -> Self {
        Self {
            status: TransformStatus::Success,
            row: None,
            rows: Some(rows),
            reason: None,
            retryable: false,
        }
    }

    /// Failure with an optional retry hint.
    #[must_use]
    pub fn error(reason: Value, retryable: bool) -> Self {
        Self {
            status: TransformStatus::Error,
            row: None,
            rows: None,
            reason: Some(reason),
            retryable,
        }
    }

    /// Intentional exclusion; completes the node state with no downstream
    /// work item.
    #[must_use]
    pub fn filtered(reason: Value) -> Self {
        Self {
            status: TransformStatus::Filtered,
            row: None,
            rows: None,
            reason: Some(reason),
            retryable: false,
        }
    }

    /// `success` carries exactly one of `row` / `rows`.
    #[must_use]
    pub fn has_output_data(&self) -> bool {
        self.row.is_some() ^ self.rows.is_some()
    }
}

/// A gate's decision about one token.
///
/// Destinations reference **route labels**, never sink node IDs; the
/// executor resolves labels through the graph's sink-ID map. Every
/// evaluation produces exactly one recorded routing event, including
/// `continue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingAction {
    pub kind: RoutingKind,
    /// Ordered route labels (or branch names for forks).
    pub destinations: Vec<String>,
    pub mode: RouteMode,
    /// Immutable rationale; recorded verbatim in the audit trail.
    pub reason: Value,
}

impl RoutingAction {
    /// Proceed to the next stage on the spine.
    #[must_use]
    pub fn proceed(reason: Value) -> Self {
        Self {
            kind: RoutingKind::Continue,
            destinations: Vec::new(),
            mode: RouteMode::Move,
            reason,
        }
    }

    /// Divert to the sinks behind the given route labels.
    #[must_use]
    pub fn route_to(labels: Vec<String>, mode: RouteMode, reason: Value) -> Self {
        Self {
            kind: RoutingKind::RouteToSink,
            destinations: labels,
            mode,
            reason,
        }
    }

    /// Fork one child per named branch.
    #[must_use]
    pub fn fork_to(branches: Vec<String>, reason: Value) -> Self {
        Self {
            kind: RoutingKind::ForkToPaths,
            destinations: branches,
            mode: RouteMode::Move,
            reason,
        }
    }
}

/// Result of a gate evaluation: the (possibly annotated) row plus the
/// routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub row: Value,
    pub action: RoutingAction,
}

impl GateResult {
    #[must_use]
    pub fn new(row: Value, action: RoutingAction) -> Self {
        Self { row, action }
    }
}

/// Result of offering a row to an aggregation plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResult {
    /// Whether the row was absorbed into the current batch.
    pub accepted: bool,
    /// Whether this acceptance demands an immediate flush, independent of
    /// the configured triggers.
    pub trigger: bool,
}

impl AcceptResult {
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            trigger: false,
        }
    }

    #[must_use]
    pub fn accepted_and_trigger() -> Self {
        Self {
            accepted: true,
            trigger: true,
        }
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            trigger: false,
        }
    }
}

/// Receipt a sink returns from a successful write; becomes the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkReceipt {
    /// `file`, `database`, `webhook`, ...
    pub kind: String,
    pub path_or_uri: String,
    pub content_hash: Option<String>,
    pub size_bytes: Option<u64>,
    pub idempotency_key: Option<String>,
}

impl SinkReceipt {
    #[must_use]
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: "file".to_string(),
            path_or_uri: path.into(),
            content_hash: None,
            size_bytes: None,
            idempotency_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_has_exactly_one_payload() {
        assert!(TransformResult::success(json!({"a": 1})).has_output_data());
        assert!(TransformResult::success_multi(vec![json!({"a": 1})]).has_output_data());
        assert!(!TransformResult::error(json!("boom"), false).has_output_data());
    }

    #[test]
    fn test_filtered_is_not_retryable() {
        let result = TransformResult::filtered(json!({"rule": "dup"}));
        assert_eq!(result.status, TransformStatus::Filtered);
        assert!(!result.retryable);
    }

    #[test]
    fn test_routing_action_constructors() {
        let cont = RoutingAction::proceed(json!({"why": "clean"}));
        assert_eq!(cont.kind, RoutingKind::Continue);
        assert!(cont.destinations.is_empty());

        let route = RoutingAction::route_to(
            vec!["suspicious".to_string()],
            RouteMode::Copy,
            json!({"score": 91}),
        );
        assert_eq!(route.kind, RoutingKind::RouteToSink);
        assert_eq!(route.mode, RouteMode::Copy);

        let fork = RoutingAction::fork_to(
            vec!["fast".to_string(), "thorough".to_string()],
            json!({}),
        );
        assert_eq!(fork.kind, RoutingKind::ForkToPaths);
        assert_eq!(fork.destinations.len(), 2);
    }
}
