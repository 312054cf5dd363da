//! Engine configuration and pipeline definition
//!
//! Two layers. [`EngineSettings`] is the serde-deserializable settings
//! object an external loader produces (concurrency, retries, payload
//! store, telemetry, landscape). [`PipelineDefinition`] is the validated,
//! plugin-bound pipeline the orchestrator actually runs: a source, an
//! ordered spine of row stages, named sinks, and the default output sink.
//! Parsing YAML/ENV into these structures is an external concern.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::{
    AggregationPlugin, CoalescePlugin, GatePlugin, SinkPlugin, SourcePlugin, TransformPlugin,
};
use crate::retry::RetryConfig;

/// Back-pressure behavior when the telemetry queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackpressureMode {
    /// Block the producer; the pipeline slows to the exporters' pace.
    #[default]
    Block,
    /// Drop the event and count it. For burst absorption, not sustained
    /// overload - a persistently lagging exporter must be fixed, not
    /// papered over.
    Drop,
}

/// Which telemetry events are emitted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// No events.
    Off,
    /// Decisions only: routing, batch transitions, forks/expansions,
    /// quarantines.
    Decisions,
    /// Everything, including per-node start/complete.
    #[default]
    All,
}

/// Telemetry manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub backpressure_mode: BackpressureMode,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            backpressure_mode: BackpressureMode::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Worker-pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    /// 1 means single-threaded cooperative execution.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Fail the whole run on the first token-fatal stage failure.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_max_workers() -> usize {
    1
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            fail_fast: false,
        }
    }
}

/// Payload store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadBackend {
    #[default]
    Memory,
    Filesystem,
}

/// Payload store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadStoreSettings {
    #[serde(default)]
    pub backend: PayloadBackend,
    /// Blob directory; required for the filesystem backend.
    #[serde(default)]
    pub base_path: Option<String>,
    /// Payloads above this size are externalized instead of stored inline
    /// in the audit record.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,
}

impl Default for PayloadStoreSettings {
    fn default() -> Self {
        Self {
            backend: PayloadBackend::default(),
            base_path: None,
            inline_threshold_bytes: default_inline_threshold(),
        }
    }
}

/// Audit database selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandscapeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite path; in-memory recording when absent or disabled.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for LandscapeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
        }
    }
}

/// Engine-wide settings supplied by the external configuration loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub landscape: LandscapeSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    /// Default retry policy for stages that do not declare their own.
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub payload_store: PayloadStoreSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

fn default_inline_threshold() -> usize {
    elspeth_landscape::DEFAULT_INLINE_THRESHOLD_BYTES
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            landscape: LandscapeSettings::default(),
            concurrency: ConcurrencySettings::default(),
            retry: RetryConfig::default(),
            payload_store: PayloadStoreSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

/// Where a gate route label points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Use the spine's continue edge.
    Continue,
    /// Divert to the named sink.
    Sink {
        name: String,
        mode: elspeth_landscape::RouteMode,
    },
}

/// How an aggregation flush maps inputs to outputs and tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationOutputMode {
    /// One output row, carried by the triggering token; other inputs are
    /// consumed.
    Single,
    /// N outputs for N inputs; the original tokens continue.
    Passthrough,
    /// M outputs as fresh tokens expanded from the triggering token; all
    /// inputs are consumed.
    Transform,
}

/// Flush triggers; whichever fires first wins. Source exhaustion always
/// flushes non-empty buffers regardless of trigger state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
    #[serde(default, with = "opt_duration_ms")]
    pub max_duration: Option<Duration>,
}

mod opt_duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

impl TriggerConfig {
    #[must_use]
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }
}

/// How a coalesce resolves its branches.
#[derive(Debug, Clone, PartialEq)]
pub enum CoalescePolicy {
    /// Fail the join if any branch failed.
    RequireAll,
    /// Succeed once this many branches arrived.
    Quorum { threshold: usize },
    /// Merge whatever arrived when the run winds down.
    BestEffort,
}

/// One stage on the pipeline spine.
pub enum StageDefinition {
    Transform {
        plugin: Box<dyn TransformPlugin>,
        options: Value,
        retry: Option<RetryConfig>,
    },
    Gate {
        plugin: Box<dyn GatePlugin>,
        options: Value,
        /// Route label -> destination. `Continue` means the spine edge.
        routes: BTreeMap<String, RouteTarget>,
    },
    Aggregation {
        plugin: Box<dyn AggregationPlugin>,
        options: Value,
        trigger: TriggerConfig,
        output_mode: AggregationOutputMode,
    },
    Coalesce {
        plugin: Box<dyn CoalescePlugin>,
        options: Value,
        /// Name fork children reference to find their join point.
        name: String,
        policy: CoalescePolicy,
    },
}

impl StageDefinition {
    /// The stage's plugin name, for diagnostics and registration.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Transform { plugin, .. } => plugin.name(),
            Self::Gate { plugin, .. } => plugin.name(),
            Self::Aggregation { plugin, .. } => plugin.name(),
            Self::Coalesce { plugin, .. } => plugin.name(),
        }
    }
}

/// The source stage.
pub struct SourceDefinition {
    pub plugin: Box<dyn SourcePlugin>,
    pub options: Value,
}

/// One named sink.
pub struct SinkDefinition {
    pub plugin: Box<dyn SinkPlugin>,
    pub options: Value,
}

/// A fully bound pipeline: what the orchestrator runs.
pub struct PipelineDefinition {
    pub source: SourceDefinition,
    pub stages: Vec<StageDefinition>,
    pub sinks: BTreeMap<String, SinkDefinition>,
    /// Default destination for tokens that reach the end of the spine.
    pub output_sink: String,
    pub settings: EngineSettings,
}

impl PipelineDefinition {
    /// The resolved configuration as one JSON value, hashed into the run
    /// record.
    #[must_use]
    pub fn config_value(&self) -> Value {
        let stages: Vec<Value> = self
            .stages
            .iter()
            .map(|stage| match stage {
                StageDefinition::Transform { plugin, options, .. } => serde_json::json!({
                    "plugin": plugin.name(),
                    "type": "transform",
                    "options": options,
                }),
                StageDefinition::Gate { plugin, options, routes } => serde_json::json!({
                    "plugin": plugin.name(),
                    "type": "gate",
                    "options": options,
                    "routes": routes
                        .iter()
                        .map(|(label, target)| {
                            let dest = match target {
                                RouteTarget::Continue => "continue".to_string(),
                                RouteTarget::Sink { name, .. } => name.clone(),
                            };
                            (label.clone(), Value::String(dest))
                        })
                        .collect::<serde_json::Map<_, _>>(),
                }),
                StageDefinition::Aggregation { plugin, options, output_mode, .. } => {
                    serde_json::json!({
                        "plugin": plugin.name(),
                        "type": "aggregation",
                        "options": options,
                        "output_mode": output_mode,
                    })
                }
                StageDefinition::Coalesce { plugin, options, name, .. } => serde_json::json!({
                    "plugin": plugin.name(),
                    "type": "coalesce",
                    "options": options,
                    "name": name,
                }),
            })
            .collect();
        let sinks: serde_json::Map<String, Value> = self
            .sinks
            .iter()
            .map(|(name, sink)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "plugin": sink.plugin.name(),
                        "options": sink.options,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "datasource": {
                "plugin": self.source.plugin.name(),
                "options": self.source.options,
            },
            "row_plugins": stages,
            "sinks": sinks,
            "output_sink": self.output_sink,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings: EngineSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.concurrency.max_workers, 1);
        assert!(!settings.concurrency.fail_fast);
        assert_eq!(settings.telemetry.queue_capacity, 1000);
        assert_eq!(settings.telemetry.backpressure_mode, BackpressureMode::Block);
        assert!(settings.landscape.enabled);
    }

    #[test]
    fn test_backpressure_mode_wire_form() {
        let block: BackpressureMode = serde_json::from_str("\"BLOCK\"").unwrap();
        assert_eq!(block, BackpressureMode::Block);
        let drop: BackpressureMode = serde_json::from_str("\"DROP\"").unwrap();
        assert_eq!(drop, BackpressureMode::Drop);
    }

    #[test]
    fn test_trigger_config_parse() {
        let trigger: TriggerConfig =
            serde_json::from_str(r#"{"count": 3, "max_duration": 250}"#).unwrap();
        assert_eq!(trigger.count, Some(3));
        assert_eq!(trigger.max_duration, Some(Duration::from_millis(250)));
        assert_eq!(trigger.max_bytes, None);
    }

    #[test]
    fn test_payload_store_settings_parse() {
        let fs: PayloadStoreSettings = serde_json::from_str(
            r#"{"backend": "filesystem", "base_path": "/tmp/payloads", "inline_threshold_bytes": 512}"#,
        )
        .unwrap();
        assert_eq!(fs.backend, PayloadBackend::Filesystem);
        assert_eq!(fs.base_path.as_deref(), Some("/tmp/payloads"));
        assert_eq!(fs.inline_threshold_bytes, 512);

        let defaults: PayloadStoreSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults.backend, PayloadBackend::Memory);
        assert_eq!(
            defaults.inline_threshold_bytes,
            elspeth_landscape::DEFAULT_INLINE_THRESHOLD_BYTES
        );
    }
}
