//! Bounded asynchronous telemetry fan-out
//!
//! One producer path, one consumer task, N exporters. Events flow through
//! a fixed-capacity queue; when it fills, the configured
//! [`BackpressureMode`] decides whether the pipeline slows (BLOCK) or the
//! event is counted and dropped (DROP). A failing exporter is counted and
//! isolated - it never blocks the others - and a dead consumer disables
//! telemetry entirely rather than wedging the pipeline.
//!
//! # Shutdown sequence
//!
//! Deviating from this order loses events or deadlocks:
//!
//! 1. set the shutdown flag, refusing new events;
//! 2. let the queue drain;
//! 3. send the shutdown sentinel with a timeout;
//! 4. join the consumer task with a timeout;
//! 5. close every exporter (done by the consumer as it exits).
//!
//! # Exporter thread-safety contract
//!
//! `export()` is always called by the single consumer task, never
//! concurrently with itself, but may run on a different thread than
//! `close()` callers expect - exporters hold their own state mutably and
//! need no locking of their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use elspeth_landscape::{NodeId, RunId, StateId, TokenId};

use crate::config::{BackpressureMode, Granularity, TelemetrySettings};

/// Kind of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventType {
    NodeStarted,
    NodeCompleted,
    RoutingDecided,
    BatchStatusChanged,
    TokenExpanded,
    TokenForked,
    Quarantine,
}

/// One telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub run_id: RunId,
    pub node_id: Option<NodeId>,
    pub token_id: Option<TokenId>,
    pub state_id: Option<StateId>,
    pub timestamp: DateTime<Utc>,
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    /// Event-specific payload (routing destinations, batch status, ...).
    pub detail: Value,
}

impl TelemetryEvent {
    #[must_use]
    pub fn new(event_type: TelemetryEventType, run_id: RunId) -> Self {
        Self {
            event_type,
            run_id,
            node_id: None,
            token_id: None,
            state_id: None,
            timestamp: Utc::now(),
            input_hash: None,
            output_hash: None,
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    #[must_use]
    pub fn with_token(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    #[must_use]
    pub fn with_state(mut self, state_id: StateId) -> Self {
        self.state_id = Some(state_id);
        self
    }

    #[must_use]
    pub fn with_hashes(mut self, input: Option<String>, output: Option<String>) -> Self {
        self.input_hash = input;
        self.output_hash = output;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Error returned by an exporter.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ExportError(pub String);

/// Receives every accepted telemetry event.
#[async_trait]
pub trait TelemetryExporter: Send {
    fn name(&self) -> &str;

    async fn export(&mut self, event: &TelemetryEvent) -> Result<(), ExportError>;

    /// Final flush/teardown during shutdown.
    async fn close(&mut self) {}
}

/// Counters surfaced to health checks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetryHealth {
    pub events_dropped: u64,
    pub exporter_failures: HashMap<String, u64>,
    /// True once the consumer died and telemetry switched itself off.
    pub disabled: bool,
}

struct Shared {
    events_dropped: AtomicU64,
    exporter_failures: Mutex<HashMap<String, u64>>,
    shutting_down: AtomicBool,
    disabled: AtomicBool,
}

enum QueueMessage {
    Event(TelemetryEvent),
    Shutdown,
}

/// Bounded single-producer fan-out to N exporters.
pub struct TelemetryManager {
    tx: mpsc::Sender<QueueMessage>,
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    settings: TelemetrySettings,
}

impl TelemetryManager {
    /// Starts the consumer task over the given exporters.
    #[must_use]
    pub fn new(settings: TelemetrySettings, mut exporters: Vec<Box<dyn TelemetryExporter>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueueMessage>(settings.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            events_dropped: AtomicU64::new(0),
            exporter_failures: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        });
        let consumer_shared = shared.clone();
        let consumer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let event = match message {
                    QueueMessage::Shutdown => break,
                    QueueMessage::Event(event) => event,
                };
                for exporter in exporters.iter_mut() {
                    if let Err(err) = exporter.export(&event).await {
                        let name = exporter.name().to_string();
                        tracing::warn!(exporter = %name, error = %err, "exporter failed");
                        if let Ok(mut failures) = consumer_shared.exporter_failures.lock() {
                            *failures.entry(name).or_insert(0) += 1;
                        }
                    }
                }
            }
            for exporter in exporters.iter_mut() {
                exporter.close().await;
            }
        });
        Self {
            tx,
            shared,
            consumer: Mutex::new(Some(consumer)),
            settings,
        }
    }

    fn passes_granularity(&self, event_type: TelemetryEventType) -> bool {
        match self.settings.granularity {
            Granularity::Off => false,
            Granularity::All => true,
            Granularity::Decisions => matches!(
                event_type,
                TelemetryEventType::RoutingDecided
                    | TelemetryEventType::BatchStatusChanged
                    | TelemetryEventType::TokenExpanded
                    | TelemetryEventType::TokenForked
                    | TelemetryEventType::Quarantine
            ),
        }
    }

    fn consumer_alive(&self) -> bool {
        match self.consumer.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Enqueues an event, honoring granularity and back-pressure.
    pub async fn handle_event(&self, event: TelemetryEvent) {
        if self.shared.disabled.load(Ordering::Relaxed)
            || self.shared.shutting_down.load(Ordering::Relaxed)
            || !self.passes_granularity(event.event_type)
        {
            return;
        }
        if !self.consumer_alive() {
            if !self.shared.disabled.swap(true, Ordering::Relaxed) {
                tracing::error!("telemetry consumer died; disabling telemetry");
            }
            return;
        }
        match self.settings.backpressure_mode {
            BackpressureMode::Block => {
                // Blocking enqueue: the pipeline slows to the exporters'
                // pace rather than losing events.
                let _ = self.tx.send(QueueMessage::Event(event)).await;
            }
            BackpressureMode::Drop => {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    self.tx.try_send(QueueMessage::Event(event))
                {
                    self.shared.events_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub fn health(&self) -> TelemetryHealth {
        TelemetryHealth {
            events_dropped: self.shared.events_dropped.load(Ordering::Relaxed),
            exporter_failures: self
                .shared
                .exporter_failures
                .lock()
                .map(|f| f.clone())
                .unwrap_or_default(),
            disabled: self.shared.disabled.load(Ordering::Relaxed),
        }
    }

    /// Drains the queue and closes every exporter. See the module docs
    /// for the exact sequence.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Relaxed);
        // The sentinel queues behind every accepted event, so its arrival
        // proves the queue drained.
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            self.tx.send(QueueMessage::Shutdown),
        )
        .await;
        let handle = match self.consumer.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("telemetry consumer did not stop within timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exporter that appends into a shared vec, optionally slowly.
    struct RecordingExporter {
        name: String,
        seen: Arc<Mutex<Vec<TelemetryEvent>>>,
        delay: Duration,
    }

    impl RecordingExporter {
        fn new(name: &str, seen: Arc<Mutex<Vec<TelemetryEvent>>>) -> Self {
            Self {
                name: name.to_string(),
                seen,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TelemetryExporter for RecordingExporter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn export(&mut self, event: &TelemetryEvent) -> Result<(), ExportError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingExporter;

    #[async_trait]
    impl TelemetryExporter for FailingExporter {
        fn name(&self) -> &str {
            "failing"
        }

        async fn export(&mut self, _event: &TelemetryEvent) -> Result<(), ExportError> {
            Err(ExportError("synthetic failure".to_string()))
        }
    }

    fn event(run_id: RunId, n: u64) -> TelemetryEvent {
        TelemetryEvent::new(TelemetryEventType::NodeCompleted, run_id)
            .with_detail(serde_json::json!({"n": n}))
    }

    #[tokio::test]
    async fn test_block_mode_loses_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = TelemetryManager::new(
            TelemetrySettings {
                queue_capacity: 4,
                backpressure_mode: BackpressureMode::Block,
                granularity: Granularity::All,
            },
            vec![Box::new(RecordingExporter::new("rec", seen.clone()))],
        );
        let run_id = RunId::generate();
        for n in 0..100 {
            manager.handle_event(event(run_id, n)).await;
        }
        manager.shutdown().await;
        assert_eq!(manager.health().events_dropped, 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    async fn test_drop_mode_counts_and_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut slow = RecordingExporter::new("slow", seen.clone());
        slow.delay = Duration::from_millis(10);
        let manager = TelemetryManager::new(
            TelemetrySettings {
                queue_capacity: 10,
                backpressure_mode: BackpressureMode::Drop,
                granularity: Granularity::All,
            },
            vec![Box::new(slow)],
        );
        let run_id = RunId::generate();
        for n in 0..200 {
            manager.handle_event(event(run_id, n)).await;
        }
        let health = manager.health();
        assert!(health.events_dropped > 0, "burst should overflow the queue");
        manager.shutdown().await;
        let seen = seen.lock().unwrap();
        // Accepted events arrive in producer order.
        let ns: Vec<u64> = seen.iter().map(|e| e.detail["n"].as_u64().unwrap()).collect();
        let mut sorted = ns.clone();
        sorted.sort_unstable();
        assert_eq!(ns, sorted);
        assert_eq!(seen.len() as u64 + health.events_dropped, 200);
    }

    #[tokio::test]
    async fn test_failing_exporter_is_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = TelemetryManager::new(
            TelemetrySettings::default(),
            vec![
                Box::new(FailingExporter),
                Box::new(RecordingExporter::new("rec", seen.clone())),
            ],
        );
        let run_id = RunId::generate();
        for n in 0..5 {
            manager.handle_event(event(run_id, n)).await;
        }
        manager.shutdown().await;
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(manager.health().exporter_failures.get("failing"), Some(&5));
    }

    #[tokio::test]
    async fn test_granularity_decisions_filters_node_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = TelemetryManager::new(
            TelemetrySettings {
                granularity: Granularity::Decisions,
                ..TelemetrySettings::default()
            },
            vec![Box::new(RecordingExporter::new("rec", seen.clone()))],
        );
        let run_id = RunId::generate();
        manager.handle_event(event(run_id, 0)).await;
        manager
            .handle_event(TelemetryEvent::new(
                TelemetryEventType::RoutingDecided,
                run_id,
            ))
            .await;
        manager.shutdown().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, TelemetryEventType::RoutingDecided);
    }

    #[tokio::test]
    async fn test_no_events_after_shutdown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = TelemetryManager::new(
            TelemetrySettings::default(),
            vec![Box::new(RecordingExporter::new("rec", seen.clone()))],
        );
        let run_id = RunId::generate();
        manager.shutdown().await;
        manager.handle_event(event(run_id, 1)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
