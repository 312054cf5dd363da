//! SQLite landscape recorder
//!
//! Durable [`Landscape`] backend on an embedded WAL-mode database. One
//! table per audit entity, foreign keys declared between every child table
//! and its parents, and the same append-only discipline the in-memory
//! backend enforces: the only UPDATE statements in this module touch run
//! status, node-state completion fields, and batch status.
//!
//! The connection sits behind a `std::sync::Mutex`. Audit writes are
//! single-statement and short; payload hashing and externalization happen
//! before the lock is taken so the mutex is never held across an `.await`.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::canonical::{self, stable_hash};
use crate::error::{AuditError, Result};
use crate::ids::{
    ArtifactId, BatchId, CallId, EdgeId, EventId, ExpandGroupId, ForkGroupId, JoinGroupId, NodeId,
    RowId, RunId, StateId, TokenId,
};
use crate::payload::PayloadStore;
use crate::records::{
    Artifact, Batch, BatchMember, BatchOutput, BatchStatus, CallRecord, Determinism, EdgeRecord,
    NodeRecord, NodeState, NodeStateStatus, NodeType, PayloadKind, PayloadRef, PayloadSlot,
    RouteMode, RoutingEvent, RoutingKind, RowRecord, Run, RunStatus, TokenParent, TokenRecord,
    ValidationFailure,
};
use crate::recorder::{
    store_payload, ArtifactSpec, CallSpec, Landscape, NodeOutput, NodeRegistration,
    NodeStateCompletion, NodeStateStart, DEFAULT_INLINE_THRESHOLD_BYTES,
};

use async_trait::async_trait;
use std::sync::Arc;

/// Schema version stamped into `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id            TEXT PRIMARY KEY,
    started_at        TEXT NOT NULL,
    completed_at      TEXT,
    status            TEXT NOT NULL,
    config_hash       TEXT NOT NULL,
    canonical_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    node_id            TEXT PRIMARY KEY,
    run_id             TEXT NOT NULL REFERENCES runs(run_id),
    plugin_name        TEXT NOT NULL,
    node_type          TEXT NOT NULL,
    plugin_version     TEXT NOT NULL,
    determinism        TEXT NOT NULL,
    config_json        TEXT NOT NULL,
    config_hash        TEXT NOT NULL,
    input_schema_hash  TEXT,
    output_schema_hash TEXT,
    sequence           INTEGER,
    identity_key       TEXT NOT NULL,
    UNIQUE (run_id, identity_key)
);

CREATE TABLE IF NOT EXISTS edges (
    edge_id      TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL REFERENCES runs(run_id),
    from_node_id TEXT NOT NULL REFERENCES nodes(node_id),
    to_node_id   TEXT NOT NULL REFERENCES nodes(node_id),
    label        TEXT NOT NULL,
    mode         TEXT NOT NULL,
    UNIQUE (run_id, from_node_id, to_node_id, label)
);

CREATE TABLE IF NOT EXISTS rows (
    row_id         TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id TEXT NOT NULL REFERENCES nodes(node_id),
    row_index      INTEGER NOT NULL,
    data_json      TEXT NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    token_id         TEXT PRIMARY KEY,
    row_id           TEXT NOT NULL REFERENCES rows(row_id),
    created_at       TEXT NOT NULL,
    fork_group_id    TEXT,
    join_group_id    TEXT,
    expand_group_id  TEXT,
    branch_name      TEXT,
    step_in_pipeline INTEGER
);

CREATE TABLE IF NOT EXISTS token_parents (
    token_id        TEXT NOT NULL REFERENCES tokens(token_id),
    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal         INTEGER NOT NULL,
    PRIMARY KEY (token_id, parent_token_id)
);

CREATE TABLE IF NOT EXISTS node_states (
    state_id       TEXT PRIMARY KEY,
    token_id       TEXT NOT NULL REFERENCES tokens(token_id),
    node_id        TEXT NOT NULL REFERENCES nodes(node_id),
    attempt        INTEGER NOT NULL,
    status         TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    completed_at   TEXT,
    input_hash     TEXT,
    output_hash    TEXT,
    input_payload  TEXT NOT NULL,
    output_payload TEXT NOT NULL,
    duration_ms    INTEGER,
    error_json     TEXT,
    context_before TEXT,
    context_after  TEXT,
    step_index     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_node_states_token ON node_states(token_id, started_at);

CREATE TABLE IF NOT EXISTS routing_events (
    event_id     TEXT PRIMARY KEY,
    state_id     TEXT NOT NULL REFERENCES node_states(state_id),
    kind         TEXT NOT NULL,
    destinations TEXT NOT NULL,
    mode         TEXT NOT NULL,
    reason_json  TEXT NOT NULL,
    recorded_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    batch_id     TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL REFERENCES runs(run_id),
    node_id      TEXT NOT NULL REFERENCES nodes(node_id),
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    completed_at TEXT,
    error_json   TEXT
);

CREATE TABLE IF NOT EXISTS batch_members (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal  INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id)
);

CREATE TABLE IF NOT EXISTS batch_outputs (
    batch_id  TEXT NOT NULL REFERENCES batches(batch_id),
    ordinal   INTEGER NOT NULL,
    data_hash TEXT NOT NULL,
    payload   TEXT NOT NULL,
    PRIMARY KEY (batch_id, ordinal)
);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id     TEXT PRIMARY KEY,
    state_id        TEXT NOT NULL REFERENCES node_states(state_id),
    kind            TEXT NOT NULL,
    path_or_uri     TEXT NOT NULL,
    content_hash    TEXT,
    size_bytes      INTEGER,
    idempotency_key TEXT
);

CREATE TABLE IF NOT EXISTS validation_failures (
    run_id         TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id TEXT NOT NULL REFERENCES nodes(node_id),
    row_index      INTEGER NOT NULL,
    reason         TEXT NOT NULL,
    raw_data_ref   TEXT,
    recorded_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calls (
    call_id       TEXT PRIMARY KEY,
    state_id      TEXT NOT NULL REFERENCES node_states(state_id),
    target        TEXT NOT NULL,
    request_hash  TEXT,
    response_hash TEXT,
    status        TEXT NOT NULL,
    duration_ms   INTEGER,
    recorded_at   TEXT NOT NULL
);
"#;

/// Durable [`Landscape`] backend on embedded SQLite.
pub struct SqliteLandscape {
    conn: Mutex<Connection>,
    payload_store: Arc<dyn PayloadStore>,
    inline_threshold_bytes: usize,
}

impl SqliteLandscape {
    /// Opens (or creates) a database file and applies the schema.
    pub fn open(
        path: impl AsRef<Path>,
        payload_store: Arc<dyn PayloadStore>,
        inline_threshold_bytes: usize,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "full")?;
        Self::init(conn, payload_store, inline_threshold_bytes)
    }

    /// Opens a private in-memory database, mainly for tests.
    pub fn open_in_memory(payload_store: Arc<dyn PayloadStore>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, payload_store, DEFAULT_INLINE_THRESHOLD_BYTES)
    }

    fn init(
        conn: Connection,
        payload_store: Arc<dyn PayloadStore>,
        inline_threshold_bytes: usize,
    ) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "on")?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != 0 && version != SCHEMA_VERSION {
            return Err(AuditError::Storage(format!(
                "unsupported audit schema version {version} (expected {SCHEMA_VERSION})"
            )));
        }
        conn.execute_batch(SCHEMA_DDL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn: Mutex::new(conn),
            payload_store,
            inline_threshold_bytes,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Storage("audit connection poisoned".to_string()))
    }

    async fn payload_slot(&self, kind: PayloadKind, value: &Value) -> Result<(String, PayloadSlot)> {
        store_payload(
            self.payload_store.as_ref(),
            self.inline_threshold_bytes,
            kind,
            value,
        )
        .await
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn json_text(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json_text(value: &Option<Value>) -> Result<Option<String>> {
    value.as_ref().map(json_text).transpose()
}

fn parse_json(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

fn parse_opt_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.as_deref().map(parse_json).transpose()
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|e| AuditError::Storage(format!("bad enum value {raw:?}: {e}")))
}

fn slot_text(slot: &PayloadSlot) -> Result<String> {
    Ok(serde_json::to_string(slot)?)
}

fn parse_slot(raw: &str) -> Result<PayloadSlot> {
    Ok(serde_json::from_str(raw)?)
}

macro_rules! parse_id {
    ($ty:ident, $raw:expr) => {
        $ty::parse(&$raw).map_err(|e| AuditError::Storage(format!("bad id: {e}")))?
    };
}

fn node_identity_key(registration: &NodeRegistration, config_hash: &str) -> String {
    format!(
        "{}|{}|{}|{:?}",
        registration.plugin_name,
        registration.node_type.as_str(),
        config_hash,
        registration.sequence
    )
}

const NODE_COLUMNS: &str = "node_id, run_id, plugin_name, node_type, plugin_version, determinism, config_json, input_schema_hash, output_schema_hash, sequence, config_hash";

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        node_id: row.get(0)?,
        run_id: row.get(1)?,
        plugin_name: row.get(2)?,
        node_type: row.get(3)?,
        plugin_version: row.get(4)?,
        determinism: row.get(5)?,
        config_json: row.get(6)?,
        input_schema_hash: row.get(7)?,
        output_schema_hash: row.get(8)?,
        sequence: row.get(9)?,
        config_hash: row.get(10)?,
    })
}

struct NodeRow {
    node_id: String,
    run_id: String,
    plugin_name: String,
    node_type: String,
    plugin_version: String,
    determinism: String,
    config_json: String,
    input_schema_hash: Option<String>,
    output_schema_hash: Option<String>,
    sequence: Option<u32>,
    config_hash: String,
}

impl NodeRow {
    fn into_record(self) -> Result<NodeRecord> {
        Ok(NodeRecord {
            node_id: parse_id!(NodeId, self.node_id),
            run_id: parse_id!(RunId, self.run_id),
            plugin_name: self.plugin_name,
            node_type: parse_enum(&self.node_type)?,
            plugin_version: self.plugin_version,
            determinism: parse_enum(&self.determinism)?,
            config: parse_json(&self.config_json)?,
            config_hash: self.config_hash,
            input_schema_hash: self.input_schema_hash,
            output_schema_hash: self.output_schema_hash,
            sequence: self.sequence,
        })
    }
}

struct StateRow {
    state_id: String,
    token_id: String,
    node_id: String,
    attempt: u32,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    input_hash: Option<String>,
    output_hash: Option<String>,
    input_payload: String,
    output_payload: String,
    duration_ms: Option<u64>,
    error_json: Option<String>,
    context_before: Option<String>,
    context_after: Option<String>,
    step_index: u32,
}

const STATE_COLUMNS: &str = "state_id, token_id, node_id, attempt, status, started_at, completed_at, input_hash, output_hash, input_payload, output_payload, duration_ms, error_json, context_before, context_after, step_index";

fn state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRow> {
    Ok(StateRow {
        state_id: row.get(0)?,
        token_id: row.get(1)?,
        node_id: row.get(2)?,
        attempt: row.get(3)?,
        status: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        input_hash: row.get(7)?,
        output_hash: row.get(8)?,
        input_payload: row.get(9)?,
        output_payload: row.get(10)?,
        duration_ms: row.get(11)?,
        error_json: row.get(12)?,
        context_before: row.get(13)?,
        context_after: row.get(14)?,
        step_index: row.get(15)?,
    })
}

impl StateRow {
    fn into_record(self) -> Result<NodeState> {
        Ok(NodeState {
            state_id: parse_id!(StateId, self.state_id),
            token_id: parse_id!(TokenId, self.token_id),
            node_id: parse_id!(NodeId, self.node_id),
            attempt: self.attempt,
            status: parse_enum(&self.status)?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            input_payload: parse_slot(&self.input_payload)?,
            output_payload: parse_slot(&self.output_payload)?,
            duration_ms: self.duration_ms,
            error_json: parse_opt_json(self.error_json)?,
            context_before: parse_opt_json(self.context_before)?,
            context_after: parse_opt_json(self.context_after)?,
            step_index: self.step_index,
        })
    }
}

struct TokenRow {
    token_id: String,
    row_id: String,
    created_at: String,
    fork_group_id: Option<String>,
    join_group_id: Option<String>,
    expand_group_id: Option<String>,
    branch_name: Option<String>,
    step_in_pipeline: Option<u32>,
}

const TOKEN_COLUMNS: &str = "token_id, row_id, created_at, fork_group_id, join_group_id, expand_group_id, branch_name, step_in_pipeline";

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRow> {
    Ok(TokenRow {
        token_id: row.get(0)?,
        row_id: row.get(1)?,
        created_at: row.get(2)?,
        fork_group_id: row.get(3)?,
        join_group_id: row.get(4)?,
        expand_group_id: row.get(5)?,
        branch_name: row.get(6)?,
        step_in_pipeline: row.get(7)?,
    })
}

impl TokenRow {
    fn into_record(self) -> Result<TokenRecord> {
        Ok(TokenRecord {
            token_id: parse_id!(TokenId, self.token_id),
            row_id: parse_id!(RowId, self.row_id),
            created_at: parse_ts(&self.created_at)?,
            fork_group_id: self
                .fork_group_id
                .map(|raw| ForkGroupId::parse(&raw))
                .transpose()
                .map_err(|e| AuditError::Storage(format!("bad id: {e}")))?,
            join_group_id: self
                .join_group_id
                .map(|raw| JoinGroupId::parse(&raw))
                .transpose()
                .map_err(|e| AuditError::Storage(format!("bad id: {e}")))?,
            expand_group_id: self
                .expand_group_id
                .map(|raw| ExpandGroupId::parse(&raw))
                .transpose()
                .map_err(|e| AuditError::Storage(format!("bad id: {e}")))?,
            branch_name: self.branch_name,
            step_in_pipeline: self.step_in_pipeline,
        })
    }
}

fn insert_token(conn: &Connection, token: &TokenRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO tokens (token_id, row_id, created_at, fork_group_id, join_group_id, expand_group_id, branch_name, step_in_pipeline)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            token.token_id.to_string(),
            token.row_id.to_string(),
            ts(token.created_at),
            token.fork_group_id.map(|id| id.to_string()),
            token.join_group_id.map(|id| id.to_string()),
            token.expand_group_id.map(|id| id.to_string()),
            token.branch_name,
            token.step_in_pipeline,
        ],
    )?;
    Ok(())
}

fn insert_token_parent(conn: &Connection, parent: &TokenParent) -> Result<()> {
    conn.execute(
        "INSERT INTO token_parents (token_id, parent_token_id, ordinal) VALUES (?1, ?2, ?3)",
        params![
            parent.token_id.to_string(),
            parent.parent_token_id.to_string(),
            parent.ordinal,
        ],
    )?;
    Ok(())
}

fn require_exists(conn: &Connection, table: &str, id_column: &str, id: &str) -> Result<()> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE {id_column} = ?1"),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(AuditError::NotFound(format!("{table} {id}")));
    }
    Ok(())
}

#[async_trait]
impl Landscape for SqliteLandscape {
    async fn begin_run(&self, config: &Value, canonical_version: &str) -> Result<Run> {
        let run = Run {
            run_id: RunId::generate(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            config_hash: stable_hash(config)?,
            canonical_version: canonical_version.to_string(),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, started_at, completed_at, status, config_hash, canonical_version)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
            params![
                run.run_id.to_string(),
                ts(run.started_at),
                run.status.as_str(),
                run.config_hash,
                run.canonical_version,
            ],
        )?;
        Ok(run)
    }

    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        let current: String = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("run {run_id}")))?;
        if current != RunStatus::Running.as_str() {
            return Err(AuditError::InvariantViolation(format!(
                "run {run_id} already terminated as {current}"
            )));
        }
        conn.execute(
            "UPDATE runs SET status = ?2, completed_at = ?3 WHERE run_id = ?1",
            params![run_id.to_string(), status.as_str(), ts(Utc::now())],
        )?;
        Ok(())
    }

    async fn register_node(&self, registration: NodeRegistration) -> Result<NodeRecord> {
        let config_hash = stable_hash(&registration.config)?;
        let identity_key = node_identity_key(&registration, &config_hash);
        let input_schema_hash = registration
            .input_schema
            .as_ref()
            .map(stable_hash)
            .transpose()?;
        let output_schema_hash = registration
            .output_schema
            .as_ref()
            .map(stable_hash)
            .transpose()?;
        let conn = self.lock()?;
        require_exists(&conn, "runs", "run_id", &registration.run_id.to_string())?;
        let existing = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE run_id = ?1 AND identity_key = ?2"),
                params![registration.run_id.to_string(), identity_key],
                node_from_row,
            )
            .optional()?;
        if let Some(row) = existing {
            return row.into_record();
        }
        let node = NodeRecord {
            node_id: registration.node_id,
            run_id: registration.run_id,
            plugin_name: registration.plugin_name.clone(),
            node_type: registration.node_type,
            plugin_version: registration.plugin_version.clone(),
            determinism: registration.determinism,
            config: registration.config.clone(),
            config_hash: config_hash.clone(),
            input_schema_hash,
            output_schema_hash,
            sequence: registration.sequence,
        };
        conn.execute(
            "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, plugin_version, determinism, config_json, config_hash, input_schema_hash, output_schema_hash, sequence, identity_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                node.node_id.to_string(),
                node.run_id.to_string(),
                node.plugin_name,
                node.node_type.as_str(),
                node.plugin_version,
                node.determinism.as_str(),
                json_text(&node.config)?,
                node.config_hash,
                node.input_schema_hash,
                node.output_schema_hash,
                node.sequence,
                identity_key,
            ],
        )?;
        Ok(node)
    }

    async fn register_edge(
        &self,
        run_id: RunId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        label: &str,
        mode: RouteMode,
    ) -> Result<EdgeRecord> {
        if from_node_id == to_node_id {
            return Err(AuditError::InvariantViolation(format!(
                "self-loop on node {from_node_id}"
            )));
        }
        let conn = self.lock()?;
        require_exists(&conn, "nodes", "node_id", &from_node_id.to_string())?;
        require_exists(&conn, "nodes", "node_id", &to_node_id.to_string())?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT edge_id FROM edges WHERE run_id = ?1 AND from_node_id = ?2 AND to_node_id = ?3 AND label = ?4",
                params![
                    run_id.to_string(),
                    from_node_id.to_string(),
                    to_node_id.to_string(),
                    label
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(edge_id) = existing {
            let mode_raw: String = conn.query_row(
                "SELECT mode FROM edges WHERE edge_id = ?1",
                params![edge_id],
                |row| row.get(0),
            )?;
            return Ok(EdgeRecord {
                edge_id: parse_id!(EdgeId, edge_id),
                run_id,
                from_node_id,
                to_node_id,
                label: label.to_string(),
                mode: parse_enum(&mode_raw)?,
            });
        }
        let edge = EdgeRecord {
            edge_id: EdgeId::generate(),
            run_id,
            from_node_id,
            to_node_id,
            label: label.to_string(),
            mode,
        };
        conn.execute(
            "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.edge_id.to_string(),
                edge.run_id.to_string(),
                edge.from_node_id.to_string(),
                edge.to_node_id.to_string(),
                edge.label,
                edge.mode.as_str(),
            ],
        )?;
        Ok(edge)
    }

    async fn create_row(
        &self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        data: &Value,
    ) -> Result<RowRecord> {
        let row = RowRecord {
            row_id: RowId::generate(),
            run_id,
            source_node_id,
            row_index,
            data: data.clone(),
            created_at: Utc::now(),
        };
        let conn = self.lock()?;
        require_exists(&conn, "nodes", "node_id", &source_node_id.to_string())?;
        conn.execute(
            "INSERT INTO rows (row_id, run_id, source_node_id, row_index, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.row_id.to_string(),
                row.run_id.to_string(),
                row.source_node_id.to_string(),
                row.row_index,
                json_text(&row.data)?,
                ts(row.created_at),
            ],
        )?;
        Ok(row)
    }

    async fn create_token(&self, row_id: RowId) -> Result<TokenRecord> {
        let token = TokenRecord {
            token_id: TokenId::generate(),
            row_id,
            created_at: Utc::now(),
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: None,
        };
        let conn = self.lock()?;
        require_exists(&conn, "rows", "row_id", &row_id.to_string())?;
        insert_token(&conn, &token)?;
        Ok(token)
    }

    async fn fork_tokens(
        &self,
        parent_token_id: TokenId,
        branches: &[String],
        step_in_pipeline: Option<u32>,
    ) -> Result<Vec<TokenRecord>> {
        let conn = self.lock()?;
        let row_id: String = conn
            .query_row(
                "SELECT row_id FROM tokens WHERE token_id = ?1",
                params![parent_token_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("token {parent_token_id}")))?;
        let row_id = parse_id!(RowId, row_id);
        let fork_group_id = ForkGroupId::generate();
        let mut children = Vec::with_capacity(branches.len());
        for (ordinal, branch) in branches.iter().enumerate() {
            let token = TokenRecord {
                token_id: TokenId::generate(),
                row_id,
                created_at: Utc::now(),
                fork_group_id: Some(fork_group_id),
                join_group_id: None,
                expand_group_id: None,
                branch_name: Some(branch.clone()),
                step_in_pipeline,
            };
            insert_token(&conn, &token)?;
            insert_token_parent(
                &conn,
                &TokenParent {
                    token_id: token.token_id,
                    parent_token_id,
                    ordinal: ordinal as u32,
                },
            )?;
            children.push(token);
        }
        Ok(children)
    }

    async fn expand_token(
        &self,
        parent_token_id: TokenId,
        row_id: RowId,
        count: u32,
        step_in_pipeline: Option<u32>,
    ) -> Result<Vec<TokenRecord>> {
        let conn = self.lock()?;
        require_exists(&conn, "tokens", "token_id", &parent_token_id.to_string())?;
        require_exists(&conn, "rows", "row_id", &row_id.to_string())?;
        let expand_group_id = ExpandGroupId::generate();
        let mut children = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let token = TokenRecord {
                token_id: TokenId::generate(),
                row_id,
                created_at: Utc::now(),
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: Some(expand_group_id),
                branch_name: None,
                step_in_pipeline,
            };
            insert_token(&conn, &token)?;
            insert_token_parent(
                &conn,
                &TokenParent {
                    token_id: token.token_id,
                    parent_token_id,
                    ordinal,
                },
            )?;
            children.push(token);
        }
        Ok(children)
    }

    async fn join_tokens(
        &self,
        parent_token_ids: &[TokenId],
        row_id: RowId,
        branch_name: &str,
        step_in_pipeline: Option<u32>,
    ) -> Result<TokenRecord> {
        if parent_token_ids.is_empty() {
            return Err(AuditError::InvariantViolation(
                "join requires at least one parent token".to_string(),
            ));
        }
        let conn = self.lock()?;
        for parent in parent_token_ids {
            require_exists(&conn, "tokens", "token_id", &parent.to_string())?;
        }
        let token = TokenRecord {
            token_id: TokenId::generate(),
            row_id,
            created_at: Utc::now(),
            fork_group_id: None,
            join_group_id: Some(JoinGroupId::generate()),
            expand_group_id: None,
            branch_name: Some(branch_name.to_string()),
            step_in_pipeline,
        };
        insert_token(&conn, &token)?;
        for (ordinal, parent) in parent_token_ids.iter().enumerate() {
            insert_token_parent(
                &conn,
                &TokenParent {
                    token_id: token.token_id,
                    parent_token_id: *parent,
                    ordinal: ordinal as u32,
                },
            )?;
        }
        Ok(token)
    }

    async fn begin_node_state(&self, start: NodeStateStart) -> Result<NodeState> {
        let (input_hash, input_payload) = match &start.input_data {
            Some(data) => {
                let (hash, slot) = self.payload_slot(PayloadKind::Row, data).await?;
                (Some(hash), slot)
            }
            None => (None, PayloadSlot::Absent),
        };
        let conn = self.lock()?;
        require_exists(&conn, "tokens", "token_id", &start.token_id.to_string())?;
        require_exists(&conn, "nodes", "node_id", &start.node_id.to_string())?;
        let running: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM node_states WHERE token_id = ?1 AND node_id = ?2 AND status = 'running'",
                params![start.token_id.to_string(), start.node_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if running.is_some() {
            return Err(AuditError::InvariantViolation(format!(
                "token {} already has a running state at node {}",
                start.token_id, start.node_id
            )));
        }
        let state = NodeState {
            state_id: StateId::generate(),
            token_id: start.token_id,
            node_id: start.node_id,
            attempt: start.attempt,
            status: NodeStateStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input_hash,
            output_hash: None,
            input_payload,
            output_payload: PayloadSlot::Absent,
            duration_ms: None,
            error_json: None,
            context_before: start.context_before,
            context_after: None,
            step_index: start.step_index,
        };
        conn.execute(
            &format!(
                "INSERT INTO node_states ({STATE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                state.state_id.to_string(),
                state.token_id.to_string(),
                state.node_id.to_string(),
                state.attempt,
                state.status.as_str(),
                ts(state.started_at),
                Option::<String>::None,
                state.input_hash,
                state.output_hash,
                slot_text(&state.input_payload)?,
                slot_text(&state.output_payload)?,
                state.duration_ms,
                opt_json_text(&state.error_json)?,
                opt_json_text(&state.context_before)?,
                opt_json_text(&state.context_after)?,
                state.step_index,
            ],
        )?;
        Ok(state)
    }

    async fn complete_node_state(
        &self,
        state_id: StateId,
        completion: NodeStateCompletion,
    ) -> Result<()> {
        if !completion.status.is_terminal() {
            return Err(AuditError::InvariantViolation(
                "complete_node_state requires a terminal status".to_string(),
            ));
        }
        let (output_hash, output_payload) = match &completion.output {
            Some(output) => {
                let value = output.as_value();
                let kind = match output {
                    NodeOutput::Single(_) => PayloadKind::Row,
                    NodeOutput::Multi(_) => PayloadKind::Aggregate,
                };
                let (hash, slot) = self.payload_slot(kind, &value).await?;
                (Some(hash), slot)
            }
            None => (None, PayloadSlot::Absent),
        };
        let conn = self.lock()?;
        let current: String = conn
            .query_row(
                "SELECT status FROM node_states WHERE state_id = ?1",
                params![state_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("node state {state_id}")))?;
        if current != NodeStateStatus::Running.as_str() {
            return Err(AuditError::InvariantViolation(format!(
                "node state {state_id} already terminal as {current}"
            )));
        }
        conn.execute(
            "UPDATE node_states
             SET status = ?2, completed_at = ?3, output_hash = ?4, output_payload = ?5,
                 duration_ms = ?6, error_json = ?7, context_after = ?8
             WHERE state_id = ?1",
            params![
                state_id.to_string(),
                completion.status.as_str(),
                ts(Utc::now()),
                output_hash,
                slot_text(&output_payload)?,
                completion.duration_ms,
                opt_json_text(&completion.error)?,
                opt_json_text(&completion.context_after)?,
            ],
        )?;
        Ok(())
    }

    async fn record_routing_event(
        &self,
        state_id: StateId,
        kind: RoutingKind,
        destinations: &[String],
        mode: RouteMode,
        reason: &Value,
    ) -> Result<RoutingEvent> {
        let event = RoutingEvent {
            event_id: EventId::generate(),
            state_id,
            kind,
            destinations: destinations.to_vec(),
            mode,
            reason: reason.clone(),
            recorded_at: Utc::now(),
        };
        let conn = self.lock()?;
        require_exists(&conn, "node_states", "state_id", &state_id.to_string())?;
        conn.execute(
            "INSERT INTO routing_events (event_id, state_id, kind, destinations, mode, reason_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id.to_string(),
                event.state_id.to_string(),
                event.kind.as_str(),
                serde_json::to_string(&event.destinations)?,
                event.mode.as_str(),
                json_text(&event.reason)?,
                ts(event.recorded_at),
            ],
        )?;
        Ok(event)
    }

    async fn create_batch(&self, run_id: RunId, node_id: NodeId) -> Result<Batch> {
        let batch = Batch {
            batch_id: BatchId::generate(),
            run_id,
            node_id,
            status: BatchStatus::Draft,
            created_at: Utc::now(),
            completed_at: None,
            error_json: None,
        };
        let conn = self.lock()?;
        require_exists(&conn, "runs", "run_id", &run_id.to_string())?;
        require_exists(&conn, "nodes", "node_id", &node_id.to_string())?;
        conn.execute(
            "INSERT INTO batches (batch_id, run_id, node_id, status, created_at, completed_at, error_json)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL)",
            params![
                batch.batch_id.to_string(),
                batch.run_id.to_string(),
                batch.node_id.to_string(),
                batch.status.as_str(),
                ts(batch.created_at),
            ],
        )?;
        Ok(batch)
    }

    async fn add_batch_member(
        &self,
        batch_id: BatchId,
        token_id: TokenId,
        ordinal: u32,
    ) -> Result<()> {
        let conn = self.lock()?;
        let (status, node_id): (String, String) = conn
            .query_row(
                "SELECT status, node_id FROM batches WHERE batch_id = ?1",
                params![batch_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
        if status != BatchStatus::Draft.as_str() {
            return Err(AuditError::InvariantViolation(format!(
                "batch {batch_id} is {status}; members may only join a draft batch"
            )));
        }
        require_exists(&conn, "tokens", "token_id", &token_id.to_string())?;
        let already: Option<String> = conn
            .query_row(
                "SELECT bm.batch_id FROM batch_members bm
                 JOIN batches b ON b.batch_id = bm.batch_id
                 WHERE bm.token_id = ?1 AND b.node_id = ?2",
                params![token_id.to_string(), node_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = already {
            return Err(AuditError::InvariantViolation(format!(
                "token {token_id} is already a member of batch {existing} at this node"
            )));
        }
        conn.execute(
            "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
            params![batch_id.to_string(), token_id.to_string(), ordinal],
        )?;
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        error: Option<Value>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let current: String = conn
            .query_row(
                "SELECT status FROM batches WHERE batch_id = ?1",
                params![batch_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
        let current_status: BatchStatus = parse_enum(&current)?;
        let legal = matches!(
            (current_status, status),
            (BatchStatus::Draft, BatchStatus::Executing)
                | (BatchStatus::Executing, BatchStatus::Completed)
                | (BatchStatus::Executing, BatchStatus::Failed)
                | (BatchStatus::Draft, BatchStatus::Failed)
        );
        if !legal {
            return Err(AuditError::InvariantViolation(format!(
                "illegal batch transition {} -> {}",
                current_status.as_str(),
                status.as_str()
            )));
        }
        let completed_at = matches!(status, BatchStatus::Completed | BatchStatus::Failed)
            .then(|| ts(Utc::now()));
        conn.execute(
            "UPDATE batches SET status = ?2, error_json = ?3, completed_at = COALESCE(?4, completed_at)
             WHERE batch_id = ?1",
            params![
                batch_id.to_string(),
                status.as_str(),
                opt_json_text(&error)?,
                completed_at,
            ],
        )?;
        Ok(())
    }

    async fn record_batch_output(
        &self,
        batch_id: BatchId,
        ordinal: u32,
        data: &Value,
    ) -> Result<BatchOutput> {
        let (data_hash, payload) = self.payload_slot(PayloadKind::Aggregate, data).await?;
        let conn = self.lock()?;
        let status: String = conn
            .query_row(
                "SELECT status FROM batches WHERE batch_id = ?1",
                params![batch_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
        if status != BatchStatus::Executing.as_str() {
            return Err(AuditError::InvariantViolation(format!(
                "batch {batch_id} is {status}; outputs require an executing batch"
            )));
        }
        let output = BatchOutput {
            batch_id,
            ordinal,
            data_hash,
            payload,
        };
        conn.execute(
            "INSERT INTO batch_outputs (batch_id, ordinal, data_hash, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                output.batch_id.to_string(),
                output.ordinal,
                output.data_hash,
                slot_text(&output.payload)?,
            ],
        )?;
        Ok(output)
    }

    async fn record_artifact(&self, spec: ArtifactSpec) -> Result<Artifact> {
        let artifact = Artifact {
            artifact_id: ArtifactId::generate(),
            state_id: spec.state_id,
            kind: spec.kind,
            path_or_uri: spec.path_or_uri,
            content_hash: spec.content_hash,
            size_bytes: spec.size_bytes,
            idempotency_key: spec.idempotency_key,
        };
        let conn = self.lock()?;
        require_exists(&conn, "node_states", "state_id", &spec.state_id.to_string())?;
        conn.execute(
            "INSERT INTO artifacts (artifact_id, state_id, kind, path_or_uri, content_hash, size_bytes, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.artifact_id.to_string(),
                artifact.state_id.to_string(),
                artifact.kind,
                artifact.path_or_uri,
                artifact.content_hash,
                artifact.size_bytes,
                artifact.idempotency_key,
            ],
        )?;
        Ok(artifact)
    }

    async fn record_validation_failure(
        &self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        reason: &str,
        raw_data: Option<&Value>,
    ) -> Result<()> {
        let raw_data_ref = match raw_data {
            Some(data) => {
                let bytes = canonical::canonical_json(data)?;
                let hash = self
                    .payload_store
                    .put(&bytes)
                    .await
                    .map_err(AuditError::from)?;
                Some(PayloadRef {
                    content_hash: hash,
                    size_bytes: bytes.len() as u64,
                    kind: PayloadKind::Row,
                })
            }
            None => None,
        };
        let conn = self.lock()?;
        require_exists(&conn, "nodes", "node_id", &source_node_id.to_string())?;
        conn.execute(
            "INSERT INTO validation_failures (run_id, source_node_id, row_index, reason, raw_data_ref, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id.to_string(),
                source_node_id.to_string(),
                row_index,
                reason,
                raw_data_ref
                    .map(|r| serde_json::to_string(&r))
                    .transpose()?,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    async fn record_call(&self, spec: CallSpec) -> Result<CallRecord> {
        let request_hash = spec.request.as_ref().map(stable_hash).transpose()?;
        let response_hash = spec.response.as_ref().map(stable_hash).transpose()?;
        let call = CallRecord {
            call_id: CallId::generate(),
            state_id: spec.state_id,
            target: spec.target,
            request_hash,
            response_hash,
            status: spec.status,
            duration_ms: spec.duration_ms,
            recorded_at: Utc::now(),
        };
        let conn = self.lock()?;
        require_exists(&conn, "node_states", "state_id", &spec.state_id.to_string())?;
        conn.execute(
            "INSERT INTO calls (call_id, state_id, target, request_hash, response_hash, status, duration_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                call.call_id.to_string(),
                call.state_id.to_string(),
                call.target,
                call.request_hash,
                call.response_hash,
                call.status,
                call.duration_ms,
                ts(call.recorded_at),
            ],
        )?;
        Ok(call)
    }

    // --- read model ---

    async fn get_run(&self, run_id: RunId) -> Result<Run> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT run_id, started_at, completed_at, status, config_hash, canonical_version
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("run {run_id}")))?;
        Ok(Run {
            run_id: parse_id!(RunId, raw.0),
            started_at: parse_ts(&raw.1)?,
            completed_at: parse_opt_ts(raw.2)?,
            status: parse_enum(&raw.3)?,
            config_hash: raw.4,
            canonical_version: raw.5,
        })
    }

    async fn get_node(&self, node_id: NodeId) -> Result<NodeRecord> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ?1"),
            params![node_id.to_string()],
            node_from_row,
        )
        .optional()?
        .ok_or_else(|| AuditError::NotFound(format!("node {node_id}")))?
        .into_record()
    }

    async fn nodes_for_run(&self, run_id: RunId) -> Result<Vec<NodeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE run_id = ?1 ORDER BY sequence, node_id"
        ))?;
        let rows = stmt.query_map(params![run_id.to_string()], node_from_row)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?.into_record()?);
        }
        Ok(nodes)
    }

    async fn edges_for_run(&self, run_id: RunId) -> Result<Vec<EdgeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT edge_id, from_node_id, to_node_id, label, mode FROM edges WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut edges = Vec::new();
        for row in rows {
            let raw = row?;
            edges.push(EdgeRecord {
                edge_id: parse_id!(EdgeId, raw.0),
                run_id,
                from_node_id: parse_id!(NodeId, raw.1),
                to_node_id: parse_id!(NodeId, raw.2),
                label: raw.3,
                mode: parse_enum(&raw.4)?,
            });
        }
        Ok(edges)
    }

    async fn rows_for_run(&self, run_id: RunId) -> Result<Vec<RowRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT row_id, source_node_id, row_index, data_json, created_at
             FROM rows WHERE run_id = ?1 ORDER BY row_index",
        )?;
        let raw_rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut rows = Vec::new();
        for row in raw_rows {
            let raw = row?;
            rows.push(RowRecord {
                row_id: parse_id!(RowId, raw.0),
                run_id,
                source_node_id: parse_id!(NodeId, raw.1),
                row_index: raw.2,
                data: parse_json(&raw.3)?,
                created_at: parse_ts(&raw.4)?,
            });
        }
        Ok(rows)
    }

    async fn tokens_for_run(&self, run_id: RunId) -> Result<Vec<TokenRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tokens t JOIN rows r ON r.row_id = t.row_id
             WHERE r.run_id = ?1 ORDER BY t.created_at, t.token_id",
            TOKEN_COLUMNS
                .split(", ")
                .map(|c| format!("t.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt.query_map(params![run_id.to_string()], token_from_row)?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?.into_record()?);
        }
        Ok(tokens)
    }

    async fn get_token(&self, token_id: TokenId) -> Result<TokenRecord> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_id = ?1"),
            params![token_id.to_string()],
            token_from_row,
        )
        .optional()?
        .ok_or_else(|| AuditError::NotFound(format!("token {token_id}")))?
        .into_record()
    }

    async fn states_for_token(&self, token_id: TokenId) -> Result<Vec<NodeState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM node_states WHERE token_id = ?1 ORDER BY started_at, attempt"
        ))?;
        let rows = stmt.query_map(params![token_id.to_string()], state_from_row)?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row?.into_record()?);
        }
        Ok(states)
    }

    async fn routing_events_for_state(&self, state_id: StateId) -> Result<Vec<RoutingEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, kind, destinations, mode, reason_json, recorded_at
             FROM routing_events WHERE state_id = ?1 ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map(params![state_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let raw = row?;
            events.push(RoutingEvent {
                event_id: parse_id!(EventId, raw.0),
                state_id,
                kind: parse_enum(&raw.1)?,
                destinations: serde_json::from_str(&raw.2)?,
                mode: parse_enum(&raw.3)?,
                reason: parse_json(&raw.4)?,
                recorded_at: parse_ts(&raw.5)?,
            });
        }
        Ok(events)
    }

    async fn batches_for_run(&self, run_id: RunId) -> Result<Vec<Batch>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, node_id, status, created_at, completed_at, error_json
             FROM batches WHERE run_id = ?1 ORDER BY created_at, batch_id",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut batches = Vec::new();
        for row in rows {
            let raw = row?;
            batches.push(Batch {
                batch_id: parse_id!(BatchId, raw.0),
                run_id,
                node_id: parse_id!(NodeId, raw.1),
                status: parse_enum(&raw.2)?,
                created_at: parse_ts(&raw.3)?,
                completed_at: parse_opt_ts(raw.4)?,
                error_json: parse_opt_json(raw.5)?,
            });
        }
        Ok(batches)
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT run_id, node_id, status, created_at, completed_at, error_json
                 FROM batches WHERE batch_id = ?1",
                params![batch_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| AuditError::NotFound(format!("batch {batch_id}")))?;
        Ok(Batch {
            batch_id,
            run_id: parse_id!(RunId, raw.0),
            node_id: parse_id!(NodeId, raw.1),
            status: parse_enum(&raw.2)?,
            created_at: parse_ts(&raw.3)?,
            completed_at: parse_opt_ts(raw.4)?,
            error_json: parse_opt_json(raw.5)?,
        })
    }

    async fn batch_members(&self, batch_id: BatchId) -> Result<Vec<BatchMember>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT token_id, ordinal FROM batch_members WHERE batch_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![batch_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut members = Vec::new();
        for row in rows {
            let raw = row?;
            members.push(BatchMember {
                batch_id,
                token_id: parse_id!(TokenId, raw.0),
                ordinal: raw.1,
            });
        }
        Ok(members)
    }

    async fn batch_outputs(&self, batch_id: BatchId) -> Result<Vec<BatchOutput>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT ordinal, data_hash, payload FROM batch_outputs WHERE batch_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![batch_id.to_string()], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut outputs = Vec::new();
        for row in rows {
            let raw = row?;
            outputs.push(BatchOutput {
                batch_id,
                ordinal: raw.0,
                data_hash: raw.1,
                payload: parse_slot(&raw.2)?,
            });
        }
        Ok(outputs)
    }

    async fn batch_membership(&self, token_id: TokenId) -> Result<Vec<BatchMember>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, ordinal FROM batch_members WHERE token_id = ?1",
        )?;
        let rows = stmt.query_map(params![token_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut members = Vec::new();
        for row in rows {
            let raw = row?;
            members.push(BatchMember {
                batch_id: parse_id!(BatchId, raw.0),
                token_id,
                ordinal: raw.1,
            });
        }
        Ok(members)
    }

    async fn token_parents(&self, token_id: TokenId) -> Result<Vec<TokenParent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT parent_token_id, ordinal FROM token_parents WHERE token_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![token_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut parents = Vec::new();
        for row in rows {
            let raw = row?;
            parents.push(TokenParent {
                token_id,
                parent_token_id: parse_id!(TokenId, raw.0),
                ordinal: raw.1,
            });
        }
        Ok(parents)
    }

    async fn children_of(&self, token_id: TokenId) -> Result<Vec<TokenId>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT token_id FROM token_parents WHERE parent_token_id = ?1")?;
        let rows = stmt.query_map(params![token_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut children = Vec::new();
        for row in rows {
            children.push(parse_id!(TokenId, row?));
        }
        Ok(children)
    }

    async fn artifacts_for_state(&self, state_id: StateId) -> Result<Vec<Artifact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT artifact_id, kind, path_or_uri, content_hash, size_bytes, idempotency_key
             FROM artifacts WHERE state_id = ?1",
        )?;
        let rows = stmt.query_map(params![state_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<u64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut artifacts = Vec::new();
        for row in rows {
            let raw = row?;
            artifacts.push(Artifact {
                artifact_id: parse_id!(ArtifactId, raw.0),
                state_id,
                kind: raw.1,
                path_or_uri: raw.2,
                content_hash: raw.3,
                size_bytes: raw.4,
                idempotency_key: raw.5,
            });
        }
        Ok(artifacts)
    }

    async fn calls_for_state(&self, state_id: StateId) -> Result<Vec<CallRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT call_id, target, request_hash, response_hash, status, duration_ms, recorded_at
             FROM calls WHERE state_id = ?1 ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map(params![state_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<u64>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut calls = Vec::new();
        for row in rows {
            let raw = row?;
            calls.push(CallRecord {
                call_id: parse_id!(CallId, raw.0),
                state_id,
                target: raw.1,
                request_hash: raw.2,
                response_hash: raw.3,
                status: raw.4,
                duration_ms: raw.5,
                recorded_at: parse_ts(&raw.6)?,
            });
        }
        Ok(calls)
    }

    async fn artifacts_for_run(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT a.artifact_id, a.state_id, a.kind, a.path_or_uri, a.content_hash, a.size_bytes, a.idempotency_key
             FROM artifacts a
             JOIN node_states s ON s.state_id = a.state_id
             JOIN tokens t ON t.token_id = s.token_id
             JOIN rows r ON r.row_id = t.row_id
             WHERE r.run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<u64>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut artifacts = Vec::new();
        for row in rows {
            let raw = row?;
            artifacts.push(Artifact {
                artifact_id: parse_id!(ArtifactId, raw.0),
                state_id: parse_id!(StateId, raw.1),
                kind: raw.2,
                path_or_uri: raw.3,
                content_hash: raw.4,
                size_bytes: raw.5,
                idempotency_key: raw.6,
            });
        }
        Ok(artifacts)
    }

    async fn validation_failures(&self, run_id: RunId) -> Result<Vec<ValidationFailure>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source_node_id, row_index, reason, raw_data_ref, recorded_at
             FROM validation_failures WHERE run_id = ?1 ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut failures = Vec::new();
        for row in rows {
            let raw = row?;
            failures.push(ValidationFailure {
                run_id,
                source_node_id: parse_id!(NodeId, raw.0),
                row_index: raw.1,
                reason: raw.2,
                raw_data_ref: raw
                    .3
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                recorded_at: parse_ts(&raw.4)?,
            });
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CANONICAL_VERSION;
    use crate::payload::InMemoryPayloadStore;
    use crate::recorder::NodeOutput;
    use serde_json::json;

    fn landscape() -> SqliteLandscape {
        SqliteLandscape::open_in_memory(Arc::new(InMemoryPayloadStore::new())).unwrap()
    }

    async fn seeded(
        store: &SqliteLandscape,
    ) -> (Run, NodeRecord, RowRecord, TokenRecord) {
        let run = store
            .begin_run(&json!({"pipeline": "sqlite-test"}), CANONICAL_VERSION)
            .await
            .unwrap();
        let node = store
            .register_node(NodeRegistration {
                node_id: NodeId::generate(),
                run_id: run.run_id,
                plugin_name: "test_source".to_string(),
                node_type: NodeType::Source,
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: json!({"path": "rows.csv"}),
                input_schema: None,
                output_schema: Some(json!({"id": "int"})),
                sequence: Some(0),
            })
            .await
            .unwrap();
        let row = store
            .create_row(run.run_id, node.node_id, 0, &json!({"id": 1}))
            .await
            .unwrap();
        let token = store.create_token(row.row_id).await.unwrap();
        (run, node, row, token)
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = landscape();
        let (run, ..) = seeded(&store).await;
        let loaded = store.get_run(run.run_id).await.unwrap();
        assert_eq!(loaded.config_hash, run.config_hash);
        assert_eq!(loaded.status, RunStatus::Running);
        store
            .complete_run(run.run_id, RunStatus::Completed)
            .await
            .unwrap();
        assert!(matches!(
            store.complete_run(run.run_id, RunStatus::Failed).await,
            Err(AuditError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_node_registration_idempotent() {
        let store = landscape();
        let (run, node, ..) = seeded(&store).await;
        let again = store
            .register_node(NodeRegistration {
                node_id: NodeId::generate(),
                run_id: run.run_id,
                plugin_name: "test_source".to_string(),
                node_type: NodeType::Source,
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: json!({"path": "rows.csv"}),
                input_schema: None,
                output_schema: Some(json!({"id": "int"})),
                sequence: Some(0),
            })
            .await
            .unwrap();
        assert_eq!(again.node_id, node.node_id);
        assert_eq!(store.nodes_for_run(run.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_node_state_lifecycle_and_reads() {
        let store = landscape();
        let (_run, node, _row, token) = seeded(&store).await;
        let state = store
            .begin_node_state(NodeStateStart {
                token_id: token.token_id,
                node_id: node.node_id,
                step_index: 0,
                attempt: 1,
                input_data: Some(json!({"id": 1})),
                context_before: None,
            })
            .await
            .unwrap();
        store
            .complete_node_state(
                state.state_id,
                NodeStateCompletion {
                    status: NodeStateStatus::Completed,
                    output: Some(NodeOutput::Single(json!({"id": 1, "doubled": 2}))),
                    duration_ms: 7,
                    error: None,
                    context_after: None,
                },
            )
            .await
            .unwrap();
        let states = store.states_for_token(token.token_id).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, NodeStateStatus::Completed);
        assert!(states[0].output_hash.is_some());
        assert_ne!(states[0].output_hash, states[0].input_hash);
        assert_eq!(states[0].duration_ms, Some(7));
        assert_eq!(
            states[0].output_payload.inline(),
            Some(&json!({"id": 1, "doubled": 2}))
        );
    }

    #[tokio::test]
    async fn test_fork_and_lineage_round_trip() {
        let store = landscape();
        let (_run, _node, _row, token) = seeded(&store).await;
        let children = store
            .fork_tokens(
                token.token_id,
                &["fast".to_string(), "slow".to_string()],
                Some(1),
            )
            .await
            .unwrap();
        assert_eq!(children.len(), 2);
        let loaded = store.get_token(children[0].token_id).await.unwrap();
        assert_eq!(loaded.branch_name.as_deref(), Some("fast"));
        assert_eq!(loaded.fork_group_id, children[1].fork_group_id);
        let parents = store.token_parents(children[1].token_id).await.unwrap();
        assert_eq!(parents[0].parent_token_id, token.token_id);
        assert_eq!(parents[0].ordinal, 1);
        let child_ids = store.children_of(token.token_id).await.unwrap();
        assert_eq!(child_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_protocol_enforced() {
        let store = landscape();
        let (run, node, _row, token) = seeded(&store).await;
        let batch = store.create_batch(run.run_id, node.node_id).await.unwrap();
        store
            .add_batch_member(batch.batch_id, token.token_id, 0)
            .await
            .unwrap();
        assert!(matches!(
            store
                .record_batch_output(batch.batch_id, 0, &json!({"n": 1}))
                .await,
            Err(AuditError::InvariantViolation(_))
        ));
        store
            .update_batch_status(batch.batch_id, BatchStatus::Executing, None)
            .await
            .unwrap();
        store
            .record_batch_output(batch.batch_id, 0, &json!({"n": 1}))
            .await
            .unwrap();
        store
            .update_batch_status(batch.batch_id, BatchStatus::Completed, None)
            .await
            .unwrap();
        let loaded = store.get_batch(batch.batch_id).await.unwrap();
        assert_eq!(loaded.status, BatchStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(store.batch_outputs(batch.batch_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let payloads = Arc::new(InMemoryPayloadStore::new());
        let run_id = {
            let store = SqliteLandscape::open(&path, payloads.clone(), 1024).unwrap();
            let run = store
                .begin_run(&json!({"durable": true}), CANONICAL_VERSION)
                .await
                .unwrap();
            store
                .complete_run(run.run_id, RunStatus::Completed)
                .await
                .unwrap();
            run.run_id
        };
        let reopened = SqliteLandscape::open(&path, payloads, 1024).unwrap();
        let run = reopened.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
}
