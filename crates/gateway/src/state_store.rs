//! Durable agent state with optimistic concurrency.
//!
//! `save` is a compare-and-swap on the eTag of a single agent. An empty
//! expected eTag means "create"; a non-empty one means "update". Every
//! successful save assigns a fresh eTag.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    agentgate_protocol::{AgentId, AgentState, AgentStateData, Blob},
    async_trait::async_trait,
    dashmap::DashMap,
    sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    tracing::debug,
};

use crate::error::StateError;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, agent_id: &AgentId) -> Result<Option<AgentState>, StateError>;

    /// Store `state` if `state.etag` matches the current eTag. Returns the
    /// new eTag.
    async fn save(&self, state: AgentState) -> Result<String, StateError>;
}

fn new_etag() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Process-local store. Each agent has its own slot and lock, so saves to
/// different agents never wait on each other.
#[derive(Default)]
pub struct MemoryStateStore {
    slots: DashMap<AgentId, Arc<Mutex<Option<AgentState>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, agent_id: &AgentId) -> Arc<Mutex<Option<AgentState>>> {
        Arc::clone(self.slots.entry(agent_id.clone()).or_default().value())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, agent_id: &AgentId) -> Result<Option<AgentState>, StateError> {
        let Some(slot) = self.slots.get(agent_id).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };
        let current = slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(current.clone())
    }

    async fn save(&self, mut state: AgentState) -> Result<String, StateError> {
        // Only a create may allocate a slot; updates of unknown agents leave
        // the map untouched.
        let slot = if state.etag.is_empty() {
            self.slot(&state.agent_id)
        } else {
            match self.slots.get(&state.agent_id) {
                Some(slot) => Arc::clone(slot.value()),
                None => return Err(StateError::NotFound(state.agent_id)),
            }
        };
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            None if !state.etag.is_empty() => return Err(StateError::NotFound(state.agent_id)),
            Some(stored) if stored.etag != state.etag => {
                return Err(StateError::ETagMismatch(state.agent_id));
            },
            _ => {},
        }
        let etag = new_etag();
        state.etag = etag.clone();
        debug!(agent = %state.agent_id, kind = state.data.kind(), "state saved");
        *current = Some(state);
        Ok(etag)
    }
}

// ── SQLite ───────────────────────────────────────────────────────────────────

/// SQLite-backed store. The eTag comparison is part of the write statement,
/// so the database serializes racing saves per row.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    agent_type: String,
    agent_key: String,
    etag: String,
    data_kind: String,
    data: Vec<u8>,
}

impl TryFrom<StateRow> for AgentState {
    type Error = StateError;

    fn try_from(r: StateRow) -> Result<Self, StateError> {
        let data = match r.data_kind.as_str() {
            "binary" => AgentStateData::Binary(Blob(r.data)),
            "text" => AgentStateData::Text(
                String::from_utf8(r.data).map_err(|e| StateError::Storage(e.to_string()))?,
            ),
            "structured" => AgentStateData::Structured(serde_json::from_slice(&r.data)?),
            other => return Err(StateError::Storage(format!("unknown data kind: {other}"))),
        };
        Ok(Self {
            agent_id: AgentId::new(r.agent_type, r.agent_key),
            etag: r.etag,
            data,
        })
    }
}

fn encode_data(data: &AgentStateData) -> Result<Vec<u8>, StateError> {
    Ok(match data {
        AgentStateData::Binary(blob) => blob.as_slice().to_vec(),
        AgentStateData::Text(text) => text.as_bytes().to_vec(),
        AgentStateData::Structured(value) => serde_json::to_vec(value)?,
    })
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create the `agent_state` table if it doesn't exist.
    pub async fn init(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                agent_type TEXT    NOT NULL,
                agent_key  TEXT    NOT NULL,
                etag       TEXT    NOT NULL,
                data_kind  TEXT    NOT NULL,
                data       BLOB    NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (agent_type, agent_key)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn current_etag(&self, agent_id: &AgentId) -> Result<Option<String>, StateError> {
        let etag = sqlx::query_scalar::<_, String>(
            "SELECT etag FROM agent_state WHERE agent_type = ? AND agent_key = ?",
        )
        .bind(&agent_id.r#type)
        .bind(&agent_id.key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(etag)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, agent_id: &AgentId) -> Result<Option<AgentState>, StateError> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT agent_type, agent_key, etag, data_kind, data FROM agent_state
             WHERE agent_type = ? AND agent_key = ?",
        )
        .bind(&agent_id.r#type)
        .bind(&agent_id.key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AgentState::try_from).transpose()
    }

    async fn save(&self, state: AgentState) -> Result<String, StateError> {
        let etag = new_etag();
        let data = encode_data(&state.data)?;
        let id = &state.agent_id;

        let written = if state.etag.is_empty() {
            sqlx::query(
                r#"INSERT INTO agent_state (agent_type, agent_key, etag, data_kind, data, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT(agent_type, agent_key) DO NOTHING"#,
            )
            .bind(&id.r#type)
            .bind(&id.key)
            .bind(&etag)
            .bind(state.data.kind())
            .bind(&data)
            .bind(now_ms())
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"UPDATE agent_state SET etag = ?, data_kind = ?, data = ?, updated_at = ?
                   WHERE agent_type = ? AND agent_key = ? AND etag = ?"#,
            )
            .bind(&etag)
            .bind(state.data.kind())
            .bind(&data)
            .bind(now_ms())
            .bind(&id.r#type)
            .bind(&id.key)
            .bind(&state.etag)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if written == 1 {
            debug!(agent = %id, kind = state.data.kind(), "state saved");
            return Ok(etag);
        }
        match self.current_etag(id).await? {
            None => Err(StateError::NotFound(state.agent_id)),
            Some(_) => Err(StateError::ETagMismatch(state.agent_id)),
        }
    }
}
