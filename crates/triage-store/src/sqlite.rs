//! SQLite implementation of every triage collaborator

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use triage_core::metrics::{Metric, MetricQuery, MetricType};
use triage_core::providers::{ProviderKind, TokenUsage};
use triage_core::store::{
    AgentRepository, AssignmentRepository, ConfigStore, ConversationStore, MetricsStore,
};
use triage_core::types::{
    AccountId, Agent, AgentId, AgentStatus, Assignment, Category, Conversation, ConversationId,
    ConversationStatus, ConversationTurn, Message, MessageDirection,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    custom_attributes TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversations_account ON conversations(account_id, status);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    direction TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    template_id TEXT NOT NULL,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT,
    temperature REAL NOT NULL,
    max_tokens INTEGER NOT NULL,
    custom_prompt TEXT,
    auto_respond INTEGER NOT NULL DEFAULT 0,
    trigger_conditions TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(account_id, template_id)
);

CREATE TABLE IF NOT EXISTS assignments (
    id TEXT PRIMARY KEY,
    conversation_id INTEGER NOT NULL,
    agent_id INTEGER NOT NULL,
    confidence REAL NOT NULL,
    reason TEXT NOT NULL,
    auto_assigned INTEGER NOT NULL,
    active INTEGER NOT NULL,
    assigned_at TEXT NOT NULL,
    unassigned_at TEXT,
    unassignment_reason TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY(agent_id) REFERENCES agents(id) ON DELETE CASCADE
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_one_active
    ON assignments(conversation_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_assignments_agent ON assignments(agent_id, assigned_at);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    agent_id INTEGER NOT NULL,
    conversation_id INTEGER NOT NULL,
    inbound TEXT NOT NULL,
    response TEXT,
    provider TEXT NOT NULL,
    model TEXT,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error TEXT,
    helpful INTEGER,
    feedback TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY(agent_id) REFERENCES agents(id) ON DELETE CASCADE,
    FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_turns_agent ON turns(agent_id, created_at);

CREATE TABLE IF NOT EXISTS metrics (
    id TEXT PRIMARY KEY,
    agent_id INTEGER NOT NULL,
    metric_type TEXT NOT NULL,
    value REAL NOT NULL,
    date TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    FOREIGN KEY(agent_id) REFERENCES agents(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_metrics_agent_date ON metrics(agent_id, date);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const CONVERSATION_COLUMNS: &str =
    "id, account_id, status, custom_attributes, created_at, resolved_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, direction, content, created_at";
const AGENT_COLUMNS: &str = "id, account_id, template_id, name, category, status, provider, model, \
     temperature, max_tokens, custom_prompt, auto_respond, trigger_conditions, created_at, updated_at";
const ASSIGNMENT_COLUMNS: &str = "id, conversation_id, agent_id, confidence, reason, auto_assigned, \
     active, assigned_at, unassigned_at, unassignment_reason, metadata";
const TURN_COLUMNS: &str = "id, agent_id, conversation_id, inbound, response, provider, model, \
     prompt_tokens, completion_tokens, total_tokens, latency_ms, success, error, helpful, feedback, created_at";
const METRIC_COLUMNS: &str = "id, agent_id, metric_type, value, date, metadata, created_at";

/// SQLite-backed store (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Opening triage database at {:?}", path.as_ref());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize schema")?;
        debug!("Database schema initialized successfully");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
        conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::lock(&conn);
            f(&mut conn)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    pub async fn create_conversation(
        &self,
        account_id: AccountId,
        status: ConversationStatus,
    ) -> Result<Conversation> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO conversations (account_id, status, custom_attributes, created_at)
                 VALUES (?1, ?2, '{}', ?3)",
                params![account_id, status.to_string(), ts(now)],
            )?;
            let id = conn.last_insert_rowid();
            debug!("Created conversation {} for account {}", id, account_id);
            Ok(Conversation {
                id,
                account_id,
                status,
                custom_attributes: Map::new(),
                created_at: now,
                resolved_at: None,
            })
        })
        .await
    }

    /// Most recent conversations of an account regardless of status
    pub async fn recent_conversations(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations WHERE account_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
                CONVERSATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![account_id, limit as i64], row_to_conversation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

fn ts(at: DateTime<Utc>) -> String {
    // fixed precision keeps text ordering chronological
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: String) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn json_map(row: &Row, idx: usize) -> rusqlite::Result<Map<String, Value>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn map_json(map: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        status: ConversationStatus::from_str(&row.get::<_, String>(2)?),
        custom_attributes: json_map(row, 3)?,
        created_at: parse_ts(row.get(4)?),
        resolved_at: row.get::<_, Option<String>>(5)?.map(parse_ts),
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        direction: MessageDirection::from_str(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        created_at: parse_ts(row.get(4)?),
    })
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    let category: String = row.get(4)?;
    let provider: String = row.get(6)?;
    Ok(Agent {
        id: row.get(0)?,
        account_id: row.get(1)?,
        template_id: row.get(2)?,
        name: row.get(3)?,
        category: Category::from_str(&category)
            .ok_or_else(|| conversion_error(4, format!("unknown category {}", category)))?,
        status: AgentStatus::from_str(&row.get::<_, String>(5)?),
        provider: ProviderKind::from_str(&provider)
            .ok_or_else(|| conversion_error(6, format!("unknown provider {}", provider)))?,
        model: row.get(7)?,
        temperature: row.get::<_, f64>(8)? as f32,
        max_tokens: row.get::<_, i64>(9)? as u32,
        custom_prompt: row.get(10)?,
        auto_respond: row.get(11)?,
        trigger_conditions: json_map(row, 12)?,
        created_at: parse_ts(row.get(13)?),
        updated_at: parse_ts(row.get(14)?),
    })
}

fn row_to_assignment(row: &Row) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        agent_id: row.get(2)?,
        confidence: row.get(3)?,
        reason: row.get(4)?,
        auto_assigned: row.get(5)?,
        active: row.get(6)?,
        assigned_at: parse_ts(row.get(7)?),
        unassigned_at: row.get::<_, Option<String>>(8)?.map(parse_ts),
        unassignment_reason: row.get(9)?,
        metadata: json_map(row, 10)?,
    })
}

fn row_to_turn(row: &Row) -> rusqlite::Result<ConversationTurn> {
    let provider: String = row.get(5)?;
    Ok(ConversationTurn {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        conversation_id: row.get(2)?,
        inbound: row.get(3)?,
        response: row.get(4)?,
        provider: ProviderKind::from_str(&provider)
            .ok_or_else(|| conversion_error(5, format!("unknown provider {}", provider)))?,
        model: row.get(6)?,
        usage: TokenUsage {
            prompt_tokens: row.get::<_, i64>(7)? as u32,
            completion_tokens: row.get::<_, i64>(8)? as u32,
            total_tokens: row.get::<_, i64>(9)? as u32,
        },
        latency_ms: row.get::<_, i64>(10)? as u64,
        success: row.get(11)?,
        error: row.get(12)?,
        helpful: row.get(13)?,
        feedback: row.get(14)?,
        created_at: parse_ts(row.get(15)?),
    })
}

fn row_to_metric(row: &Row) -> rusqlite::Result<Metric> {
    let metric_type: String = row.get(2)?;
    let date: String = row.get(4)?;
    Ok(Metric {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        metric_type: MetricType::from_str(&metric_type)
            .ok_or_else(|| conversion_error(2, format!("unknown metric type {}", metric_type)))?,
        value: row.get(3)?,
        date: date
            .parse::<NaiveDate>()
            .map_err(|e| conversion_error(4, e.to_string()))?,
        metadata: json_map(row, 5)?,
        created_at: parse_ts(row.get(6)?),
    })
}

/// "?{start}, ?{start+1}, ..." for an IN clause of `count` values
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_assignment(conn: &Connection, a: &Assignment) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO assignments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            ASSIGNMENT_COLUMNS
        ),
        params![
            &a.id,
            a.conversation_id,
            a.agent_id,
            a.confidence,
            &a.reason,
            a.auto_assigned,
            a.active,
            ts(a.assigned_at),
            a.unassigned_at.map(ts),
            &a.unassignment_reason,
            map_json(&a.metadata)?,
        ],
    )?;
    Ok(())
}

/// Mark every active assignment of the conversation inactive; returns them as updated
fn deactivate_in(
    conn: &Connection,
    conversation_id: ConversationId,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<Vec<Assignment>> {
    let mut active = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM assignments WHERE conversation_id = ?1 AND active = 1",
            ASSIGNMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![conversation_id], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    conn.execute(
        "UPDATE assignments SET active = 0, unassigned_at = ?1, unassignment_reason = ?2
         WHERE conversation_id = ?3 AND active = 1",
        params![ts(at), reason, conversation_id],
    )?;
    for a in &mut active {
        a.active = false;
        a.unassigned_at = Some(at);
        a.unassignment_reason = Some(reason.to_string());
    }
    Ok(active)
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
                    params![id],
                    row_to_conversation,
                )
                .optional()?)
        })
        .await
    }

    async fn messages(&self, id: ConversationId, limit: usize) -> Result<Vec<Message>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let mut rows = stmt
                .query_map(params![id, limit as i64], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn conversations_by_status(
        &self,
        account_id: AccountId,
        statuses: &[ConversationStatus],
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM conversations WHERE account_id = ?1 AND status IN ({})
                 ORDER BY created_at DESC, id DESC LIMIT ?{}",
                CONVERSATION_COLUMNS,
                placeholders(2, statuses.len()),
                statuses.len() + 2
            );
            let mut values = vec![SqlValue::Integer(account_id)];
            values.extend(statuses.into_iter().map(SqlValue::Text));
            values.push(SqlValue::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), row_to_conversation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn set_status(&self, id: ConversationId, status: ConversationStatus) -> Result<()> {
        self.with_conn(move |conn| {
            let resolved_at = (status == ConversationStatus::Resolved).then(|| ts(Utc::now()));
            let changed = conn.execute(
                "UPDATE conversations SET status = ?1, resolved_at = ?2 WHERE id = ?3",
                params![status.to_string(), resolved_at, id],
            )?;
            if changed == 0 {
                bail!("conversation {} not found", id);
            }
            Ok(())
        })
        .await
    }

    async fn merge_custom_attributes(
        &self,
        id: ConversationId,
        attributes: Map<String, Value>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT custom_attributes FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                bail!("conversation {} not found", id);
            };
            let mut merged: Map<String, Value> = serde_json::from_str(&current)?;
            merged.extend(attributes);
            tx.execute(
                "UPDATE conversations SET custom_attributes = ?1 WHERE id = ?2",
                params![map_json(&merged)?, id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append_message(
        &self,
        id: ConversationId,
        direction: MessageDirection,
        content: &str,
    ) -> Result<Message> {
        let content = content.to_owned();
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                bail!("conversation {} not found", id);
            }
            let now = Utc::now();
            conn.execute(
                "INSERT INTO messages (conversation_id, direction, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, direction.to_string(), &content, ts(now)],
            )?;
            Ok(Message {
                id: conn.last_insert_rowid(),
                conversation_id: id,
                direction,
                content,
                created_at: now,
            })
        })
        .await
    }
}

impl ConfigStore for SqliteStore {
    fn get(&self, key: &str) -> Option<String> {
        let conn = Self::lock(&self.conn);
        match conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read config key {}: {}", key, e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = Self::lock(&self.conn);
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn record(&self, metric: Metric) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO metrics ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    METRIC_COLUMNS
                ),
                params![
                    &metric.id,
                    metric.agent_id,
                    metric.metric_type.to_string(),
                    metric.value,
                    metric.date.to_string(),
                    map_json(&metric.metadata)?,
                    ts(metric.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query(&self, query: &MetricQuery) -> Result<Vec<Metric>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM metrics
                 WHERE date >= ?1 AND date <= ?2
                   AND (?3 IS NULL OR agent_id = ?3)
                   AND (?4 IS NULL OR metric_type = ?4)
                 ORDER BY created_at",
                METRIC_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        query.from.to_string(),
                        query.to.to_string(),
                        query.agent_id,
                        query.metric_type.map(|t| t.to_string()),
                    ],
                    row_to_metric,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl AgentRepository for SqliteStore {
    async fn agents_for_account(&self, account_id: AccountId) -> Result<Vec<Agent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM agents WHERE account_id = ?1 ORDER BY id",
                AGENT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![account_id], row_to_agent)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn agent(&self, id: AgentId) -> Result<Option<Agent>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                    params![id],
                    row_to_agent,
                )
                .optional()?)
        })
        .await
    }

    async fn insert_agent(&self, mut agent: Agent) -> Result<Agent> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (account_id, template_id, name, category, status, provider, model,
                    temperature, max_tokens, custom_prompt, auto_respond, trigger_conditions,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    agent.account_id,
                    &agent.template_id,
                    &agent.name,
                    agent.category.to_string(),
                    agent.status.to_string(),
                    agent.provider.to_string(),
                    &agent.model,
                    agent.temperature as f64,
                    agent.max_tokens as i64,
                    &agent.custom_prompt,
                    agent.auto_respond,
                    map_json(&agent.trigger_conditions)?,
                    ts(agent.created_at),
                    ts(agent.updated_at),
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to install {} for account {}",
                    agent.template_id, agent.account_id
                )
            })?;
            agent.id = conn.last_insert_rowid();
            debug!("Inserted agent {} ({})", agent.id, agent.template_id);
            Ok(agent)
        })
        .await
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let agent = agent.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE agents SET name = ?1, status = ?2, provider = ?3, model = ?4,
                    temperature = ?5, max_tokens = ?6, custom_prompt = ?7, auto_respond = ?8,
                    trigger_conditions = ?9, updated_at = ?10
                 WHERE id = ?11",
                params![
                    &agent.name,
                    agent.status.to_string(),
                    agent.provider.to_string(),
                    &agent.model,
                    agent.temperature as f64,
                    agent.max_tokens as i64,
                    &agent.custom_prompt,
                    agent.auto_respond,
                    map_json(&agent.trigger_conditions)?,
                    ts(agent.updated_at),
                    agent.id,
                ],
            )?;
            if changed == 0 {
                bail!("agent {} not found", agent.id);
            }
            Ok(())
        })
        .await
    }

    async fn delete_agent(&self, id: AgentId) -> Result<bool> {
        self.with_conn(move |conn| {
            // assignments, turns and metrics go with it via ON DELETE CASCADE
            let deleted = conn.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn insert_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let t = turn.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO turns ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    TURN_COLUMNS
                ),
                params![
                    &t.id,
                    t.agent_id,
                    t.conversation_id,
                    &t.inbound,
                    &t.response,
                    t.provider.to_string(),
                    &t.model,
                    t.usage.prompt_tokens as i64,
                    t.usage.completion_tokens as i64,
                    t.usage.total_tokens as i64,
                    t.latency_ms as i64,
                    t.success,
                    &t.error,
                    t.helpful,
                    &t.feedback,
                    ts(t.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn turns_for_agent(&self, id: AgentId, limit: usize) -> Result<Vec<ConversationTurn>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM turns WHERE agent_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                TURN_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![id, limit as i64], row_to_turn)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn set_turn_feedback(
        &self,
        turn_id: &str,
        helpful: bool,
        feedback: Option<&str>,
    ) -> Result<Option<ConversationTurn>> {
        let turn_id = turn_id.to_owned();
        let feedback = feedback.map(str::to_owned);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE turns SET helpful = ?1, feedback = ?2 WHERE id = ?3",
                params![helpful, feedback, &turn_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM turns WHERE id = ?1", TURN_COLUMNS),
                    params![&turn_id],
                    row_to_turn,
                )
                .optional()?)
        })
        .await
    }
}

#[async_trait]
impl AssignmentRepository for SqliteStore {
    async fn replace_active(
        &self,
        assignment: Assignment,
        deactivation_reason: &str,
    ) -> Result<Vec<Assignment>> {
        let reason = deactivation_reason.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let superseded = deactivate_in(
                &tx,
                assignment.conversation_id,
                &reason,
                assignment.assigned_at,
            )?;
            insert_assignment(&tx, &assignment)?;
            tx.commit()?;
            debug!(
                "Assignment {} replaced {} active assignment(s) on conversation {}",
                assignment.id,
                superseded.len(),
                assignment.conversation_id
            );
            Ok(superseded)
        })
        .await
    }

    async fn deactivate_active(
        &self,
        conversation_id: ConversationId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        let reason = reason.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deactivated = deactivate_in(&tx, conversation_id, &reason, at)?;
            tx.commit()?;
            Ok(deactivated)
        })
        .await
    }

    async fn active_assignment(&self, conversation_id: ConversationId) -> Result<Option<Assignment>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM assignments WHERE conversation_id = ?1 AND active = 1",
                        ASSIGNMENT_COLUMNS
                    ),
                    params![conversation_id],
                    row_to_assignment,
                )
                .optional()?)
        })
        .await
    }

    async fn assignments_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Assignment>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM assignments WHERE conversation_id = ?1
                 ORDER BY assigned_at, rowid",
                ASSIGNMENT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![conversation_id], row_to_assignment)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn assignments_for_agents(
        &self,
        agent_ids: &[AgentId],
        since: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let agent_ids = agent_ids.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM assignments WHERE assigned_at >= ?1 AND agent_id IN ({})
                 ORDER BY assigned_at, rowid",
                ASSIGNMENT_COLUMNS,
                placeholders(2, agent_ids.len())
            );
            let mut values = vec![SqlValue::Text(ts(since))];
            values.extend(agent_ids.into_iter().map(SqlValue::Integer));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), row_to_assignment)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn active_for_agents(&self, agent_ids: &[AgentId]) -> Result<Vec<Assignment>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let agent_ids = agent_ids.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM assignments WHERE active = 1 AND agent_id IN ({})",
                ASSIGNMENT_COLUMNS,
                placeholders(1, agent_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(agent_ids.iter()), row_to_assignment)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn setup() -> Result<(TempDir, SqliteStore)> {
        let dir = TempDir::new()?;
        let store = SqliteStore::open(dir.path().join("triage.db"))?;
        Ok((dir, store))
    }

    fn agent(account_id: AccountId, template_id: &str, category: Category) -> Agent {
        let now = Utc::now();
        Agent {
            id: 0,
            account_id,
            template_id: template_id.to_string(),
            name: template_id.to_string(),
            category,
            status: AgentStatus::Active,
            provider: ProviderKind::Claude,
            model: Some("claude-3-5-haiku-20241022".to_string()),
            temperature: 0.7,
            max_tokens: 2000,
            custom_prompt: None,
            auto_respond: true,
            trigger_conditions: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn assignment(conversation_id: ConversationId, agent_id: AgentId, at: DateTime<Utc>) -> Assignment {
        Assignment {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            agent_id,
            confidence: 82.5,
            reason: "Strong match".to_string(),
            auto_assigned: true,
            active: true,
            assigned_at: at,
            unassigned_at: None,
            unassignment_reason: None,
            metadata: json!({"analysis": {"urgency": "high"}})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_conversation_and_messages() -> Result<()> {
        let (_dir, store) = setup()?;
        let conv = store.create_conversation(7, ConversationStatus::Pending).await?;
        for i in 0..4 {
            store
                .append_message(conv.id, MessageDirection::Incoming, &format!("m{}", i))
                .await?;
        }
        store
            .append_message(conv.id, MessageDirection::Outgoing, "reply")
            .await?;

        let recent = store.messages(conv.id, 3).await?;
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "reply"]);
        assert_eq!(recent[2].direction, MessageDirection::Outgoing);

        assert!(store.append_message(999, MessageDirection::Incoming, "x").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_status_and_attributes() -> Result<()> {
        let (_dir, store) = setup()?;
        let conv = store.create_conversation(1, ConversationStatus::Open).await?;

        store.set_status(conv.id, ConversationStatus::Resolved).await?;
        let loaded = store.conversation(conv.id).await?.unwrap();
        assert!(loaded.is_resolved());
        assert!(loaded.resolved_at.is_some());

        store.set_status(conv.id, ConversationStatus::Open).await?;
        assert!(store.conversation(conv.id).await?.unwrap().resolved_at.is_none());

        let mut attrs = Map::new();
        attrs.insert("requires_human_agent".into(), json!(true));
        store.merge_custom_attributes(conv.id, attrs).await?;
        let mut more = Map::new();
        more.insert("tier".into(), json!("gold"));
        store.merge_custom_attributes(conv.id, more).await?;

        let loaded = store.conversation(conv.id).await?.unwrap();
        assert_eq!(loaded.custom_attributes["requires_human_agent"], json!(true));
        assert_eq!(loaded.custom_attributes["tier"], json!("gold"));
        assert!(store.set_status(404, ConversationStatus::Open).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_conversations_by_status_newest_first() -> Result<()> {
        let (_dir, store) = setup()?;
        let a = store.create_conversation(1, ConversationStatus::Open).await?;
        let b = store.create_conversation(1, ConversationStatus::Pending).await?;
        store.create_conversation(1, ConversationStatus::Resolved).await?;
        store.create_conversation(2, ConversationStatus::Open).await?;

        let found = store
            .conversations_by_status(1, &[ConversationStatus::Open, ConversationStatus::Pending], 10)
            .await?;
        let ids: Vec<ConversationId> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        let limited = store
            .conversations_by_status(1, &[ConversationStatus::Open, ConversationStatus::Pending], 1)
            .await?;
        assert_eq!(limited.len(), 1);
        assert!(store.conversations_by_status(1, &[], 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_round_trip_and_unique_template() -> Result<()> {
        let (_dir, store) = setup()?;
        let mut billing = store
            .insert_agent(agent(1, "billing_support", Category::Billing))
            .await?;
        assert!(billing.id > 0);
        assert!(store
            .insert_agent(agent(1, "billing_support", Category::Billing))
            .await
            .is_err());

        billing.custom_prompt = Some("Be precise.".to_string());
        billing.status = AgentStatus::Inactive;
        store.update_agent(&billing).await?;

        let loaded = store.agent(billing.id).await?.unwrap();
        assert_eq!(loaded.custom_prompt.as_deref(), Some("Be precise."));
        assert_eq!(loaded.status, AgentStatus::Inactive);
        assert_eq!(loaded.provider, ProviderKind::Claude);
        assert_eq!(loaded.category, Category::Billing);
        assert!((loaded.temperature - 0.7).abs() < 1e-6);
        assert!(loaded.auto_respond);

        assert_eq!(store.agents_for_account(1).await?.len(), 1);
        assert!(store.agents_for_account(2).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_active_keeps_single_active() -> Result<()> {
        let (_dir, store) = setup()?;
        let conv = store.create_conversation(1, ConversationStatus::Open).await?;
        let tech = store
            .insert_agent(agent(1, "technical_support", Category::Technical))
            .await?;
        let billing = store
            .insert_agent(agent(1, "billing_support", Category::Billing))
            .await?;

        let first = assignment(conv.id, tech.id, Utc::now() - Duration::minutes(10));
        assert!(store.replace_active(first.clone(), "unused").await?.is_empty());

        let second = assignment(conv.id, billing.id, Utc::now());
        let superseded = store
            .replace_active(second.clone(), "Reassigned to billing")
            .await?;
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, first.id);
        assert_eq!(
            superseded[0].unassignment_reason.as_deref(),
            Some("Reassigned to billing")
        );

        let active = store.active_assignment(conv.id).await?.unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.metadata["analysis"]["urgency"], json!("high"));

        let history = store.assignments_for_conversation(conv.id).await?;
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[0].unassigned_at.is_some());

        // the partial unique index rejects a second active row outright
        let mut rogue = assignment(conv.id, tech.id, Utc::now());
        rogue.id = Uuid::new_v4().to_string();
        let conn = SqliteStore::lock(&store.conn);
        assert!(insert_assignment(&conn, &rogue).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_deactivate_and_agent_queries() -> Result<()> {
        let (_dir, store) = setup()?;
        let c1 = store.create_conversation(1, ConversationStatus::Open).await?;
        let c2 = store.create_conversation(1, ConversationStatus::Open).await?;
        let tech = store
            .insert_agent(agent(1, "technical_support", Category::Technical))
            .await?;

        let old = Utc::now() - Duration::days(40);
        store.replace_active(assignment(c1.id, tech.id, old), "").await?;
        store
            .replace_active(assignment(c2.id, tech.id, Utc::now()), "")
            .await?;

        assert_eq!(store.active_for_agents(&[tech.id]).await?.len(), 2);
        let recent = store
            .assignments_for_agents(&[tech.id], Utc::now() - Duration::days(30))
            .await?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].conversation_id, c2.id);

        let deactivated = store.deactivate_active(c1.id, "Unassigned", Utc::now()).await?;
        assert_eq!(deactivated.len(), 1);
        assert!(store.active_assignment(c1.id).await?.is_none());
        assert!(store.deactivate_active(c1.id, "again", Utc::now()).await?.is_empty());
        assert!(store.active_for_agents(&[]).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_turns_and_feedback() -> Result<()> {
        let (_dir, store) = setup()?;
        let conv = store.create_conversation(1, ConversationStatus::Open).await?;
        let tech = store
            .insert_agent(agent(1, "technical_support", Category::Technical))
            .await?;
        let turn = ConversationTurn {
            id: "turn-1".to_string(),
            agent_id: tech.id,
            conversation_id: conv.id,
            inbound: "app crashes".to_string(),
            response: Some("Which version?".to_string()),
            provider: ProviderKind::OpenAi,
            model: Some("gpt-4o-mini".to_string()),
            usage: TokenUsage::new(30, 12),
            latency_ms: 840,
            success: true,
            error: None,
            helpful: None,
            feedback: None,
            created_at: Utc::now(),
        };
        store.insert_turn(&turn).await?;

        let updated = store
            .set_turn_feedback("turn-1", true, Some("quick"))
            .await?
            .unwrap();
        assert_eq!(updated.helpful, Some(true));
        assert_eq!(updated.usage.total_tokens, 42);
        assert_eq!(updated.latency_ms, 840);
        assert!(store.set_turn_feedback("missing", false, None).await?.is_none());

        let turns = store.turns_for_agent(tech.id, 10).await?;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].feedback.as_deref(), Some("quick"));
        Ok(())
    }

    #[tokio::test]
    async fn test_metrics_query_and_cascade_delete() -> Result<()> {
        let (_dir, store) = setup()?;
        let conv = store.create_conversation(1, ConversationStatus::Open).await?;
        let tech = store
            .insert_agent(agent(1, "technical_support", Category::Technical))
            .await?;
        let billing = store
            .insert_agent(agent(1, "billing_support", Category::Billing))
            .await?;

        store.record(Metric::new(tech.id, MetricType::SuccessRate, 100.0)).await?;
        store.record(Metric::new(tech.id, MetricType::ResponseTime, 420.0)).await?;
        store.record(Metric::new(billing.id, MetricType::SuccessRate, 0.0)).await?;
        let mut old = Metric::new(tech.id, MetricType::SuccessRate, 0.0);
        old.date = old.date - Duration::days(90);
        store.record(old).await?;

        let today = Utc::now().date_naive();
        let query = MetricQuery::for_agent(tech.id, today - Duration::days(30), today)
            .of_type(MetricType::SuccessRate);
        let found = store.query(&query).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 100.0);

        let all_types = store
            .query(&MetricQuery::for_agent(tech.id, today, today))
            .await?;
        assert_eq!(all_types.len(), 2);

        store
            .replace_active(assignment(conv.id, tech.id, Utc::now()), "")
            .await?;
        assert!(store.delete_agent(tech.id).await?);
        assert!(!store.delete_agent(tech.id).await?);
        assert!(store.active_assignment(conv.id).await?.is_none());
        assert!(store
            .query(&MetricQuery::for_agent(tech.id, today - Duration::days(365), today))
            .await?
            .is_empty());
        assert_eq!(
            store
                .query(&MetricQuery::for_agent(billing.id, today, today))
                .await?
                .len(),
            1
        );
        Ok(())
    }

    #[test]
    fn test_config_store_upserts() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        assert_eq!(store.get("AI_OPENAI_API_KEY"), None);
        store.set("AI_OPENAI_API_KEY", "sk-one")?;
        store.set("AI_OPENAI_API_KEY", "sk-two")?;
        assert_eq!(store.get("AI_OPENAI_API_KEY").as_deref(), Some("sk-two"));
        Ok(())
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
        assert_eq!(placeholders(1, 1), "?1");
    }
}
