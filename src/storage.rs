//! SQLite storage layer for the relay node.
//!
//! Owns all persisted state: relay history, routing rules, the offline
//! signal buffer, and aggregated statistics.  Handles schema creation,
//! CRUD operations for all entity types, and the retention sweep.  Every
//! other component holds only transient copies of these rows.
//!
//! Multi-row state transitions (the expire sweep, retry bookkeeping) run as
//! single statements so a row can never be observed mid-transition.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    NotFound(String),
    InvalidFilter(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            StoreError::InvalidFilter(msg) => write!(f, "invalid filter: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Domain enums
// ---------------------------------------------------------------------------

/// Relay priority.  Advisory: orders rows within the buffer, never preempts
/// in-flight sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Parse a stored or user-supplied priority; anything unrecognised is
    /// treated as `normal`.
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

/// Lifecycle state of a buffered signal.  `pending` is initial; the other
/// three are terminal and a terminal row is never re-selected for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    Pending,
    Delivered,
    Expired,
    Failed,
}

impl BufferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferStatus::Pending => "pending",
            BufferStatus::Delivered => "delivered",
            BufferStatus::Expired => "expired",
            BufferStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => BufferStatus::Delivered,
            "expired" => BufferStatus::Expired,
            "failed" => BufferStatus::Failed,
            _ => BufferStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BufferStatus::Pending)
    }
}

/// `ORDER BY` fragment ranking priorities urgent-first.  Kept as SQL so the
/// schema stores the plain `priority` text column.
const PRIORITY_RANK_SQL: &str =
    "CASE priority WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One relay attempt.  Immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecordRow {
    pub id: String,
    pub signal_type: u16,
    pub source_server: String,
    pub target_servers: Vec<String>,
    pub payload: Map<String, Value>,
    pub priority: Priority,
    /// Epoch milliseconds.
    pub relayed_at: u64,
    pub success: bool,
    pub targets_reached: Vec<String>,
    pub targets_failed: Vec<String>,
    pub latency_ms: u64,
    pub error_message: Option<String>,
}

/// Operator-configured routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRuleRow {
    pub id: i64,
    pub signal_pattern: u16,
    pub source_filter: Option<String>,
    pub relay_to: Vec<String>,
    pub transform: Option<Map<String, Value>>,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: u64,
    pub updated_at: Option<u64>,
    pub match_count: i64,
}

/// Partial update for a rule; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub signal_pattern: Option<u16>,
    pub source_filter: Option<Option<String>>,
    pub relay_to: Option<Vec<String>>,
    pub transform: Option<Option<Map<String, Value>>>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
}

/// One buffered signal, sharded per target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedSignalRow {
    pub id: String,
    pub signal_type: u16,
    pub source_server: String,
    pub target_server: String,
    pub payload: Map<String, Value>,
    pub priority: Priority,
    pub buffered_at: u64,
    pub retry_count: u32,
    pub last_retry_at: Option<u64>,
    pub max_retries: u32,
    pub expires_at: Option<u64>,
    pub status: BufferStatus,
}

/// One aggregated stats bucket; the dimensional fields are the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsBucketRow {
    pub id: i64,
    /// Epoch milliseconds aligned to the hour.
    pub period_start: u64,
    pub signal_type: Option<u16>,
    pub source_server: Option<String>,
    pub target_server: Option<String>,
    pub total_relayed: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_latency_ms: Option<f64>,
    pub max_latency_ms: Option<i64>,
    pub buffered_count: i64,
}

/// Filter for buffer list/clear operations.  `ids` take precedence over the
/// other criteria when both are given.
#[derive(Debug, Clone, Default)]
pub struct BufferFilter {
    pub ids: Option<Vec<String>>,
    pub target_server: Option<String>,
    pub signal_type: Option<u16>,
    pub max_age_hours: Option<u64>,
}

impl BufferFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.target_server.is_none()
            && self.signal_type.is_none()
            && self.max_age_hours.is_none()
    }
}

/// Live counts of the buffer's four states.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BufferStateCounts {
    pub pending: i64,
    pub delivered: i64,
    pub expired: i64,
    pub failed: i64,
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS signal_relays (
                id              TEXT PRIMARY KEY,
                signal_type     INTEGER NOT NULL,
                source_server   TEXT NOT NULL,
                target_servers  TEXT NOT NULL,
                payload         TEXT NOT NULL,
                priority        TEXT NOT NULL DEFAULT 'normal',
                relayed_at      INTEGER NOT NULL,
                success         INTEGER NOT NULL DEFAULT 0,
                targets_reached TEXT NOT NULL DEFAULT '[]',
                targets_failed  TEXT NOT NULL DEFAULT '[]',
                latency_ms      INTEGER NOT NULL DEFAULT 0,
                error_message   TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_signal_relays_time
                ON signal_relays(relayed_at);
            CREATE INDEX IF NOT EXISTS idx_signal_relays_type
                ON signal_relays(signal_type, relayed_at);

            CREATE TABLE IF NOT EXISTS relay_rules (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_pattern  INTEGER NOT NULL,
                source_filter   TEXT,
                relay_to        TEXT NOT NULL,
                transform       TEXT,
                priority        INTEGER NOT NULL DEFAULT 0,
                enabled         INTEGER NOT NULL DEFAULT 1,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER,
                match_count     INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_relay_rules_pattern
                ON relay_rules(signal_pattern, enabled);

            CREATE TABLE IF NOT EXISTS signal_buffer (
                id              TEXT PRIMARY KEY,
                signal_type     INTEGER NOT NULL,
                source_server   TEXT NOT NULL,
                target_server   TEXT NOT NULL,
                payload         TEXT NOT NULL,
                priority        TEXT NOT NULL DEFAULT 'normal',
                buffered_at     INTEGER NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                last_retry_at   INTEGER,
                max_retries     INTEGER NOT NULL DEFAULT 3,
                expires_at      INTEGER,
                status          TEXT NOT NULL DEFAULT 'pending'
            );

            CREATE INDEX IF NOT EXISTS idx_signal_buffer_status
                ON signal_buffer(status, buffered_at);
            CREATE INDEX IF NOT EXISTS idx_signal_buffer_target
                ON signal_buffer(target_server, status);

            CREATE TABLE IF NOT EXISTS relay_stats (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                period_start    INTEGER NOT NULL,
                signal_type     INTEGER,
                source_server   TEXT,
                target_server   TEXT,
                total_relayed   INTEGER NOT NULL DEFAULT 0,
                success_count   INTEGER NOT NULL DEFAULT 0,
                failure_count   INTEGER NOT NULL DEFAULT 0,
                avg_latency_ms  REAL,
                max_latency_ms  INTEGER,
                buffered_count  INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_relay_stats_period
                ON relay_stats(period_start);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // JSON column helpers
    // -----------------------------------------------------------------------

    fn encode_names(names: &[String]) -> Result<String, StoreError> {
        Ok(serde_json::to_string(names)?)
    }

    fn decode_names(text: &str) -> Vec<String> {
        serde_json::from_str(text).unwrap_or_default()
    }

    fn encode_payload(payload: &Map<String, Value>) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&Value::Object(payload.clone()))?)
    }

    fn decode_payload(text: &str) -> Map<String, Value> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Relay history
    // -----------------------------------------------------------------------

    /// Insert one relay record.  Records are immutable; there is no update.
    pub fn insert_relay_record(&self, row: &RelayRecordRow) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO signal_relays
                 (id, signal_type, source_server, target_servers, payload, priority,
                  relayed_at, success, targets_reached, targets_failed, latency_ms, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.id,
                row.signal_type as i64,
                row.source_server,
                Self::encode_names(&row.target_servers)?,
                Self::encode_payload(&row.payload)?,
                row.priority.as_str(),
                row.relayed_at as i64,
                row.success,
                Self::encode_names(&row.targets_reached)?,
                Self::encode_names(&row.targets_failed)?,
                row.latency_ms as i64,
                row.error_message,
            ],
        )?;
        Ok(())
    }

    fn relay_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelayRecordRow> {
        Ok(RelayRecordRow {
            id: row.get(0)?,
            signal_type: row.get::<_, i64>(1)? as u16,
            source_server: row.get(2)?,
            target_servers: Self::decode_names(&row.get::<_, String>(3)?),
            payload: Self::decode_payload(&row.get::<_, String>(4)?),
            priority: Priority::parse(&row.get::<_, String>(5)?),
            relayed_at: row.get::<_, i64>(6)? as u64,
            success: row.get(7)?,
            targets_reached: Self::decode_names(&row.get::<_, String>(8)?),
            targets_failed: Self::decode_names(&row.get::<_, String>(9)?),
            latency_ms: row.get::<_, i64>(10)? as u64,
            error_message: row.get(11)?,
        })
    }

    /// Relay records with `relayed_at >= since`, oldest first, capped at
    /// `limit` rows.
    pub fn list_relay_records_since(
        &self,
        since_ms: u64,
        limit: usize,
    ) -> Result<Vec<RelayRecordRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, signal_type, source_server, target_servers, payload, priority,
                    relayed_at, success, targets_reached, targets_failed, latency_ms, error_message
             FROM signal_relays
             WHERE relayed_at >= ?1
             ORDER BY relayed_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since_ms as i64, limit as i64], |row| {
                Self::relay_record_from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_relay_record(&self, id: &str) -> Result<Option<RelayRecordRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, signal_type, source_server, target_servers, payload, priority,
                    relayed_at, success, targets_reached, targets_failed, latency_ms, error_message
             FROM signal_relays WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id], |row| Self::relay_record_from_row(row))
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Relay rules
    // -----------------------------------------------------------------------

    const RULE_COLUMNS: &'static str =
        "id, signal_pattern, source_filter, relay_to, transform, priority,
         enabled, created_at, updated_at, match_count";

    /// Insert a new rule and return its id.  `row.id` is ignored.
    pub fn insert_rule(&self, row: &RelayRuleRow) -> Result<i64, StoreError> {
        let transform = row
            .transform
            .as_ref()
            .map(Self::encode_payload)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO relay_rules
                 (signal_pattern, source_filter, relay_to, transform, priority,
                  enabled, created_at, updated_at, match_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0)",
            params![
                row.signal_pattern as i64,
                row.source_filter,
                Self::encode_names(&row.relay_to)?,
                transform,
                row.priority,
                row.enabled,
                row.created_at as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelayRuleRow> {
        let transform: Option<String> = row.get(4)?;
        Ok(RelayRuleRow {
            id: row.get(0)?,
            signal_pattern: row.get::<_, i64>(1)? as u16,
            source_filter: row.get(2)?,
            relay_to: Self::decode_names(&row.get::<_, String>(3)?),
            transform: transform.as_deref().map(Self::decode_payload),
            priority: row.get(5)?,
            enabled: row.get(6)?,
            created_at: row.get::<_, i64>(7)? as u64,
            updated_at: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
            match_count: row.get(9)?,
        })
    }

    /// All rules, enabled and disabled, priority descending.
    pub fn list_rules(&self) -> Result<Vec<RelayRuleRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM relay_rules ORDER BY priority DESC, id ASC",
            Self::RULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], |row| Self::rule_from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Enabled rules matching a signal pattern, priority descending.  The
    /// caller applies the source-filter regex and reports the surviving ids
    /// back through [`Store::increment_match_counts`].
    pub fn enabled_rules_for(&self, signal_pattern: u16) -> Result<Vec<RelayRuleRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM relay_rules
             WHERE signal_pattern = ?1 AND enabled = 1
             ORDER BY priority DESC, id ASC",
            Self::RULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![signal_pattern as i64], |row| {
                Self::rule_from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bump `match_count` for every listed rule in one statement.
    pub fn increment_match_counts(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE relay_rules SET match_count = match_count + 1 WHERE id IN ({placeholders})"
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Apply a partial update.  Returns whether a row was affected.
    pub fn update_rule(&self, id: i64, patch: &RulePatch, now: u64) -> Result<bool, StoreError> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(pattern) = patch.signal_pattern {
            sets.push("signal_pattern = ?");
            values.push(Box::new(pattern as i64));
        }
        if let Some(ref filter) = patch.source_filter {
            sets.push("source_filter = ?");
            values.push(Box::new(filter.clone()));
        }
        if let Some(ref relay_to) = patch.relay_to {
            sets.push("relay_to = ?");
            values.push(Box::new(Self::encode_names(relay_to)?));
        }
        if let Some(ref transform) = patch.transform {
            let encoded = transform.as_ref().map(Self::encode_payload).transpose()?;
            sets.push("transform = ?");
            values.push(Box::new(encoded));
        }
        if let Some(priority) = patch.priority {
            sets.push("priority = ?");
            values.push(Box::new(priority));
        }
        if let Some(enabled) = patch.enabled {
            sets.push("enabled = ?");
            values.push(Box::new(enabled));
        }
        if sets.is_empty() {
            return Ok(false);
        }

        sets.push("updated_at = ?");
        values.push(Box::new(now as i64));
        values.push(Box::new(id));

        let sql = format!("UPDATE relay_rules SET {} WHERE id = ?", sets.join(", "));
        let affected = self.conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(affected > 0)
    }

    pub fn delete_rule(&self, id: i64) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .execute("DELETE FROM relay_rules WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Signal buffer
    // -----------------------------------------------------------------------

    const BUFFER_COLUMNS: &'static str =
        "id, signal_type, source_server, target_server, payload, priority,
         buffered_at, retry_count, last_retry_at, max_retries, expires_at, status";

    pub fn insert_buffered(&self, row: &BufferedSignalRow) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO signal_buffer
                 (id, signal_type, source_server, target_server, payload, priority,
                  buffered_at, retry_count, last_retry_at, max_retries, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.id,
                row.signal_type as i64,
                row.source_server,
                row.target_server,
                Self::encode_payload(&row.payload)?,
                row.priority.as_str(),
                row.buffered_at as i64,
                row.retry_count,
                row.last_retry_at.map(|v| v as i64),
                row.max_retries,
                row.expires_at.map(|v| v as i64),
                row.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn buffered_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BufferedSignalRow> {
        Ok(BufferedSignalRow {
            id: row.get(0)?,
            signal_type: row.get::<_, i64>(1)? as u16,
            source_server: row.get(2)?,
            target_server: row.get(3)?,
            payload: Self::decode_payload(&row.get::<_, String>(4)?),
            priority: Priority::parse(&row.get::<_, String>(5)?),
            buffered_at: row.get::<_, i64>(6)? as u64,
            retry_count: row.get(7)?,
            last_retry_at: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
            max_retries: row.get(9)?,
            expires_at: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
            status: BufferStatus::parse(&row.get::<_, String>(11)?),
        })
    }

    pub fn get_buffered(&self, id: &str) -> Result<Option<BufferedSignalRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM signal_buffer WHERE id = ?1",
            Self::BUFFER_COLUMNS
        ))?;
        let row = stmt
            .query_row(params![id], |row| Self::buffered_from_row(row))
            .optional()?;
        Ok(row)
    }

    /// Expire every pending row past its deadline in one statement.
    /// Returns the number of rows transitioned.
    pub fn expire_pending(&self, now: u64) -> Result<usize, StoreError> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer SET status = 'expired'
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
            params![now as i64],
        )?;
        Ok(affected)
    }

    /// Ids of pending rows past their deadline; read before the sweep so the
    /// expiry events can name the rows they cover.
    pub fn list_expirable_ids(&self, now: u64) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM signal_buffer
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![now as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pending rows eligible for a retry pass: under their retry budget and
    /// not past their deadline, ordered priority desc then oldest first.
    /// The backoff interval check happens in the buffer manager.
    pub fn select_retryable(&self, now: u64) -> Result<Vec<BufferedSignalRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM signal_buffer
             WHERE status = 'pending'
               AND retry_count < max_retries
               AND (expires_at IS NULL OR expires_at >= ?1)
             ORDER BY {} DESC, buffered_at ASC",
            Self::BUFFER_COLUMNS,
            PRIORITY_RANK_SQL
        ))?;
        let rows = stmt
            .query_map(params![now as i64], |row| Self::buffered_from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pending rows with the given ids, in the same order policy as
    /// [`Store::select_retryable`].
    pub fn select_pending_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<BufferedSignalRow>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM signal_buffer
             WHERE status = 'pending' AND id IN ({placeholders})
             ORDER BY {} DESC, buffered_at ASC",
            Self::BUFFER_COLUMNS,
            PRIORITY_RANK_SQL
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Self::buffered_from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every pending row, optionally narrowed to one target.
    pub fn list_pending(&self, target: Option<&str>) -> Result<Vec<BufferedSignalRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM signal_buffer
             WHERE status = 'pending' AND (?1 IS NULL OR target_server = ?1)
             ORDER BY {} DESC, buffered_at ASC",
            Self::BUFFER_COLUMNS,
            PRIORITY_RANK_SQL
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![target], |row| Self::buffered_from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// List buffered rows matching a filter (any status).
    pub fn list_buffered(
        &self,
        filter: &BufferFilter,
    ) -> Result<Vec<BufferedSignalRow>, StoreError> {
        let (clause, values) = Self::buffer_filter_clause(filter, now_ms());
        let sql = format!(
            "SELECT {} FROM signal_buffer WHERE {clause} ORDER BY {} DESC, buffered_at ASC",
            Self::BUFFER_COLUMNS,
            PRIORITY_RANK_SQL
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                |row| Self::buffered_from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn buffer_filter_clause(
        filter: &BufferFilter,
        now: u64,
    ) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        // ids take precedence over the remaining filters.
        if let Some(ref ids) = filter.ids {
            if ids.is_empty() {
                return ("0".to_string(), values);
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            for id in ids {
                values.push(Box::new(id.clone()));
            }
            return (format!("id IN ({placeholders})"), values);
        }

        let mut clauses: Vec<String> = Vec::new();
        if let Some(ref target) = filter.target_server {
            clauses.push("target_server = ?".to_string());
            values.push(Box::new(target.clone()));
        }
        if let Some(signal_type) = filter.signal_type {
            clauses.push("signal_type = ?".to_string());
            values.push(Box::new(signal_type as i64));
        }
        if let Some(hours) = filter.max_age_hours {
            let cutoff = now.saturating_sub(hours * 3_600_000);
            clauses.push("buffered_at < ?".to_string());
            values.push(Box::new(cutoff as i64));
        }
        if clauses.is_empty() {
            ("1".to_string(), values)
        } else {
            (clauses.join(" AND "), values)
        }
    }

    /// Delete matching buffered rows.  At least one filter criterion is
    /// required; an empty filter is an error rather than a full wipe.
    pub fn clear_buffered(&self, filter: &BufferFilter) -> Result<usize, StoreError> {
        if filter.is_empty() {
            return Err(StoreError::InvalidFilter(
                "clear requires ids, target_server, signal_type, or max_age_hours".to_string(),
            ));
        }
        let (clause, values) = Self::buffer_filter_clause(filter, now_ms());
        let sql = format!("DELETE FROM signal_buffer WHERE {clause}");
        let affected = self.conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(affected)
    }

    /// Mark a pending row delivered.  Returns false when the row was already
    /// terminal (or missing), making the transition idempotent.
    pub fn mark_buffer_delivered(&self, id: &str) -> Result<bool, StoreError> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer SET status = 'delivered'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Mark a pending row failed (used by flush).  Returns false when the row
    /// was already terminal.
    pub fn mark_buffer_failed(&self, id: &str) -> Result<bool, StoreError> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer SET status = 'failed'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Record a failed retry attempt: bump `retry_count`, stamp
    /// `last_retry_at`, and transition to `failed` when the budget is
    /// exhausted — all in one statement so the row is never observable with
    /// `retry_count > max_retries`.  Returns the resulting status, or `None`
    /// if the row was already terminal.
    pub fn record_retry_failure(
        &self,
        id: &str,
        now: u64,
    ) -> Result<Option<BufferStatus>, StoreError> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer
             SET retry_count = retry_count + 1,
                 last_retry_at = ?1,
                 status = CASE WHEN retry_count + 1 >= max_retries
                               THEN 'failed' ELSE 'pending' END
             WHERE id = ?2 AND status = 'pending'",
            params![now as i64, id],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        let status: String = self.conn.query_row(
            "SELECT status FROM signal_buffer WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(BufferStatus::parse(&status)))
    }

    pub fn pending_count(&self) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM signal_buffer WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop the oldest pending row, returning its id.  Used when the buffer
    /// reaches its configured bound.
    pub fn evict_oldest_pending(&self) -> Result<Option<String>, StoreError> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM signal_buffer WHERE status = 'pending'
                 ORDER BY buffered_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(ref id) = id {
            self.conn
                .execute("DELETE FROM signal_buffer WHERE id = ?1", params![id])?;
        }
        Ok(id)
    }

    pub fn buffer_state_counts(&self) -> Result<BufferStateCounts, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM signal_buffer GROUP BY status")?;
        let mut counts = BufferStateCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match BufferStatus::parse(&status) {
                BufferStatus::Pending => counts.pending = count,
                BufferStatus::Delivered => counts.delivered = count,
                BufferStatus::Expired => counts.expired = count,
                BufferStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Buffer rows created inside `[start, end)` counted per
    /// `(signal_type, source_server, target_server)`.  Feeds the rollup's
    /// `buffered_count` column.
    pub fn buffered_counts_between(
        &self,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<(u16, String, String, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT signal_type, source_server, target_server, COUNT(*)
             FROM signal_buffer
             WHERE buffered_at >= ?1 AND buffered_at < ?2
             GROUP BY signal_type, source_server, target_server",
        )?;
        let rows = stmt
            .query_map(params![start_ms as i64, end_ms as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u16,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Stats buckets
    // -----------------------------------------------------------------------

    /// Replace the buckets for one rollup period in a single transaction, so
    /// a repeated rollup for the same period cannot double-count.
    pub fn replace_stats_buckets(
        &mut self,
        period_start: u64,
        buckets: &[StatsBucketRow],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM relay_stats WHERE period_start = ?1",
            params![period_start as i64],
        )?;
        for bucket in buckets {
            tx.execute(
                "INSERT INTO relay_stats
                     (period_start, signal_type, source_server, target_server,
                      total_relayed, success_count, failure_count,
                      avg_latency_ms, max_latency_ms, buffered_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    bucket.period_start as i64,
                    bucket.signal_type.map(|v| v as i64),
                    bucket.source_server,
                    bucket.target_server,
                    bucket.total_relayed,
                    bucket.success_count,
                    bucket.failure_count,
                    bucket.avg_latency_ms,
                    bucket.max_latency_ms,
                    bucket.buffered_count,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn bucket_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatsBucketRow> {
        Ok(StatsBucketRow {
            id: row.get(0)?,
            period_start: row.get::<_, i64>(1)? as u64,
            signal_type: row.get::<_, Option<i64>>(2)?.map(|v| v as u16),
            source_server: row.get(3)?,
            target_server: row.get(4)?,
            total_relayed: row.get(5)?,
            success_count: row.get(6)?,
            failure_count: row.get(7)?,
            avg_latency_ms: row.get(8)?,
            max_latency_ms: row.get(9)?,
            buffered_count: row.get(10)?,
        })
    }

    /// Buckets with `period_start` in `[since, until]`.
    pub fn list_stats_buckets(
        &self,
        since_ms: u64,
        until_ms: u64,
    ) -> Result<Vec<StatsBucketRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, period_start, signal_type, source_server, target_server,
                    total_relayed, success_count, failure_count,
                    avg_latency_ms, max_latency_ms, buffered_count
             FROM relay_stats
             WHERE period_start >= ?1 AND period_start <= ?2
             ORDER BY period_start ASC",
        )?;
        let rows = stmt
            .query_map(params![since_ms as i64, until_ms as i64], |row| {
                Self::bucket_from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Remove history, stats, and terminal buffer rows older than the cutoff.
    /// Returns `(relays, stats, buffer)` deletion counts.
    pub fn prune_before(&self, cutoff_ms: u64) -> Result<(usize, usize, usize), StoreError> {
        let relays = self.conn.execute(
            "DELETE FROM signal_relays WHERE relayed_at < ?1",
            params![cutoff_ms as i64],
        )?;
        let stats = self.conn.execute(
            "DELETE FROM relay_stats WHERE period_start < ?1",
            params![cutoff_ms as i64],
        )?;
        let buffer = self.conn.execute(
            "DELETE FROM signal_buffer WHERE status != 'pending' AND buffered_at < ?1",
            params![cutoff_ms as i64],
        )?;
        Ok((relays, stats, buffer))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("x".to_string(), json!(1));
        map
    }

    fn sample_record(id: &str, relayed_at: u64) -> RelayRecordRow {
        RelayRecordRow {
            id: id.to_string(),
            signal_type: 0x50,
            source_server: "alpha".to_string(),
            target_servers: vec!["beta".to_string(), "gamma".to_string()],
            payload: sample_payload(),
            priority: Priority::Normal,
            relayed_at,
            success: true,
            targets_reached: vec!["beta".to_string()],
            targets_failed: vec!["gamma".to_string()],
            latency_ms: 12,
            error_message: None,
        }
    }

    fn sample_buffered(id: &str, target: &str, buffered_at: u64) -> BufferedSignalRow {
        BufferedSignalRow {
            id: id.to_string(),
            signal_type: 0x50,
            source_server: "alpha".to_string(),
            target_server: target.to_string(),
            payload: sample_payload(),
            priority: Priority::Normal,
            buffered_at,
            retry_count: 0,
            last_retry_at: None,
            max_retries: 3,
            expires_at: Some(buffered_at + 86_400_000),
            status: BufferStatus::Pending,
        }
    }

    #[test]
    fn relay_record_round_trips() {
        let store = Store::open_in_memory().expect("store");
        let record = sample_record("r1", 1_000);
        store.insert_relay_record(&record).expect("insert");

        let loaded = store.get_relay_record("r1").expect("get").expect("row");
        assert_eq!(loaded.signal_type, 0x50);
        assert_eq!(loaded.target_servers, record.target_servers);
        assert_eq!(loaded.targets_reached, vec!["beta".to_string()]);
        assert_eq!(loaded.payload.get("x"), Some(&json!(1)));
        assert!(loaded.success);
    }

    #[test]
    fn list_since_respects_cap_and_order() {
        let store = Store::open_in_memory().expect("store");
        for i in 0..5u64 {
            store
                .insert_relay_record(&sample_record(&format!("r{i}"), 1_000 + i))
                .expect("insert");
        }
        let rows = store.list_relay_records_since(1_001, 3).expect("list");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, "r1");
        assert_eq!(rows[2].id, "r3");
    }

    #[test]
    fn rule_crud_and_match_counts() {
        let store = Store::open_in_memory().expect("store");
        let rule = RelayRuleRow {
            id: 0,
            signal_pattern: 0x50,
            source_filter: Some("^alpha$".to_string()),
            relay_to: vec!["gamma".to_string()],
            transform: None,
            priority: 5,
            enabled: true,
            created_at: 1_000,
            updated_at: None,
            match_count: 0,
        };
        let id = store.insert_rule(&rule).expect("insert");
        assert!(id > 0);

        let listed = store.list_rules().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].relay_to, vec!["gamma".to_string()]);

        store.increment_match_counts(&[id]).expect("bump");
        store.increment_match_counts(&[id]).expect("bump");
        assert_eq!(store.list_rules().expect("list")[0].match_count, 2);

        let patch = RulePatch {
            enabled: Some(false),
            priority: Some(9),
            ..RulePatch::default()
        };
        assert!(store.update_rule(id, &patch, 2_000).expect("update"));
        let updated = &store.list_rules().expect("list")[0];
        assert!(!updated.enabled);
        assert_eq!(updated.priority, 9);
        assert_eq!(updated.updated_at, Some(2_000));

        assert!(store.enabled_rules_for(0x50).expect("enabled").is_empty());
        assert!(store.delete_rule(id).expect("delete"));
        assert!(!store.delete_rule(id).expect("delete twice"));
    }

    #[test]
    fn expire_sweep_only_touches_pending_past_deadline() {
        let store = Store::open_in_memory().expect("store");
        let mut expiring = sample_buffered("b1", "beta", 1_000);
        expiring.expires_at = Some(5_000);
        store.insert_buffered(&expiring).expect("insert");

        let mut fresh = sample_buffered("b2", "beta", 1_000);
        fresh.expires_at = Some(50_000);
        store.insert_buffered(&fresh).expect("insert");

        let mut delivered = sample_buffered("b3", "beta", 1_000);
        delivered.expires_at = Some(5_000);
        delivered.status = BufferStatus::Delivered;
        store.insert_buffered(&delivered).expect("insert");

        assert_eq!(
            store.list_expirable_ids(10_000).expect("ids"),
            vec!["b1".to_string()]
        );
        let expired = store.expire_pending(10_000).expect("sweep");
        assert_eq!(expired, 1);
        assert_eq!(
            store.get_buffered("b1").expect("get").expect("row").status,
            BufferStatus::Expired
        );
        assert_eq!(
            store.get_buffered("b2").expect("get").expect("row").status,
            BufferStatus::Pending
        );
        assert_eq!(
            store.get_buffered("b3").expect("get").expect("row").status,
            BufferStatus::Delivered
        );
    }

    #[test]
    fn retry_failure_is_atomic_and_bounded() {
        let store = Store::open_in_memory().expect("store");
        let mut row = sample_buffered("b1", "beta", 1_000);
        row.max_retries = 2;
        store.insert_buffered(&row).expect("insert");

        assert_eq!(
            store.record_retry_failure("b1", 2_000).expect("retry"),
            Some(BufferStatus::Pending)
        );
        assert_eq!(
            store.record_retry_failure("b1", 3_000).expect("retry"),
            Some(BufferStatus::Failed)
        );
        // Terminal rows are untouched by further attempts.
        assert_eq!(
            store.record_retry_failure("b1", 4_000).expect("retry"),
            None
        );

        let final_row = store.get_buffered("b1").expect("get").expect("row");
        assert_eq!(final_row.retry_count, 2);
        assert!(final_row.retry_count <= final_row.max_retries);
        assert_eq!(final_row.last_retry_at, Some(3_000));
    }

    #[test]
    fn terminal_status_never_regresses() {
        let store = Store::open_in_memory().expect("store");
        store
            .insert_buffered(&sample_buffered("b1", "beta", 1_000))
            .expect("insert");

        assert!(store.mark_buffer_delivered("b1").expect("deliver"));
        assert!(!store.mark_buffer_delivered("b1").expect("again"));
        assert!(!store.mark_buffer_failed("b1").expect("fail"));
        assert_eq!(
            store.get_buffered("b1").expect("get").expect("row").status,
            BufferStatus::Delivered
        );
    }

    #[test]
    fn retryable_selection_orders_priority_then_age() {
        let store = Store::open_in_memory().expect("store");
        let mut urgent = sample_buffered("b-urgent", "beta", 3_000);
        urgent.priority = Priority::Urgent;
        let mut low = sample_buffered("b-low", "beta", 1_000);
        low.priority = Priority::Low;
        let older_normal = sample_buffered("b-old", "beta", 2_000);
        let newer_normal = sample_buffered("b-new", "beta", 4_000);

        for row in [&urgent, &low, &older_normal, &newer_normal] {
            store.insert_buffered(row).expect("insert");
        }

        let selected = store.select_retryable(5_000).expect("select");
        let ids: Vec<&str> = selected.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b-urgent", "b-old", "b-new", "b-low"]);
    }

    #[test]
    fn clear_requires_a_filter_and_ids_take_precedence() {
        let store = Store::open_in_memory().expect("store");
        store
            .insert_buffered(&sample_buffered("b1", "beta", 1_000))
            .expect("insert");
        store
            .insert_buffered(&sample_buffered("b2", "gamma", 1_000))
            .expect("insert");

        assert!(store.clear_buffered(&BufferFilter::default()).is_err());

        let filter = BufferFilter {
            ids: Some(vec!["b1".to_string()]),
            target_server: Some("gamma".to_string()),
            ..BufferFilter::default()
        };
        // ids win over the target filter: only b1 goes.
        assert_eq!(store.clear_buffered(&filter).expect("clear"), 1);
        assert!(store.get_buffered("b1").expect("get").is_none());
        assert!(store.get_buffered("b2").expect("get").is_some());
    }

    #[test]
    fn buffer_state_counts_cover_all_states() {
        let store = Store::open_in_memory().expect("store");
        store
            .insert_buffered(&sample_buffered("b1", "beta", 1_000))
            .expect("insert");
        let mut failed = sample_buffered("b2", "beta", 1_000);
        failed.status = BufferStatus::Failed;
        store.insert_buffered(&failed).expect("insert");

        let counts = store.buffer_state_counts().expect("counts");
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.delivered, 0);
        assert_eq!(counts.expired, 0);
    }

    #[test]
    fn stats_bucket_replacement_is_idempotent() {
        let mut store = Store::open_in_memory().expect("store");
        let bucket = StatsBucketRow {
            id: 0,
            period_start: 3_600_000,
            signal_type: Some(0x50),
            source_server: Some("alpha".to_string()),
            target_server: Some("beta".to_string()),
            total_relayed: 3,
            success_count: 2,
            failure_count: 1,
            avg_latency_ms: Some(11.5),
            max_latency_ms: Some(20),
            buffered_count: 0,
        };
        store
            .replace_stats_buckets(3_600_000, &[bucket.clone()])
            .expect("write");
        store
            .replace_stats_buckets(3_600_000, &[bucket])
            .expect("rewrite");

        let buckets = store.list_stats_buckets(0, 10_000_000).expect("list");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total_relayed, 3);
        assert_eq!(buckets[0].avg_latency_ms, Some(11.5));
    }

    #[test]
    fn retention_prunes_history_stats_and_terminal_buffer_rows() {
        let mut store = Store::open_in_memory().expect("store");
        store
            .insert_relay_record(&sample_record("old", 1_000))
            .expect("insert");
        store
            .insert_relay_record(&sample_record("new", 9_000))
            .expect("insert");
        store
            .replace_stats_buckets(
                1_000,
                &[StatsBucketRow {
                    id: 0,
                    period_start: 1_000,
                    signal_type: None,
                    source_server: None,
                    target_server: None,
                    total_relayed: 1,
                    success_count: 1,
                    failure_count: 0,
                    avg_latency_ms: None,
                    max_latency_ms: None,
                    buffered_count: 0,
                }],
            )
            .expect("stats");
        let mut terminal = sample_buffered("b-done", "beta", 1_000);
        terminal.status = BufferStatus::Delivered;
        store.insert_buffered(&terminal).expect("insert");
        let pending_old = sample_buffered("b-pending", "beta", 1_000);
        store.insert_buffered(&pending_old).expect("insert");

        let (relays, stats, buffer) = store.prune_before(5_000).expect("prune");
        assert_eq!((relays, stats, buffer), (1, 1, 1));
        // Pending rows survive retention regardless of age.
        assert!(store.get_buffered("b-pending").expect("get").is_some());
        assert!(store.get_relay_record("new").expect("get").is_some());
    }
}
