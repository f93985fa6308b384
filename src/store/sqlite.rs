//! SQLite 持久化（sqlx，异步）
//!
//! 一个连接池承载全部表：sessions、transcript、orchestration_events、execution_log、
//! continuation_queue。Session 以 JSON 整体存入 data 列，version 单独成列，
//! 条件更新 `WHERE id = ? AND version = ?` 实现乐观并发。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::{
    ContinuationMessage, ContinuationQueue, Delivery, Session, SessionPatch, StoreError,
};
use crate::memory::Role;
use crate::react::{EventType, OrchestrationEvent};
use crate::store::{
    EventLog, ExecutionLog, ExecutionRecord, ExecutionStatus, SessionStore, TranscriptEntry,
};

pub struct SqliteStore {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            lease: Duration::from_secs(960),
        };
        store.init_tables().await?;
        Ok(store)
    }

    /// 队列租约时长（应大于一次激活的墙钟上限）
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transcript (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                is_error INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS orchestration_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS execution_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                thread_id TEXT,
                user_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                request TEXT NOT NULL,
                response TEXT,
                error TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS continuation_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_transcript_thread ON transcript(thread_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_session ON orchestration_events(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_exec_session ON execution_log(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_queue_visible ON continuation_queue(visible_at)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_role(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "user" => Role::User,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let data = serde_json::to_string(session)?;
        sqlx::query(
            "INSERT INTO sessions (id, user_id, status, version, data, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.status.as_str())
        .bind(session.version as i64)
        .bind(&data)
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Session, StoreError> {
        let row = sqlx::query("SELECT data FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let data: String = row.get("data");
        Ok(serde_json::from_str(&data)?)
    }

    async fn update(
        &self,
        session_id: &str,
        patch: SessionPatch,
        expected_version: u64,
    ) -> Result<Session, StoreError> {
        let mut session = self.load(session_id).await?;
        if session.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                actual: session.version,
            });
        }
        session.apply_patch(patch)?;
        let data = serde_json::to_string(&session)?;

        let result = sqlx::query(
            "UPDATE sessions SET status = ?, version = ?, data = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(session.status.as_str())
        .bind(session.version as i64)
        .bind(&data)
        .bind(session.updated_at.to_rfc3339())
        .bind(session_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // 读到写之间被另一次激活抢先
            let actual = sqlx::query("SELECT version FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|r| r.get::<i64, _>("version") as u64)
                .unwrap_or(expected_version);
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        Ok(session)
    }

    async fn append_transcript(&self, entry: TranscriptEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO transcript (id, thread_id, session_id, role, content, is_error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.thread_id)
        .bind(&entry.session_id)
        .bind(entry.role.as_str())
        .bind(&entry.content)
        .bind(entry.is_error)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transcript(&self, thread_id: &str) -> Result<Vec<TranscriptEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, thread_id, session_id, role, content, is_error, created_at
             FROM transcript WHERE thread_id = ? ORDER BY seq ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TranscriptEntry {
                id: row.get("id"),
                thread_id: row.get("thread_id"),
                session_id: row.get("session_id"),
                role: parse_role(row.get::<String, _>("role").as_str()),
                content: row.get("content"),
                is_error: row.get("is_error"),
                created_at: parse_time(row.get::<String, _>("created_at").as_str()),
            })
            .collect())
    }
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, event: OrchestrationEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO orchestration_events (session_id, type, data, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.session_id)
        .bind(event.event_type.as_str())
        .bind(serde_json::to_string(&event.data)?)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_session(&self, session_id: &str) -> Result<Vec<OrchestrationEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, type, data, created_at FROM orchestration_events
             WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let type_str: String = row.get("type");
            let Some(event_type) = EventType::parse(&type_str) else {
                tracing::warn!(session_id, event_type = %type_str, "skipping event with unknown type");
                continue;
            };
            events.push(OrchestrationEvent {
                session_id: row.get("session_id"),
                event_type,
                data: serde_json::from_str(row.get::<String, _>("data").as_str())?,
                created_at: parse_time(row.get::<String, _>("created_at").as_str()),
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl ExecutionLog for SqliteStore {
    async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let response = record
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO execution_log
                (id, session_id, thread_id, user_id, tool_name, request, response, error,
                 status, attempts, duration_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.thread_id)
        .bind(&record.user_id)
        .bind(&record.tool_name)
        .bind(serde_json::to_string(&record.request)?)
        .bind(response)
        .bind(&record.error)
        .bind(record.status.as_str())
        .bind(record.attempts as i64)
        .bind(record.duration_ms as i64)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_session(&self, session_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, thread_id, user_id, tool_name, request, response, error,
                    status, attempts, duration_ms, created_at
             FROM execution_log WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let response = row
                .get::<Option<String>, _>("response")
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            records.push(ExecutionRecord {
                id: row.get("id"),
                session_id: row.get("session_id"),
                thread_id: row.get("thread_id"),
                user_id: row.get("user_id"),
                tool_name: row.get("tool_name"),
                request: serde_json::from_str(row.get::<String, _>("request").as_str())?,
                response,
                error: row.get("error"),
                status: ExecutionStatus::parse(row.get::<String, _>("status").as_str())
                    .unwrap_or(ExecutionStatus::Error),
                attempts: row.get::<i64, _>("attempts") as u32,
                duration_ms: row.get::<i64, _>("duration_ms") as u64,
                created_at: parse_time(row.get::<String, _>("created_at").as_str()),
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl ContinuationQueue for SqliteStore {
    async fn enqueue(&self, message: ContinuationMessage) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO continuation_queue (payload, visible_at, attempts) VALUES (?, ?, 0)")
            .bind(serde_json::to_string(&message)?)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, StoreError> {
        // 多个 worker 竞争同一行时以 visible_at 做 CAS，输的一方重试下一行
        let mut lost_races = 0;
        loop {
            let now = now_millis();
            let Some(row) = sqlx::query(
                "SELECT id, payload, visible_at, attempts FROM continuation_queue
                 WHERE visible_at <= ? ORDER BY id ASC LIMIT 1",
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            else {
                return Ok(None);
            };

            let id: i64 = row.get("id");
            let seen_visible_at: i64 = row.get("visible_at");
            let claimed = sqlx::query(
                "UPDATE continuation_queue SET visible_at = ?, attempts = attempts + 1
                 WHERE id = ? AND visible_at = ?",
            )
            .bind(now + self.lease.as_millis() as i64)
            .bind(id)
            .bind(seen_visible_at)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 0 {
                lost_races += 1;
                if lost_races >= 5 {
                    return Ok(None);
                }
                continue;
            }

            let payload: String = row.get("payload");
            match serde_json::from_str::<ContinuationMessage>(&payload) {
                Ok(message) => {
                    return Ok(Some(Delivery {
                        receipt: id.to_string(),
                        message,
                        attempts: row.get::<i64, _>("attempts") as u32 + 1,
                    }));
                }
                Err(e) => {
                    // 无法解码的消息直接删除
                    tracing::error!(queue_id = id, error = %e, payload = %payload, "dropping undecodable continuation");
                    sqlx::query("DELETE FROM continuation_queue WHERE id = ?")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), StoreError> {
        let id: i64 = receipt
            .parse()
            .map_err(|_| StoreError::Queue(format!("invalid receipt: {}", receipt)))?;
        sqlx::query("DELETE FROM continuation_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay: Duration) -> Result<(), StoreError> {
        let id: i64 = receipt
            .parse()
            .map_err(|_| StoreError::Queue(format!("invalid receipt: {}", receipt)))?;
        sqlx::query("UPDATE continuation_queue SET visible_at = ? WHERE id = ?")
            .bind(now_millis() + delay.as_millis() as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM continuation_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }
}
