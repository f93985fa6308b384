//! 远程集成调用审计
//!
//! 每次远程工具调用（成功、失败或命中缓存）都记一条，按 Session（及线程）索引；
//! 与编排事件日志相互独立。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Cached,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Cached => "cached",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ExecutionStatus::Success),
            "error" => Some(ExecutionStatus::Error),
            "cached" => Some(ExecutionStatus::Cached),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub session_id: String,
    pub thread_id: Option<String>,
    pub user_id: String,
    pub tool_name: String,
    pub request: Value,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    async fn for_session(&self, session_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryExecutionLog {
    records: RwLock<Vec<ExecutionRecord>>,
}

impl InMemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLog for InMemoryExecutionLog {
    async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn for_session(&self, session_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}
