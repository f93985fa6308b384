//! 编排错误类型
//!
//! 工具级错误不在此处：它们在 ToolExecutor 内被转为 ToolResult 回喂给 LLM。
//! 这里只有会中止一次激活的错误（LLM 调用、持久化、调度）以及存储层错误。

use thiserror::Error;

use crate::core::session::SessionStatus;
use crate::llm::LlmError;

/// 存储层错误（Session / Event / 队列）
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    /// 乐观并发：写入时版本与期望不一致，说明另一次激活已修改该 Session
    #[error("version conflict on session {session_id}: expected {expected}, found {actual}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("session {0} is finished and can no longer be modified")]
    Finished(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// 一次激活中无法在本地恢复的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM returned neither content nor tool calls")]
    EmptyResponse,

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 版本冲突：应干净地放弃本次激活，而不是把 Session 标记为失败
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, AgentError::Store(StoreError::VersionConflict { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_detection() {
        let err: AgentError = StoreError::VersionConflict {
            session_id: "s".into(),
            expected: 2,
            actual: 3,
        }
        .into();
        assert!(err.is_version_conflict());
        assert!(!AgentError::EmptyResponse.is_version_conflict());
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_transition_message() {
        let err = StoreError::InvalidTransition {
            from: SessionStatus::Completed,
            to: SessionStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid status transition completed -> running");
    }
}
