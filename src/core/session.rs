//! Session：一次可恢复的编排运行
//!
//! 状态只能沿 pending → running → (resuming → running)* → completed | failed 前进；
//! 进入 completed / failed 后不可再修改。所有写入都经过 `Session::apply_patch`，
//! 内存与 SQLite 两种存储共用同一套状态校验。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::StoreError;
use crate::memory::Message;
use crate::react::Verdict;

/// toolState：跨轮次的自由键值元数据
pub type ToolState = serde_json::Map<String, Value>;

/// toolState 中约定的键
pub mod keys {
    /// 关联的用户对话线程（transcript）ID
    pub const THREAD_ID: &str = "thread_id";
    /// 本次 Session 选用的 LLM 后端
    pub const LLM_PROVIDER: &str = "llm_provider";
    /// 最终回复校验未通过而重试的次数
    pub const VERIFICATION_RETRIES: &str = "verification_retries";
    /// 历史已超出上下文预算（之后每轮都会压缩）
    pub const CONTEXT_COMPACTED: &str = "context_compacted";
    /// 本次 Session 中 createAgent 创建的 persona ID 列表
    pub const CREATED_AGENTS: &str = "created_agent_ids";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Resuming,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Resuming => "resuming",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "running" => Some(SessionStatus::Running),
            "resuming" => Some(SessionStatus::Resuming),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// 合法的前进方向；任何非终态都可以直接失败
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Running) => true,
            (Running, Resuming) | (Running, Completed) => true,
            (Resuming, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 完成时写入一次的最终结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResponse {
    pub content: String,
    pub verification: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// 校验重试次数已用尽，verification 为最后一次未通过的判断
    #[serde(default)]
    pub verification_exhausted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub tool_state: ToolState,
    pub execution_count: u32,
    pub final_response: Option<FinalResponse>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 乐观并发令牌：每次成功写入 +1
    pub version: u64,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.into(),
            status: SessionStatus::Pending,
            messages: Vec::new(),
            tool_state: ToolState::new(),
            execution_count: 0,
            final_response: None,
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.tool_state
            .insert(keys::THREAD_ID.to_string(), Value::String(thread_id.into()));
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.tool_state
            .insert(keys::LLM_PROVIDER.to_string(), Value::String(provider.into()));
        self
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.tool_state.get(keys::THREAD_ID).and_then(|v| v.as_str())
    }

    pub fn provider(&self) -> Option<&str> {
        self.tool_state.get(keys::LLM_PROVIDER).and_then(|v| v.as_str())
    }

    pub fn verification_retries(&self) -> u32 {
        self.tool_state
            .get(keys::VERIFICATION_RETRIES)
            .and_then(|v| v.as_u64())
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 校验并应用补丁；成功后 updated_at 刷新、version + 1
    pub fn apply_patch(&mut self, patch: SessionPatch) -> Result<(), StoreError> {
        if self.is_finished() {
            return Err(StoreError::Finished(self.id.clone()));
        }
        if let Some(next) = patch.status {
            if next != self.status {
                if !self.status.can_transition_to(next) {
                    return Err(StoreError::InvalidTransition {
                        from: self.status,
                        to: next,
                    });
                }
                self.status = next;
            }
        }
        if let Some(messages) = patch.messages {
            self.messages = messages;
        }
        if let Some(tool_state) = patch.tool_state {
            self.tool_state = tool_state;
        }
        if let Some(count) = patch.execution_count {
            self.execution_count = count;
        }
        if let Some(final_response) = patch.final_response {
            self.final_response = Some(final_response);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(started_at) = patch.started_at {
            self.started_at.get_or_insert(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        self.updated_at = Utc::now();
        self.version += 1;
        Ok(())
    }
}

/// Session 的部分更新；None 表示不修改该字段
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub messages: Option<Vec<Message>>,
    pub tool_state: Option<ToolState>,
    pub execution_count: Option<u32>,
    pub final_response: Option<FinalResponse>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// 检查点：消息与 toolState
    pub fn snapshot(messages: Vec<Message>, tool_state: ToolState) -> Self {
        Self {
            messages: Some(messages),
            tool_state: Some(tool_state),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Resuming));
        assert!(Resuming.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Resuming.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_apply_patch_bumps_version() {
        let mut s = Session::new("u1");
        s.apply_patch(SessionPatch::status(SessionStatus::Running)).unwrap();
        assert_eq!(s.version, 1);
        assert_eq!(s.status, SessionStatus::Running);
        // 同状态补丁不算迁移
        s.apply_patch(SessionPatch::status(SessionStatus::Running)).unwrap();
        assert_eq!(s.version, 2);
    }

    #[test]
    fn test_finished_session_is_immutable() {
        let mut s = Session::new("u1");
        s.apply_patch(SessionPatch::status(SessionStatus::Running)).unwrap();
        s.apply_patch(SessionPatch::status(SessionStatus::Completed)).unwrap();
        let err = s
            .apply_patch(SessionPatch::snapshot(vec![], ToolState::new()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Finished(_)));
        assert_eq!(s.version, 2);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut s = Session::new("u1");
        let err = s
            .apply_patch(SessionPatch::status(SessionStatus::Completed))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(s.version, 0);
    }

    #[test]
    fn test_started_at_set_once() {
        let mut s = Session::new("u1");
        let first = Utc::now();
        let mut patch = SessionPatch::status(SessionStatus::Running);
        patch.started_at = Some(first);
        s.apply_patch(patch).unwrap();
        let mut later = SessionPatch::default();
        later.started_at = Some(first + chrono::Duration::seconds(10));
        s.apply_patch(later).unwrap();
        assert_eq!(s.started_at, Some(first));
    }

    #[test]
    fn test_tool_state_accessors() {
        let s = Session::new("u1").with_thread("t1").with_provider("deepseek");
        assert_eq!(s.thread_id(), Some("t1"));
        assert_eq!(s.provider(), Some("deepseek"));
        assert_eq!(s.verification_retries(), 0);
    }

    #[test]
    fn test_verification_retries_saturates() {
        let mut s = Session::new("u1");
        s.tool_state
            .insert(keys::VERIFICATION_RETRIES.into(), serde_json::json!(u64::from(u32::MAX) + 1));
        assert_eq!(s.verification_retries(), u32::MAX);
        s.tool_state
            .insert(keys::VERIFICATION_RETRIES.into(), serde_json::json!(2));
        assert_eq!(s.verification_retries(), 2);
    }
}
