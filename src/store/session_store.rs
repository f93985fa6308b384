//! Session 存储
//!
//! Session 是恢复执行的唯一依据。每次写入都以期望版本为条件（乐观并发），
//! 版本不一致返回 VersionConflict，调用方应放弃本次激活而不是覆盖别人的写入。
//! 另外维护面向用户的对话线程（transcript）：完成或失败时写入一条可见消息。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{FinalResponse, Session, SessionPatch, SessionStatus, StoreError};
use crate::memory::Role;

/// 用户可见的对话线程条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: String,
    pub thread_id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(
        thread_id: impl Into<String>,
        session_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            is_error: false,
            created_at: Utc::now(),
        }
    }

    pub fn error(mut self) -> Self {
        self.is_error = true;
        self
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    async fn load(&self, session_id: &str) -> Result<Session, StoreError>;

    /// 部分更新；仅当存储中的版本等于 expected_version 时生效，返回更新后的 Session
    async fn update(
        &self,
        session_id: &str,
        patch: SessionPatch,
        expected_version: u64,
    ) -> Result<Session, StoreError>;

    async fn append_transcript(&self, entry: TranscriptEntry) -> Result<(), StoreError>;

    async fn transcript(&self, thread_id: &str) -> Result<Vec<TranscriptEntry>, StoreError>;

    /// 检查点：消息与 toolState
    async fn save(&self, session: &Session) -> Result<Session, StoreError> {
        self.update(
            &session.id,
            SessionPatch::snapshot(session.messages.clone(), session.tool_state.clone()),
            session.version,
        )
        .await
    }

    /// 标记完成并写入最终结果，同时在对话线程中追加 assistant 回复
    async fn complete(
        &self,
        session: &Session,
        final_response: FinalResponse,
    ) -> Result<Session, StoreError> {
        let mut patch = SessionPatch::snapshot(session.messages.clone(), session.tool_state.clone())
            .with_status(SessionStatus::Completed);
        patch.completed_at = Some(Utc::now());
        patch.final_response = Some(final_response.clone());
        let updated = self.update(&session.id, patch, session.version).await?;

        if let Some(thread_id) = final_response.thread_id.as_deref() {
            let entry = TranscriptEntry::new(
                thread_id,
                &session.id,
                Role::Assistant,
                &final_response.content,
            );
            if let Err(e) = self.append_transcript(entry).await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to append transcript entry");
            }
        }
        Ok(updated)
    }

    /// 标记失败并记录错误
    async fn fail(&self, session: &Session, error: &str) -> Result<Session, StoreError> {
        let mut patch = SessionPatch::snapshot(session.messages.clone(), session.tool_state.clone())
            .with_status(SessionStatus::Failed)
            .with_error(error);
        patch.completed_at = Some(Utc::now());
        self.update(&session.id, patch, session.version).await
    }
}

/// 内存实现（测试与单进程运行）
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    transcripts: RwLock<HashMap<String, Vec<TranscriptEntry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn update(
        &self,
        session_id: &str,
        patch: SessionPatch,
        expected_version: u64,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                actual: stored.version,
            });
        }
        let mut next = stored.clone();
        next.apply_patch(patch)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn append_transcript(&self, entry: TranscriptEntry) -> Result<(), StoreError> {
        self.transcripts
            .write()
            .await
            .entry(entry.thread_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn transcript(&self, thread_id: &str) -> Result<Vec<TranscriptEntry>, StoreError> {
        Ok(self
            .transcripts
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[tokio::test]
    async fn test_update_requires_expected_version() {
        let store = InMemorySessionStore::new();
        let s = Session::new("u1");
        store.create(&s).await.unwrap();

        let updated = store
            .update(&s.id, SessionPatch::status(SessionStatus::Running), 0)
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let err = store
            .update(&s.id, SessionPatch::status(SessionStatus::Resuming), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.load(&s.id).await.unwrap().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_rejected_patch_leaves_record_untouched() {
        let store = InMemorySessionStore::new();
        let s = Session::new("u1");
        store.create(&s).await.unwrap();
        let err = store
            .update(&s.id, SessionPatch::status(SessionStatus::Completed), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.load(&s.id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_complete_writes_transcript() {
        let store = InMemorySessionStore::new();
        let s = Session::new("u1").with_thread("t1");
        store.create(&s).await.unwrap();
        let mut running = store
            .update(&s.id, SessionPatch::status(SessionStatus::Running), 0)
            .await
            .unwrap();
        running.messages.push(Message::user("What is 2+2?"));
        let done = store
            .complete(
                &running,
                FinalResponse {
                    content: "4".into(),
                    verification: None,
                    thread_id: Some("t1".into()),
                    verification_exhausted: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.messages.len(), 1);
        assert!(done.completed_at.is_some());
        let t = store.transcript("t1").await.unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].content, "4");
        assert_eq!(t[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = InMemorySessionStore::new();
        assert!(matches!(
            store.load("nope").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
