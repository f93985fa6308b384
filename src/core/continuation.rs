//! 续跑调度
//!
//! 新请求：创建 pending 的 Session 并投递 start 消息；激活预算将尽：写检查点、状态置为 resuming，
//! 并投递 resume 消息。队列至少投递一次，同一条消息可能被处理多次，
//! 由编排循环入口处的状态检查保证幂等。
//!
//! 队列按租约工作：dequeue 后消息在租约期内不可见，ack 删除，nack 或租约到期后重新可见。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::core::{AgentError, Session, SessionPatch, SessionStatus, StoreError};
use crate::react::{EventType, OrchestrationEvent};
use crate::store::{EventLog, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContinuationAction {
    Start,
    Resume,
}

/// 队列消息：`{sessionId, action, userId, input?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationMessage {
    pub session_id: String,
    pub action: ContinuationAction,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl ContinuationMessage {
    pub fn start(session: &Session, input: impl Into<String>) -> Self {
        Self {
            session_id: session.id.clone(),
            action: ContinuationAction::Start,
            user_id: session.user_id.clone(),
            input: Some(input.into()),
        }
    }

    pub fn resume(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            action: ContinuationAction::Resume,
            user_id: session.user_id.clone(),
            input: None,
        }
    }
}

/// 一次投递：receipt 用于 ack / nack
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub message: ContinuationMessage,
    /// 含本次在内的投递次数
    pub attempts: u32,
}

#[async_trait]
pub trait ContinuationQueue: Send + Sync {
    async fn enqueue(&self, message: ContinuationMessage) -> Result<(), StoreError>;

    /// 取下一条可见消息并加租约；队列为空返回 None
    async fn dequeue(&self) -> Result<Option<Delivery>, StoreError>;

    async fn ack(&self, receipt: &str) -> Result<(), StoreError>;

    /// 放回队列，delay 后重新可见
    async fn nack(&self, receipt: &str, delay: Duration) -> Result<(), StoreError>;

    /// 未 ack 的消息数（含租约中的）
    async fn pending(&self) -> Result<usize, StoreError>;

    /// 等待新消息或超时（轮询实现可直接 sleep）
    async fn wait(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

struct QueueEntry {
    id: u64,
    message: ContinuationMessage,
    visible_at: Instant,
    attempts: u32,
}

/// 内存队列
pub struct InMemoryQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    next_id: Mutex<u64>,
    lease: Duration,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(1),
            lease,
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(960))
    }
}

fn parse_receipt(receipt: &str) -> Result<u64, StoreError> {
    receipt
        .parse()
        .map_err(|_| StoreError::Queue(format!("invalid receipt: {}", receipt)))
}

#[async_trait]
impl ContinuationQueue for InMemoryQueue {
    async fn enqueue(&self, message: ContinuationMessage) -> Result<(), StoreError> {
        let id = {
            let mut next = self.next_id.lock().await;
            let id = *next;
            *next += 1;
            id
        };
        self.entries.lock().await.push_back(QueueEntry {
            id,
            message,
            visible_at: Instant::now(),
            attempts: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.visible_at <= now) else {
            return Ok(None);
        };
        entry.visible_at = now + self.lease;
        entry.attempts += 1;
        Ok(Some(Delivery {
            receipt: entry.id.to_string(),
            message: entry.message.clone(),
            attempts: entry.attempts,
        }))
    }

    async fn ack(&self, receipt: &str) -> Result<(), StoreError> {
        let id = parse_receipt(receipt)?;
        self.entries.lock().await.retain(|e| e.id != id);
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay: Duration) -> Result<(), StoreError> {
        let id = parse_receipt(receipt)?;
        if let Some(e) = self.entries.lock().await.iter_mut().find(|e| e.id == id) {
            e.visible_at = Instant::now() + delay;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pending(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().await.len())
    }

    async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

/// 续跑调度器：创建 / 挂起 Session 并投递续跑消息
pub struct ContinuationScheduler {
    store: Arc<dyn SessionStore>,
    queue: Arc<dyn ContinuationQueue>,
    events: Arc<dyn EventLog>,
}

impl ContinuationScheduler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        queue: Arc<dyn ContinuationQueue>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<dyn ContinuationQueue> {
        &self.queue
    }

    /// 新请求：创建 pending Session 并投递 start；投递失败时 Session 标记为 failed
    pub async fn start(&self, session: Session, input: &str) -> Result<Session, AgentError> {
        self.store.create(&session).await?;
        if let Err(e) = self
            .queue
            .enqueue(ContinuationMessage::start(&session, input))
            .await
        {
            let reason = format!("failed to enqueue start continuation: {}", e);
            tracing::error!(session_id = %session.id, error = %e, "start enqueue failed, marking session failed");
            if let Err(fe) = self.store.fail(&session, &reason).await {
                tracing::warn!(session_id = %session.id, error = %fe, "failed to mark unscheduled session as failed");
            }
            return Err(AgentError::Scheduling(reason));
        }
        tracing::info!(session_id = %session.id, user_id = %session.user_id, "session created, start enqueued");
        Ok(session)
    }

    /// 写检查点（消息 + toolState，状态 resuming）并投递 resume
    ///
    /// 检查点写入后立即更新 `session`，投递失败时调用方仍持有最新版本，可以据此标记失败。
    pub async fn suspend(&self, session: &mut Session) -> Result<(), AgentError> {
        let patch = SessionPatch::snapshot(session.messages.clone(), session.tool_state.clone())
            .with_status(SessionStatus::Resuming);
        *session = self.store.update(&session.id, patch, session.version).await?;

        let event = OrchestrationEvent::new(
            &session.id,
            EventType::StatusUpdate,
            serde_json::json!({ "status": SessionStatus::Resuming.as_str() }),
        );
        if let Err(e) = self.events.append(event).await {
            tracing::warn!(session_id = %session.id, error = %e, "failed to write event");
        }

        self.queue
            .enqueue(ContinuationMessage::resume(session))
            .await
            .map_err(|e| AgentError::Scheduling(format!("failed to enqueue resume continuation: {}", e)))?;
        tracing::info!(session_id = %session.id, messages = session.messages.len(), "session checkpointed, resume enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryEventLog, InMemorySessionStore};

    #[test]
    fn test_message_wire_shape() {
        let s = Session::new("u1");
        let v = serde_json::to_value(ContinuationMessage::start(&s, "hi")).unwrap();
        assert_eq!(v["action"], "start");
        assert_eq!(v["userId"], "u1");
        assert_eq!(v["input"], "hi");
        let v = serde_json::to_value(ContinuationMessage::resume(&s)).unwrap();
        assert_eq!(v["action"], "resume");
        assert!(v.get("input").is_none());
    }

    #[tokio::test]
    async fn test_lease_redelivers_unacked() {
        let q = InMemoryQueue::new(Duration::from_millis(20));
        let s = Session::new("u1");
        q.enqueue(ContinuationMessage::resume(&s)).await.unwrap();

        let d1 = q.dequeue().await.unwrap().unwrap();
        assert_eq!(d1.attempts, 1);
        assert!(q.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let d2 = q.dequeue().await.unwrap().unwrap();
        assert_eq!(d2.attempts, 2);
        assert_eq!(d2.message, d1.message);

        q.ack(&d2.receipt).await.unwrap();
        assert_eq!(q.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_delays_visibility() {
        let q = InMemoryQueue::default();
        let s = Session::new("u1");
        q.enqueue(ContinuationMessage::resume(&s)).await.unwrap();
        let d = q.dequeue().await.unwrap().unwrap();
        q.nack(&d.receipt, Duration::ZERO).await.unwrap();
        assert!(q.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_suspend() {
        let store = Arc::new(InMemorySessionStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let scheduler =
            ContinuationScheduler::new(store.clone(), queue.clone(), Arc::new(InMemoryEventLog::new()));

        let session = scheduler.start(Session::new("u1"), "hello").await.unwrap();
        assert_eq!(store.load(&session.id).await.unwrap().status, SessionStatus::Pending);
        let d = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(d.message.action, ContinuationAction::Start);
        queue.ack(&d.receipt).await.unwrap();

        let running = store
            .update(&session.id, SessionPatch::status(SessionStatus::Running), 0)
            .await
            .unwrap();
        let mut suspended = running;
        scheduler.suspend(&mut suspended).await.unwrap();
        assert_eq!(suspended.status, SessionStatus::Resuming);
        assert_eq!(store.load(&session.id).await.unwrap(), suspended);
        let d = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(d.message.action, ContinuationAction::Resume);
        assert_eq!(d.message.session_id, session.id);
    }

    /// 拒绝一切投递的队列
    struct ClosedQueue;

    #[async_trait]
    impl ContinuationQueue for ClosedQueue {
        async fn enqueue(&self, _message: ContinuationMessage) -> Result<(), StoreError> {
            Err(StoreError::Database("queue unavailable".into()))
        }
        async fn dequeue(&self) -> Result<Option<Delivery>, StoreError> {
            Ok(None)
        }
        async fn ack(&self, _receipt: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn nack(&self, _receipt: &str, _delay: Duration) -> Result<(), StoreError> {
            Ok(())
        }
        async fn pending(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_start_enqueue_failure_marks_session_failed() {
        let store = Arc::new(InMemorySessionStore::new());
        let scheduler =
            ContinuationScheduler::new(store.clone(), Arc::new(ClosedQueue), Arc::new(InMemoryEventLog::new()));

        let session = Session::new("u1");
        let err = scheduler.start(session.clone(), "hello").await.unwrap_err();
        assert!(matches!(err, AgentError::Scheduling(_)));

        let stored = store.load(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(stored.error.unwrap().contains("queue unavailable"));
    }

    #[tokio::test]
    async fn test_suspend_enqueue_failure_keeps_checkpoint_version() {
        let store = Arc::new(InMemorySessionStore::new());
        let scheduler =
            ContinuationScheduler::new(store.clone(), Arc::new(ClosedQueue), Arc::new(InMemoryEventLog::new()));

        let session = Session::new("u1");
        store.create(&session).await.unwrap();
        let mut running = store
            .update(&session.id, SessionPatch::status(SessionStatus::Running), 0)
            .await
            .unwrap();
        assert!(scheduler.suspend(&mut running).await.is_err());

        // 调用方持有检查点之后的版本，可以继续写入
        let stored = store.load(&session.id).await.unwrap();
        assert_eq!(running.version, stored.version);
        assert_eq!(running.status, SessionStatus::Resuming);
        let failed = store.fail(&running, "resume enqueue failed").await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
    }
}
