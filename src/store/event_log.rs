//! 编排事件日志：只追加

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::StoreError;
use crate::react::OrchestrationEvent;

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: OrchestrationEvent) -> Result<(), StoreError>;

    /// 按写入顺序返回某个 Session 的全部事件
    async fn for_session(&self, session_id: &str) -> Result<Vec<OrchestrationEvent>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<OrchestrationEvent>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: OrchestrationEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn for_session(&self, session_id: &str) -> Result<Vec<OrchestrationEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }
}
