//! 「正在运行」索引：带 TTL 的临时记录
//!
//! 激活开始时加入，完成或失败时尽力移除；进程崩溃留下的条目由 TTL 自然过期。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait ActiveIndex: Send + Sync {
    async fn add(&self, session_id: &str, user_id: &str, ttl: Duration);

    async fn remove(&self, session_id: &str);

    async fn is_active(&self, session_id: &str) -> bool;

    /// 某用户当前活跃的 Session
    async fn active_for_user(&self, user_id: &str) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryActiveIndex {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryActiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理过期条目，返回清理数量
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }
}

#[async_trait]
impl ActiveIndex for InMemoryActiveIndex {
    async fn add(&self, session_id: &str, user_id: &str, ttl: Duration) {
        self.entries.write().await.insert(
            session_id.to_string(),
            (user_id.to_string(), Instant::now() + ttl),
        );
    }

    async fn remove(&self, session_id: &str) {
        self.entries.write().await.remove(session_id);
    }

    async fn is_active(&self, session_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(session_id)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    async fn active_for_user(&self, user_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, (u, expires))| u == user_id && *expires > now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_and_ttl() {
        let idx = InMemoryActiveIndex::new();
        idx.add("s1", "u1", Duration::from_secs(60)).await;
        idx.add("s2", "u1", Duration::ZERO).await;
        assert!(idx.is_active("s1").await);
        assert!(!idx.is_active("s2").await);
        assert_eq!(idx.active_for_user("u1").await, vec!["s1".to_string()]);
        assert_eq!(idx.cleanup_expired().await, 1);
        idx.remove("s1").await;
        assert!(!idx.is_active("s1").await);
    }
}
