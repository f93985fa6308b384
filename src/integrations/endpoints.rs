//! 用户注册的远程集成端点
//!
//! 每个端点暴露一组远程工具，在 LLM 目录中以 `mcp__<端点名>__<工具名>` 出现。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const REMOTE_TOOL_PREFIX: &str = "mcp__";
const NAME_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEndpoint {
    pub id: String,
    /// 工具名前缀中使用，不能包含 `__`
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub oauth: Option<OAuthCredentials>,
}

impl IntegrationEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: format!("ep_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            url: url.into(),
            oauth: None,
        }
    }

    pub fn with_oauth(mut self, access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.oauth = Some(OAuthCredentials {
            access_token: access_token.into(),
            expires_at,
        });
        self
    }

    pub fn token_expired(&self) -> bool {
        self.oauth
            .as_ref()
            .is_some_and(|o| o.is_expired(Utc::now()))
    }
}

/// 远程工具在目录中的名字
pub fn remote_tool_name(endpoint: &str, tool: &str) -> String {
    format!("{}{}{}{}", REMOTE_TOOL_PREFIX, endpoint, NAME_SEPARATOR, tool)
}

/// `mcp__github__list_issues` → ("github", "list_issues")
pub fn split_remote_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(REMOTE_TOOL_PREFIX)?;
    let (endpoint, tool) = rest.split_once(NAME_SEPARATOR)?;
    if endpoint.is_empty() || tool.is_empty() {
        return None;
    }
    Some((endpoint, tool))
}

/// 端点解析：按用户查询其已注册的集成
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    async fn endpoints_for(&self, user_id: &str) -> Vec<IntegrationEndpoint>;
}

#[derive(Default)]
pub struct InMemoryEndpoints {
    by_user: RwLock<HashMap<String, Vec<IntegrationEndpoint>>>,
}

impl InMemoryEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册端点；同名端点被替换
    pub async fn register(&self, user_id: &str, endpoint: IntegrationEndpoint) {
        let mut guard = self.by_user.write().await;
        let list = guard.entry(user_id.to_string()).or_default();
        list.retain(|e| e.name != endpoint.name);
        list.push(endpoint);
    }

    pub async fn remove(&self, user_id: &str, name: &str) {
        if let Some(list) = self.by_user.write().await.get_mut(user_id) {
            list.retain(|e| e.name != name);
        }
    }
}

#[async_trait]
impl EndpointRegistry for InMemoryEndpoints {
    async fn endpoints_for(&self, user_id: &str) -> Vec<IntegrationEndpoint> {
        self.by_user
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}
