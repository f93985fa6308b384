//! 多后端路由
//!
//! 每个请求可以通过 provider 名（Session 的 toolState 中保存）选择后端；
//! 未指定时使用默认后端。ProviderRouter 本身也实现 LlmClient（走默认后端）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{LlmClient, LlmError, LlmResponse};
use crate::memory::Message;
use crate::tools::ToolSpec;

pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn LlmClient>>,
    default: String,
}

impl ProviderRouter {
    pub fn new(default: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        let default = default.into();
        let mut providers = HashMap::new();
        providers.insert(default.clone(), client);
        Self { providers, default }
    }

    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        self.providers.insert(name.into(), client);
        self
    }

    /// 切换默认后端；名称未注册时保持不变
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.providers.contains_key(&name) {
            self.default = name;
        }
        self
    }

    pub fn default_provider(&self) -> &str {
        &self.default
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称取后端；None 表示默认后端
    pub fn client(&self, provider: Option<&str>) -> Result<Arc<dyn LlmClient>, LlmError> {
        let name = provider.unwrap_or(&self.default);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(name.to_string()))
    }

    pub async fn complete_with(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        provider: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        let client = self.client(provider)?;
        tracing::debug!(
            provider = provider.unwrap_or(&self.default),
            messages = messages.len(),
            tools = tools.len(),
            "LLM request"
        );
        client.complete(messages, tools).await
    }
}

#[async_trait]
impl LlmClient for ProviderRouter {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError> {
        self.complete_with(messages, tools, None).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.providers
            .values()
            .map(|c| c.token_usage())
            .fold((0, 0, 0), |acc, u| (acc.0 + u.0, acc.1 + u.1, acc.2 + u.2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_routes_by_provider_flag() {
        let a = Arc::new(ScriptedLlmClient::new().with_fallback(LlmResponse::text("from a")));
        let b = Arc::new(ScriptedLlmClient::new().with_fallback(LlmResponse::text("from b")));
        let router = ProviderRouter::new("openai", a.clone()).with_provider("deepseek", b.clone());

        let r = router.complete_with(&[], &[], None).await.unwrap();
        assert_eq!(r.content_text(), Some("from a"));
        let r = router
            .complete_with(&[], &[], Some("deepseek"))
            .await
            .unwrap();
        assert_eq!(r.content_text(), Some("from b"));
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let router = ProviderRouter::new("mock", Arc::new(ScriptedLlmClient::new()));
        let err = router
            .complete_with(&[], &[], Some("nope"))
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::UnknownProvider("nope".into()));
        assert_eq!(router.provider_names(), vec!["mock".to_string()]);
    }
}
