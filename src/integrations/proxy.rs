//! 远程集成代理
//!
//! 把用户注册的远程工具服务器（JSON-RPC `tools/call`）当作普通工具暴露给编排循环：
//! - 发现：按用户列出端点，逐个 `tools/list`，工具名加 `mcp__<端点>__` 前缀
//! - 调用：附带 OAuth Bearer；令牌已过期则在发请求前直接拒绝
//! - 读操作缓存：按上游 Cache-Control / Expires 决定 TTL
//! - 重试：指数退避，未找到与未授权不重试，且不超过激活剩余时间
//! - 审计：每次调用（成功、失败、命中缓存）都写执行日志

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;

use crate::core::{RecoveryEngine, ToolErrorKind};
use crate::integrations::cache::{is_read_call, CachePolicy, ResponseCache};
use crate::integrations::endpoints::{
    remote_tool_name, split_remote_tool_name, EndpointRegistry, IntegrationEndpoint,
};
use crate::integrations::jsonrpc::{
    error_codes, tool_error_text, JsonRpcRequest, JsonRpcResponse, ToolsListResult,
};
use crate::store::{ExecutionLog, ExecutionRecord, ExecutionStatus};
use crate::tools::{ToolContext, ToolSpec};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("integration endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("remote tool not found: {0}")]
    ToolNotFound(String),

    #[error("unauthorized: OAuth token for integration {0} has expired")]
    TokenExpired(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    #[error("remote tool failed: {0}")]
    ToolFailed(String),
}

impl ProxyError {
    /// 映射到工具错误分类
    pub fn kind(&self) -> ToolErrorKind {
        let recovery = RecoveryEngine::new();
        match self {
            ProxyError::EndpointNotFound(_) | ProxyError::ToolNotFound(_) => ToolErrorKind::NotFound,
            ProxyError::TokenExpired(_) => ToolErrorKind::Unauthorized,
            ProxyError::Rpc { code, message } => match *code {
                error_codes::METHOD_NOT_FOUND | error_codes::RESOURCE_NOT_FOUND => {
                    ToolErrorKind::NotFound
                }
                error_codes::PERMISSION_DENIED => ToolErrorKind::Unauthorized,
                _ => recovery.classify(message),
            },
            ProxyError::Http { status, body } => match status {
                404 => ToolErrorKind::NotFound,
                401 | 403 => ToolErrorKind::Unauthorized,
                429 => ToolErrorKind::RateLimit,
                408 | 504 => ToolErrorKind::Timeout,
                _ => recovery.classify(body),
            },
            ProxyError::Network(msg) | ProxyError::ToolFailed(msg) => recovery.classify(msg),
            ProxyError::Timeout => ToolErrorKind::Timeout,
            ProxyError::InvalidResponse(_) => ToolErrorKind::Unknown,
        }
    }

    /// 只有传输层失败可以重发；服务端已处理过的调用（isError、JSON-RPC 错误）不重发
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::Network(_) | ProxyError::Timeout => true,
            ProxyError::Http { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// 首次之外的最大重试次数
    pub max_retries: u32,
    /// 第 n 次重试前等待 backoff_base × 2^(n-1)
    pub backoff_base: Duration,
    pub cache: CachePolicy,
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            cache: CachePolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct IntegrationProxy {
    endpoints: Arc<dyn EndpointRegistry>,
    execution_log: Arc<dyn ExecutionLog>,
    http: reqwest::Client,
    cache: ResponseCache,
    config: ProxyConfig,
    recovery: RecoveryEngine,
    next_id: AtomicU64,
}

/// 单次远程调用的结局（写入执行日志用）
struct CallOutcome {
    result: Result<Value, ProxyError>,
    status: ExecutionStatus,
    attempts: u32,
}

impl IntegrationProxy {
    pub fn new(
        endpoints: Arc<dyn EndpointRegistry>,
        execution_log: Arc<dyn ExecutionLog>,
        config: ProxyConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoints,
            execution_log,
            http,
            cache: ResponseCache::new(config.cache),
            config,
            recovery: RecoveryEngine::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// 该用户所有可用端点的远程工具；过期令牌与发现失败的端点被跳过
    pub async fn list_tools(&self, user_id: &str) -> Result<Vec<ToolSpec>, ProxyError> {
        let mut specs = Vec::new();
        for endpoint in self.endpoints.endpoints_for(user_id).await {
            if endpoint.token_expired() {
                tracing::warn!(user_id, endpoint = %endpoint.name, "skipping integration with expired token");
                continue;
            }
            let request = JsonRpcRequest::tools_list(self.request_id());
            let listed = self
                .rpc(&endpoint, &request)
                .await
                .and_then(|(result, _)| {
                    serde_json::from_value::<ToolsListResult>(result)
                        .map_err(|e| ProxyError::InvalidResponse(e.to_string()))
                });
            match listed {
                Ok(list) => {
                    tracing::debug!(user_id, endpoint = %endpoint.name, count = list.tools.len(), "remote tools discovered");
                    specs.extend(list.tools.into_iter().map(|t| ToolSpec {
                        name: remote_tool_name(&endpoint.name, &t.name),
                        description: t.description,
                        parameters: if t.input_schema.is_null() {
                            serde_json::json!({ "type": "object", "properties": {} })
                        } else {
                            t.input_schema
                        },
                    }));
                }
                Err(e) => {
                    tracing::warn!(user_id, endpoint = %endpoint.name, error = %e, "remote tool discovery failed");
                }
            }
        }
        Ok(specs)
    }

    /// 执行远程工具；tool_name 为带前缀的完整名字
    pub async fn execute(
        &self,
        user_id: &str,
        tool_name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ProxyError> {
        let start = Instant::now();
        let outcome = self.execute_inner(user_id, tool_name, &args, ctx).await;

        let (response, error) = match &outcome.result {
            Ok(v) => (Some(v.clone()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: ctx.session_id.clone(),
            thread_id: ctx.thread_id.clone(),
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            request: args,
            response,
            error,
            status: outcome.status,
            attempts: outcome.attempts,
            duration_ms: start.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };
        if let Err(e) = self.execution_log.record(record).await {
            tracing::error!(session_id = %ctx.session_id, tool = tool_name, error = %e, "failed to write execution log");
        }
        outcome.result
    }

    async fn execute_inner(
        &self,
        user_id: &str,
        tool_name: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> CallOutcome {
        let failed = |e: ProxyError, attempts: u32| CallOutcome {
            result: Err(e),
            status: ExecutionStatus::Error,
            attempts,
        };

        let Some((endpoint_name, remote_tool)) = split_remote_tool_name(tool_name) else {
            return failed(ProxyError::ToolNotFound(tool_name.to_string()), 0);
        };
        let endpoint = match self.resolve(user_id, endpoint_name).await {
            Ok(ep) => ep,
            Err(e) => return failed(e, 0),
        };
        if endpoint.token_expired() {
            return failed(ProxyError::TokenExpired(endpoint.name.clone()), 0);
        }

        let cacheable = is_read_call(remote_tool);
        if cacheable {
            if let Some(hit) = self.cache.get(user_id, tool_name, args) {
                tracing::debug!(tool = tool_name, "remote call served from cache");
                return CallOutcome {
                    result: Ok(hit),
                    status: ExecutionStatus::Cached,
                    attempts: 0,
                };
            }
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let request = JsonRpcRequest::tools_call(self.request_id(), remote_tool, args.clone());
            let err = match self.rpc(&endpoint, &request).await {
                Ok((result, headers)) => match tool_error_text(&result) {
                    Some(text) => ProxyError::ToolFailed(text),
                    None => {
                        if cacheable {
                            self.store_in_cache(user_id, tool_name, args, &result, &headers);
                        }
                        return CallOutcome {
                            result: Ok(result),
                            status: ExecutionStatus::Success,
                            attempts,
                        };
                    }
                },
                Err(e) => e,
            };

            let kind = err.kind();
            if attempts > self.config.max_retries || !err.is_transient() || !self.recovery.is_retryable(kind) {
                return failed(err, attempts);
            }
            let delay = self.backoff(attempts);
            if ctx.remaining().is_some_and(|left| left <= delay) {
                tracing::warn!(tool = tool_name, attempts, "not enough time left to retry remote call");
                return failed(err, attempts);
            }
            tracing::warn!(
                tool = tool_name,
                attempt = attempts,
                error_type = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "remote call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn store_in_cache(
        &self,
        user_id: &str,
        tool_name: &str,
        args: &Value,
        result: &Value,
        headers: &HeaderMap,
    ) {
        match self.cache.policy().ttl_from_headers(headers, Utc::now()) {
            Some(ttl) => self.cache.put(user_id, tool_name, args, result.clone(), ttl),
            None => tracing::debug!(tool = tool_name, "upstream forbids caching"),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    fn request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn resolve(&self, user_id: &str, name: &str) -> Result<IntegrationEndpoint, ProxyError> {
        self.endpoints
            .endpoints_for(user_id)
            .await
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ProxyError::EndpointNotFound(name.to_string()))
    }

    /// 发送一次 JSON-RPC 请求，返回 result 与响应头
    async fn rpc(
        &self,
        endpoint: &IntegrationEndpoint,
        request: &JsonRpcRequest,
    ) -> Result<(Value, HeaderMap), ProxyError> {
        let mut builder = self.http.post(&endpoint.url).json(request);
        if let Some(oauth) = &endpoint.oauth {
            builder = builder.bearer_auth(&oauth.access_token);
        }
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::InvalidResponse(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(ProxyError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = parsed
            .result
            .ok_or_else(|| ProxyError::InvalidResponse("missing result".to_string()))?;
        Ok((result, headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::endpoints::InMemoryEndpoints;
    use crate::store::InMemoryExecutionLog;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> ProxyConfig {
        ProxyConfig {
            max_retries: 3,
            backoff_base: Duration::from_millis(5),
            ..ProxyConfig::default()
        }
    }

    async fn setup(endpoint: IntegrationEndpoint) -> (IntegrationProxy, Arc<InMemoryExecutionLog>) {
        let endpoints = Arc::new(InMemoryEndpoints::new());
        endpoints.register("u1", endpoint).await;
        let log = Arc::new(InMemoryExecutionLog::new());
        (
            IntegrationProxy::new(endpoints, log.clone(), fast_config()),
            log,
        )
    }

    fn ok_result(text: &str) -> Value {
        json!({"jsonrpc": "2.0", "id": 1, "result": {"content": [{"type": "text", "text": text}]}})
    }

    #[tokio::test]
    async fn test_list_tools_prefixes_names() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"tools": [{"name": "list_issues", "description": "List issues",
                                      "inputSchema": {"type": "object"}}]}
            })))
            .mount(&server)
            .await;
        let (proxy, _) = setup(IntegrationEndpoint::new("github", format!("{}/rpc", server.uri())),
        )
        .await;

        let tools = proxy.list_tools("u1").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "mcp__github__list_issues");
        assert!(proxy.list_tools("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_call_is_cached_and_audited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "max-age=120")
                    .set_body_json(ok_result("42 issues")),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (proxy, log) = setup(IntegrationEndpoint::new("github", format!("{}/rpc", server.uri())).with_oauth("tok", None),
        )
        .await;
        let ctx = ToolContext::new("s1", "u1");

        let first = proxy
            .execute("u1", "mcp__github__list_issues", json!({"repo": "a/b"}), &ctx)
            .await
            .unwrap();
        let second = proxy
            .execute("u1", "mcp__github__list_issues", json!({"repo": "a/b"}), &ctx)
            .await
            .unwrap();
        assert_eq!(first, second);

        let records = log.for_session("s1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(records[1].status, ExecutionStatus::Cached);
    }

    #[tokio::test]
    async fn test_write_call_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_result("created")))
            .expect(2)
            .mount(&server)
            .await;
        let (proxy, _) = setup(IntegrationEndpoint::new("github", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");
        for _ in 0..2 {
            proxy
                .execute("u1", "mcp__github__create_issue", json!({"title": "x"}), &ctx)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_result("done")))
            .mount(&server)
            .await;
        let (proxy, log) = setup(IntegrationEndpoint::new("crm", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");

        proxy
            .execute("u1", "mcp__crm__update_contact", json!({}), &ctx)
            .await
            .unwrap();
        let records = log.for_session("s1").await.unwrap();
        assert_eq!(records[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32601, "message": "Method not found"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (proxy, log) = setup(IntegrationEndpoint::new("crm", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");

        let err = proxy
            .execute("u1", "mcp__crm__get_contact", json!({"id": 9}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::NotFound);
        let records = log.for_session("s1").await.unwrap();
        assert_eq!(records[0].status, ExecutionStatus::Error);
        assert_eq!(records[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_expired_token_rejected_before_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_result("x")))
            .expect(0)
            .mount(&server)
            .await;
        let expired = Utc::now() - chrono::Duration::minutes(5);
        let (proxy, log) = setup(IntegrationEndpoint::new("crm", server.uri()).with_oauth("tok", Some(expired)),
        )
        .await;
        let ctx = ToolContext::new("s1", "u1");

        let err = proxy
            .execute("u1", "mcp__crm__get_contact", json!({}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::Unauthorized);
        assert_eq!(log.for_session("s1").await.unwrap()[0].attempts, 0);
        assert!(proxy.list_tools("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_is_error_result_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"isError": true, "content": [{"type": "text", "text": "contact 9 not found"}]}
            })))
            .mount(&server)
            .await;
        let (proxy, _) = setup(IntegrationEndpoint::new("crm", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");

        let err = proxy
            .execute("u1", "mcp__crm__get_contact", json!({"id": 9}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ToolFailed(_)));
        assert_eq!(err.kind(), ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_failed_write_call_is_not_reissued() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"isError": true, "content": [{"type": "text", "text": "label does not exist"}]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (proxy, log) = setup(IntegrationEndpoint::new("gh", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");

        let err = proxy
            .execute("u1", "mcp__gh__create_issue", json!({"title": "x"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ToolFailed(_)));
        let records = log.for_session("s1").await.unwrap();
        assert_eq!(records[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_rpc_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32602, "message": "Invalid params"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (proxy, log) = setup(IntegrationEndpoint::new("gh", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");

        let err = proxy
            .execute("u1", "mcp__gh__update_issue", json!({}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Rpc { .. }));
        assert_eq!(log.for_session("s1").await.unwrap()[0].attempts, 1);
    }

    #[test]
    fn test_only_transport_failures_are_transient() {
        let http = |status| ProxyError::Http { status, body: String::new() };
        assert!(ProxyError::Network("reset".into()).is_transient());
        assert!(ProxyError::Timeout.is_transient());
        assert!(http(503).is_transient());
        assert!(http(429).is_transient());
        assert!(http(408).is_transient());
        assert!(!http(400).is_transient());
        assert!(!ProxyError::ToolFailed("boom".into()).is_transient());
        assert!(!ProxyError::Rpc { code: -32603, message: "internal".into() }.is_transient());
        assert!(!ProxyError::InvalidResponse("garbage".into()).is_transient());
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let server = MockServer::start().await;
        let (proxy, _) = setup(IntegrationEndpoint::new("crm", server.uri())).await;
        let ctx = ToolContext::new("s1", "u1");
        let err = proxy
            .execute("u1", "mcp__jira__get_issue", json!({}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::EndpointNotFound("jira".into()));
    }

    #[test]
    fn test_http_status_mapping() {
        let e = |status| ProxyError::Http { status, body: String::new() }.kind();
        assert_eq!(e(404), ToolErrorKind::NotFound);
        assert_eq!(e(403), ToolErrorKind::Unauthorized);
        assert_eq!(e(429), ToolErrorKind::RateLimit);
        assert_eq!(e(504), ToolErrorKind::Timeout);
        assert_eq!(e(500), ToolErrorKind::Unknown);
    }
}
