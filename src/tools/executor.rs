//! 工具执行器
//!
//! execute(call, remaining, ctx) 让工具执行与剩余预算赛跑，先结束者生效：
//! - 成功：再在剩余时间内调用 Verifier 校验结果，判断嵌入结果信封
//! - 失败：按错误文本分类（NotFound / Unauthorized / RateLimit / Timeout / Unknown）并附建议
//! - 超时：固定为 Timeout
//! 无论成败都返回 ToolResult，从不向编排循环抛错；每次调用输出结构化审计日志（JSON）。
//! `mcp__` 前缀的工具走远程集成代理，其余走本地注册表。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{RecoveryEngine, ToolErrorKind};
use crate::integrations::{IntegrationProxy, REMOTE_TOOL_PREFIX};
use crate::memory::ToolCall;
use crate::react::{ResultType, Verdict, Verifier};
use crate::tools::{ToolContext, ToolError, ToolRegistry, ToolSpec};

/// 工具调用结果信封；序列化后即 tool 消息的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolResult {
    Success {
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verification: Option<Verdict>,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    Error {
        error: String,
        #[serde(rename = "errorType")]
        error_type: ToolErrorKind,
        suggestion: String,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error { .. })
    }

    pub fn error_type(&self) -> Option<ToolErrorKind> {
        match self {
            ToolResult::Error { error_type, .. } => Some(*error_type),
            ToolResult::Success { .. } => None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            ToolResult::Success { duration_ms, .. } | ToolResult::Error { duration_ms, .. } => {
                *duration_ms
            }
        }
    }

    /// tool 消息内容
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","error":"unserializable tool result: {}"}}"#, e)
        })
    }
}

/// 工具失败：错误文本 + 可能已知的分类
struct Failure {
    message: String,
    kind: Option<ToolErrorKind>,
}

impl From<ToolError> for Failure {
    fn from(e: ToolError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    proxy: Option<Arc<IntegrationProxy>>,
    verifier: Option<Arc<Verifier>>,
    recovery: RecoveryEngine,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            proxy: None,
            verifier: None,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<IntegrationProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// 设置后，每次成功的工具调用都会校验结果
    pub fn with_verifier(mut self, verifier: Arc<Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 本地工具 ∪ 该用户的远程集成工具；远程发现失败只记录日志
    pub async fn catalog(&self, user_id: &str) -> Vec<ToolSpec> {
        let mut specs = self.registry.specs();
        if let Some(proxy) = &self.proxy {
            match proxy.list_tools(user_id).await {
                Ok(remote) => specs.extend(remote),
                Err(e) => tracing::warn!(user_id, error = %e, "remote tool discovery failed"),
            }
        }
        specs
    }

    pub async fn execute(&self, call: &ToolCall, remaining: Duration, ctx: &ToolContext) -> ToolResult {
        let start = Instant::now();
        let raced = timeout(remaining, self.dispatch(call, ctx)).await;

        let (outcome, result) = match raced {
            Ok(Ok((value, result_type))) => {
                let left = remaining.saturating_sub(start.elapsed());
                let verification = self.verify(call, &value, result_type, left).await;
                (
                    "ok",
                    ToolResult::Success {
                        result: value,
                        verification,
                        duration_ms: start.elapsed().as_millis() as u64,
                    },
                )
            }
            Ok(Err(failure)) => {
                let kind = failure
                    .kind
                    .unwrap_or_else(|| self.recovery.classify(&failure.message));
                ("error", self.error_result(failure.message, kind, start))
            }
            Err(_) => {
                let message = format!(
                    "Tool {} timed out after {}ms",
                    call.name,
                    remaining.as_millis()
                );
                ("timeout", self.error_result(message, ToolErrorKind::Timeout, start))
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "session_id": ctx.session_id,
            "tool": call.name,
            "call_id": call.id,
            "depth": ctx.depth,
            "ok": !result.is_error(),
            "outcome": outcome,
            "error_type": result.error_type().map(|k| k.as_str()),
            "duration_ms": result.duration_ms(),
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    fn error_result(&self, message: String, kind: ToolErrorKind, start: Instant) -> ToolResult {
        ToolResult::Error {
            error: message,
            error_type: kind,
            suggestion: self.recovery.suggestion(kind).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<(Value, ResultType), Failure> {
        if ctx.depth_exceeded() {
            return Err(ToolError::DepthExceeded {
                depth: ctx.depth,
                max: ctx.max_depth,
            }
            .into());
        }

        if call.name.starts_with(REMOTE_TOOL_PREFIX) {
            let proxy = self
                .proxy
                .as_ref()
                .ok_or_else(|| Failure::from(ToolError::UnknownTool(call.name.clone())))?;
            return proxy
                .execute(&ctx.user_id, &call.name, call.arguments.clone(), ctx)
                .await
                .map(|v| (v, ResultType::Validation))
                .map_err(|e| Failure {
                    kind: Some(e.kind()),
                    message: e.to_string(),
                });
        }

        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| Failure::from(ToolError::UnknownTool(call.name.clone())))?;
        let value = tool.execute(call.arguments.clone(), ctx).await?;
        Ok((value, tool.result_type()))
    }

    async fn verify(
        &self,
        call: &ToolCall,
        value: &Value,
        result_type: ResultType,
        left: Duration,
    ) -> Option<Verdict> {
        let verifier = self.verifier.as_ref()?;
        if left.is_zero() {
            return Some(Verdict::failed("no time left to verify the result"));
        }
        let goal = format!(
            "execute {} with these arguments: {}",
            call.name, call.arguments
        );
        let artifact = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        match timeout(left, verifier.verify(&artifact, &goal, result_type)).await {
            Ok(v) => Some(v),
            Err(_) => Some(Verdict::failed("verification timed out")),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
