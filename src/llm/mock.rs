//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - `MockLlmClient`：回显最后一条 User 消息作为最终回复；遇到校验请求时给出通过的判断
//! - `ScriptedLlmClient`：按脚本依次返回预设响应 / 错误 / 延迟，并记录每次收到的请求

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmResponse};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::ToolSpec;

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or("(no input)");

        // 校验提示词要求返回含 "achieved" 的 JSON
        if last_user.contains("\"achieved\"") {
            return Ok(LlmResponse::text(
                r#"{"achieved": true, "confidence": 0.9, "issues": [], "suggestions": []}"#,
            ));
        }
        Ok(LlmResponse::text(format!("Echo from Mock: {}", last_user)))
    }
}

enum Step {
    Respond(LlmResponse),
    Fail(LlmError),
    Delay(Duration, Box<Step>),
}

/// 脚本客户端：测试中精确控制每一轮 LLM 的输出
#[derive(Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<LlmResponse>>,
    requests: Mutex<Vec<Vec<Message>>>,
    tools_seen: Mutex<Vec<Vec<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本耗尽后始终返回同一响应
    pub fn with_fallback(self, response: LlmResponse) -> Self {
        *lock(&self.fallback) = Some(response);
        self
    }

    pub fn push_response(&self, response: LlmResponse) {
        lock(&self.script).push_back(Step::Respond(response));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(LlmResponse::text(text));
    }

    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) {
        self.push_response(LlmResponse::tool_calls(calls));
    }

    pub fn push_error(&self, err: LlmError) {
        lock(&self.script).push_back(Step::Fail(err));
    }

    pub fn push_delayed(&self, delay: Duration, response: LlmResponse) {
        lock(&self.script).push_back(Step::Delay(delay, Box::new(Step::Respond(response))));
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// 每次调用收到的完整消息列表
    pub fn requests(&self) -> Vec<Vec<Message>> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<Vec<Message>> {
        lock(&self.requests).last().cloned()
    }

    /// 每次调用收到的工具名列表
    pub fn tools_seen(&self) -> Vec<Vec<String>> {
        lock(&self.tools_seen).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError> {
        lock(&self.requests).push(messages.to_vec());
        lock(&self.tools_seen).push(tools.iter().map(|t| t.name.clone()).collect());

        let next = lock(&self.script).pop_front();
        let mut step = match next {
            Some(step) => step,
            None => {
                return lock(&self.fallback)
                    .clone()
                    .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string()))
            }
        };
        loop {
            match step {
                Step::Respond(r) => return Ok(r),
                Step::Fail(e) => return Err(e),
                Step::Delay(d, inner) => {
                    tokio::time::sleep(d).await;
                    step = *inner;
                }
            }
        }
    }
}
