//! 工具执行上下文
//!
//! 每次激活由编排循环构造一份，显式传给每个工具与校验调用，取代进程级的「当前 agent」全局状态。
//! 嵌套调用（delegateTask）通过 `child()` 派生，深度 + 1，超过上限的调用被拒绝。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::core::ToolState;
use crate::memory::Message;
use crate::tools::ToolExecutor;

pub const DEFAULT_MAX_DEPTH: u32 = 3;

#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub user_id: String,
    pub thread_id: Option<String>,
    /// 本次请求选用的 LLM 后端
    pub provider: Option<String>,
    pub depth: u32,
    pub max_depth: u32,
    /// 激活的硬截止时间（已扣除安全余量）
    pub deadline: Option<Instant>,
    /// 与 Session.toolState 同步：工具可记录跨轮次信息
    pub tool_state: Arc<Mutex<ToolState>>,
    /// Session 的完整历史（未压缩）
    pub history: Arc<Vec<Message>>,
    executor: Option<Arc<ToolExecutor>>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            thread_id: None,
            provider: None,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            deadline: None,
            tool_state: Arc::new(Mutex::new(ToolState::new())),
            history: Arc::new(Vec::new()),
            executor: None,
        }
    }

    pub fn with_thread(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_tool_state(mut self, tool_state: ToolState) -> Self {
        self.tool_state = Arc::new(Mutex::new(tool_state));
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = Arc::new(history);
        self
    }

    pub fn with_executor(mut self, executor: Arc<ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn executor(&self) -> Option<&Arc<ToolExecutor>> {
        self.executor.as_ref()
    }

    /// 嵌套调用的上下文：共享 toolState、历史与执行器，深度 + 1
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.depth += 1;
        child
    }

    pub fn depth_exceeded(&self) -> bool {
        self.depth > self.max_depth
    }

    /// 距截止时间的剩余；未设置截止时间时为 None
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub async fn tool_state_snapshot(&self) -> ToolState {
        self.tool_state.lock().await.clone()
    }

    pub async fn record(&self, key: impl Into<String>, value: Value) {
        self.tool_state.lock().await.insert(key.into(), value);
    }

    /// 向 toolState 中的数组追加一个值
    pub async fn append(&self, key: &str, value: Value) {
        let mut state = self.tool_state.lock().await;
        match state.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            _ => {
                state.insert(key.to_string(), Value::Array(vec![value]));
            }
        }
    }
}
