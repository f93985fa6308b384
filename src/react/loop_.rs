//! 编排主循环
//!
//! 一次激活 = 从 Session 存储加载状态，循环「调用 LLM -> 顺序执行工具 -> 检查点」，
//! 直到得到经过校验的最终回复、出现致命错误，或预算将尽时挂起并投递续跑消息。
//! 激活之间不保留任何进程内状态：Session 记录是恢复执行的唯一依据。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::{
    keys, AgentError, ComputeBudget, ContinuationAction, ContinuationMessage,
    ContinuationScheduler, FinalResponse, Session, SessionPatch, SessionStatus, StoreError,
};
use crate::llm::ProviderRouter;
use crate::memory::{first_user_input, unanswered_tool_calls, Message, Role, ToolCall};
use crate::react::{ContextManager, EventType, OrchestrationEvent, ResultType, Verdict, Verifier};
use crate::store::{ActiveIndex, EventLog, SessionStore, TranscriptEntry};
use crate::tools::{ToolContext, ToolExecutor, ToolResult, DEFAULT_MAX_DEPTH};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Hive, an orchestrator that fulfils the user's request by \
calling tools when they help. Create expert personas with createAgent, consult them with gatherResponses \
or runDiscussion, delegate sub-tasks with delegateTask and use analyzeResults to synthesise findings. \
When earlier context has been compacted, use recallMemory to look it up. Tool results arrive as JSON \
envelopes; on an error, follow the suggestion or try another approach. Finish with a complete, \
direct answer to the user.";

const FINAL_GOAL: &str = "fulfill user request";

/// 循环参数（来自 [orchestrator] 配置段）
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 单次激活的总预算
    pub invocation_budget: Duration,
    pub safety_margin: Duration,
    pub verification_threshold: f64,
    pub max_verification_retries: u32,
    pub max_tool_depth: u32,
    pub system_prompt: String,
    /// 活跃索引条目的存活时间
    pub active_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            invocation_budget: Duration::from_secs(900),
            safety_margin: Duration::from_secs(30),
            verification_threshold: 0.6,
            max_verification_retries: 3,
            max_tool_depth: DEFAULT_MAX_DEPTH,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            active_ttl: Duration::from_secs(3600),
        }
    }
}

/// 一次激活的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Completed,
    Failed,
    /// 已写检查点并投递 resume
    Suspended,
    /// Session 已是终态，消息被当作重复投递忽略
    AlreadyFinished,
    /// 写入时版本冲突：另一次激活持有该 Session，本次放弃
    Aborted,
}

pub struct Orchestrator {
    llm: Arc<ProviderRouter>,
    executor: Arc<ToolExecutor>,
    verifier: Arc<Verifier>,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventLog>,
    active: Arc<dyn ActiveIndex>,
    scheduler: Arc<ContinuationScheduler>,
    context: ContextManager,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<ProviderRouter>,
        executor: Arc<ToolExecutor>,
        verifier: Arc<Verifier>,
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventLog>,
        active: Arc<dyn ActiveIndex>,
        scheduler: Arc<ContinuationScheduler>,
    ) -> Self {
        Self {
            llm,
            executor,
            verifier,
            store,
            events,
            active,
            scheduler,
            context: ContextManager::default(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context_manager(mut self, context: ContextManager) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 处理一条续跑消息，预算取自配置
    pub async fn run_activation(
        &self,
        message: &ContinuationMessage,
    ) -> Result<ActivationOutcome, AgentError> {
        let budget = ComputeBudget::new(self.config.invocation_budget, self.config.safety_margin);
        self.run_activation_with_budget(message, budget).await
    }

    /// 处理一条续跑消息。只有加载 Session 失败时返回 Err（由调用方决定是否重投）；
    /// 循环中的致命错误把 Session 标记为 failed 并返回 `Failed`。
    pub async fn run_activation_with_budget(
        &self,
        message: &ContinuationMessage,
        budget: ComputeBudget,
    ) -> Result<ActivationOutcome, AgentError> {
        let mut session = self.store.load(&message.session_id).await?;
        if session.is_finished() {
            tracing::info!(
                session_id = %session.id,
                status = %session.status,
                "session already finished, ignoring continuation"
            );
            return Ok(ActivationOutcome::AlreadyFinished);
        }

        match self.drive(&mut session, message, &budget).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_version_conflict() => {
                tracing::warn!(session_id = %session.id, error = %e, "concurrent activation detected, aborting");
                Ok(ActivationOutcome::Aborted)
            }
            Err(e) => Ok(self.fail_session(&mut session, &e).await),
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        message: &ContinuationMessage,
        budget: &ComputeBudget,
    ) -> Result<ActivationOutcome, AgentError> {
        self.begin(session, message).await?;

        let ctx = ToolContext::new(&session.id, &session.user_id)
            .with_thread(session.thread_id().map(str::to_string))
            .with_provider(session.provider().map(str::to_string))
            .with_max_depth(self.config.max_tool_depth)
            .with_deadline(budget.usable_deadline())
            .with_tool_state(session.tool_state.clone())
            .with_executor(self.executor.clone());

        loop {
            if budget.should_checkpoint() {
                return self.suspend(session, &ctx, budget).await;
            }

            // 上次检查点落在 assistant 调用与其结果之间：先补齐结果再问 LLM
            let pending = unanswered_tool_calls(&session.messages);
            if !pending.is_empty() {
                tracing::info!(session_id = %session.id, calls = pending.len(), "executing unanswered tool calls");
                if let Some(outcome) = self.run_tool_calls(session, &ctx, &pending, budget).await? {
                    return Ok(outcome);
                }
                continue;
            }

            let prepared = self.context.prepare(&session.messages);
            if prepared.compacted {
                tracing::info!(
                    session_id = %session.id,
                    tokens_before = prepared.tokens_before,
                    tokens_after = prepared.tokens_after,
                    "context compacted"
                );
                ctx.record(keys::CONTEXT_COMPACTED, Value::Bool(true)).await;
                self.emit(
                    &session.id,
                    EventType::Compaction,
                    json!({
                        "tokensBefore": prepared.tokens_before,
                        "tokensAfter": prepared.tokens_after,
                        "messagesBefore": session.messages.len(),
                        "messagesAfter": prepared.messages.len(),
                    }),
                )
                .await;
            }
            let effective = self.with_system_prompt(prepared.messages);
            let catalog = self.executor.catalog(&session.user_id).await;

            let response = match timeout(
                budget.usable(),
                self.llm.complete_with(&effective, &catalog, session.provider()),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(session_id = %session.id, "LLM call did not finish within the invocation budget");
                    return self.suspend(session, &ctx, budget).await;
                }
            };

            if !response.tool_calls.is_empty() {
                let calls = response.tool_calls.clone();
                session
                    .messages
                    .push(Message::assistant_tool_calls(response.content.clone(), calls.clone()));
                self.checkpoint(session, &ctx).await?;
                if let Some(outcome) = self.run_tool_calls(session, &ctx, &calls, budget).await? {
                    return Ok(outcome);
                }
                continue;
            }

            let Some(content) = response.content_text().map(str::to_string) else {
                return Err(AgentError::EmptyResponse);
            };

            let artifact = final_artifact(&session.messages, &content);
            let verdict = match timeout(
                budget.usable(),
                self.verifier.verify(&artifact, FINAL_GOAL, ResultType::Orchestrator),
            )
            .await
            {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(session_id = %session.id, "verification did not finish within the invocation budget");
                    return self.suspend(session, &ctx, budget).await;
                }
            };
            self.emit(
                &session.id,
                EventType::Verification,
                json!({
                    "scope": "final",
                    "achieved": verdict.achieved,
                    "confidence": verdict.confidence,
                    "issues": verdict.issues,
                }),
            )
            .await;

            let mut exhausted = false;
            if verdict.needs_retry(self.config.verification_threshold) {
                let retries = ctx
                    .tool_state_snapshot()
                    .await
                    .get(keys::VERIFICATION_RETRIES)
                    .and_then(Value::as_u64)
                    .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));
                if retries < self.config.max_verification_retries {
                    let attempt = retries + 1;
                    tracing::info!(
                        session_id = %session.id,
                        attempt,
                        confidence = verdict.confidence,
                        "final response failed verification, retrying"
                    );
                    session.messages.push(Message::assistant(&content));
                    session.messages.push(Message::system(retry_instruction(&verdict)));
                    ctx.record(keys::VERIFICATION_RETRIES, json!(attempt)).await;
                    self.emit(
                        &session.id,
                        EventType::Retry,
                        json!({ "attempt": attempt, "issues": verdict.issues }),
                    )
                    .await;
                    self.checkpoint(session, &ctx).await?;
                    continue;
                }
                tracing::warn!(
                    session_id = %session.id,
                    retries,
                    "verification retries exhausted, completing with failing verdict"
                );
                exhausted = true;
            }

            return self.complete(session, &ctx, content, verdict, exhausted).await;
        }
    }

    /// 激活开始：状态转 running、计数 + 1；首次 start 时在同一次写入中追加用户输入
    async fn begin(&self, session: &mut Session, message: &ContinuationMessage) -> Result<(), AgentError> {
        let mut messages = session.messages.clone();
        if message.action == ContinuationAction::Start && session.status == SessionStatus::Pending {
            if let Some(input) = &message.input {
                messages.push(Message::user(input));
            }
        }
        let mut tool_state = session.tool_state.clone();
        if !tool_state.contains_key(keys::THREAD_ID) {
            tool_state.insert(
                keys::THREAD_ID.to_string(),
                Value::String(format!("thr_{}", uuid::Uuid::new_v4().simple())),
            );
        }

        let mut patch = SessionPatch::snapshot(messages, tool_state).with_status(SessionStatus::Running);
        patch.execution_count = Some(session.execution_count + 1);
        patch.started_at = Some(Utc::now());
        *session = self.store.update(&session.id, patch, session.version).await?;

        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            execution_count = session.execution_count,
            messages = session.messages.len(),
            "activation started"
        );
        self.active
            .add(&session.id, &session.user_id, self.config.active_ttl)
            .await;
        self.emit(
            &session.id,
            EventType::StatusUpdate,
            json!({
                "status": SessionStatus::Running.as_str(),
                "executionCount": session.execution_count,
            }),
        )
        .await;
        Ok(())
    }

    /// 顺序执行一批工具调用，每个结果都立即写检查点；预算耗尽时挂起并返回 Some(Suspended)
    async fn run_tool_calls(
        &self,
        session: &mut Session,
        ctx: &ToolContext,
        calls: &[ToolCall],
        budget: &ComputeBudget,
    ) -> Result<Option<ActivationOutcome>, AgentError> {
        for call in calls {
            if budget.should_checkpoint() {
                return self.suspend(session, ctx, budget).await.map(Some);
            }
            self.emit(
                &session.id,
                EventType::ToolCall,
                json!({ "id": call.id, "name": call.name, "arguments": call.arguments }),
            )
            .await;

            let call_ctx = ctx.clone().with_history(session.messages.clone());
            let result = self.executor.execute(call, budget.usable(), &call_ctx).await;
            self.emit_tool_result(&session.id, call, &result).await;

            session
                .messages
                .push(Message::tool_result(&call.id, result.to_content()));
            self.checkpoint(session, ctx).await?;
        }
        Ok(None)
    }

    async fn emit_tool_result(&self, session_id: &str, call: &ToolCall, result: &ToolResult) {
        let mut data = json!({
            "id": call.id,
            "name": call.name,
            "status": if result.is_error() { "error" } else { "success" },
            "durationMs": result.duration_ms(),
        });
        if let Some(kind) = result.error_type() {
            data["errorType"] = json!(kind.as_str());
        }
        self.emit(session_id, EventType::ToolResult, data).await;

        if let ToolResult::Success {
            verification: Some(v),
            ..
        } = result
        {
            self.emit(
                session_id,
                EventType::Verification,
                json!({
                    "scope": "tool",
                    "tool": call.name,
                    "achieved": v.achieved,
                    "confidence": v.confidence,
                }),
            )
            .await;
        }
    }

    /// 持久化消息与 toolState（以工具上下文中的 toolState 为准）
    async fn checkpoint(&self, session: &mut Session, ctx: &ToolContext) -> Result<(), AgentError> {
        session.tool_state = ctx.tool_state_snapshot().await;
        *session = self.store.save(session).await?;
        Ok(())
    }

    async fn suspend(
        &self,
        session: &mut Session,
        ctx: &ToolContext,
        budget: &ComputeBudget,
    ) -> Result<ActivationOutcome, AgentError> {
        session.tool_state = ctx.tool_state_snapshot().await;
        self.emit(
            &session.id,
            EventType::Checkpoint,
            json!({
                "messages": session.messages.len(),
                "remainingMs": budget.remaining().as_millis() as u64,
            }),
        )
        .await;
        self.scheduler.suspend(session).await?;
        self.active.remove(&session.id).await;
        Ok(ActivationOutcome::Suspended)
    }

    async fn complete(
        &self,
        session: &mut Session,
        ctx: &ToolContext,
        content: String,
        verdict: Verdict,
        verification_exhausted: bool,
    ) -> Result<ActivationOutcome, AgentError> {
        session.messages.push(Message::assistant(&content));
        session.tool_state = ctx.tool_state_snapshot().await;
        let final_response = FinalResponse {
            content,
            verification: Some(verdict),
            thread_id: session.thread_id().map(str::to_string),
            verification_exhausted,
        };
        *session = self.store.complete(session, final_response).await?;
        self.active.remove(&session.id).await;

        tracing::info!(
            session_id = %session.id,
            execution_count = session.execution_count,
            messages = session.messages.len(),
            verification_exhausted,
            "session completed"
        );
        self.emit(
            &session.id,
            EventType::StatusUpdate,
            json!({ "status": SessionStatus::Completed.as_str() }),
        )
        .await;
        Ok(ActivationOutcome::Completed)
    }

    /// 致命错误：标记失败，在对话线程中写一条降级回复（带上已有的部分内容），移出活跃索引
    async fn fail_session(&self, session: &mut Session, error: &AgentError) -> ActivationOutcome {
        let message = error.to_string();
        tracing::error!(session_id = %session.id, error = %message, "activation failed");
        self.emit(&session.id, EventType::Error, json!({ "error": message })).await;

        match self.store.fail(session, &message).await {
            Ok(updated) => *session = updated,
            Err(StoreError::VersionConflict { .. }) => {
                tracing::warn!(session_id = %session.id, "session changed concurrently while failing, aborting");
                return ActivationOutcome::Aborted;
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "failed to mark session as failed");
            }
        }

        if let Some(thread_id) = session.thread_id() {
            let entry = TranscriptEntry::new(
                thread_id,
                &session.id,
                Role::Assistant,
                degraded_reply(&session.messages, &message),
            )
            .error();
            if let Err(e) = self.store.append_transcript(entry).await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to append degraded transcript entry");
            }
        }
        self.active.remove(&session.id).await;
        self.emit(
            &session.id,
            EventType::StatusUpdate,
            json!({ "status": SessionStatus::Failed.as_str() }),
        )
        .await;
        ActivationOutcome::Failed
    }

    /// 发给 LLM 的消息列表：系统提示只加在这里，不写入 Session
    fn with_system_prompt(&self, messages: Vec<Message>) -> Vec<Message> {
        let present = messages
            .first()
            .is_some_and(|m| m.role == Role::System && m.text() == self.config.system_prompt);
        if present {
            return messages;
        }
        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(Message::system(&self.config.system_prompt));
        out.extend(messages);
        out
    }

    /// 事件写入失败只记录日志
    async fn emit(&self, session_id: &str, event_type: EventType, data: Value) {
        let event = OrchestrationEvent::new(session_id, event_type, data);
        if let Err(e) = self.events.append(event).await {
            tracing::warn!(session_id, event = event_type.as_str(), error = %e, "failed to write event");
        }
    }
}

/// 最终回复的校验材料：用户输入、迄今的工具调用与回复本身
fn final_artifact(messages: &[Message], content: &str) -> String {
    let calls: Vec<Value> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|c| json!({ "name": c.name, "arguments": c.arguments }))
        .collect();
    json!({
        "userInput": first_user_input(messages).unwrap_or_default(),
        "toolCallsSoFar": calls,
        "finalResponse": content,
    })
    .to_string()
}

fn retry_instruction(verdict: &Verdict) -> String {
    let mut out = String::from(
        "Your previous answer did not pass verification. Revise it before answering again.",
    );
    if !verdict.issues.is_empty() {
        out.push_str("\nIssues:");
        for issue in &verdict.issues {
            out.push_str(&format!("\n- {}", issue));
        }
    }
    if !verdict.suggestions.is_empty() {
        out.push_str("\nSuggestions:");
        for s in &verdict.suggestions {
            out.push_str(&format!("\n- {}", s));
        }
    }
    out
}

fn degraded_reply(messages: &[Message], error: &str) -> String {
    let partial = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.text().trim())
        .find(|t| !t.is_empty());
    match partial {
        Some(p) => format!(
            "{}\n\n(This response is incomplete: processing stopped with an error: {})",
            p, error
        ),
        None => format!(
            "Sorry, something went wrong while working on your request: {}",
            error
        ),
    }
}
