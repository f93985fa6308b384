//! delegateTask：让某个 persona 独立完成一个子任务
//!
//! persona 在自己的消息列表里跑一个短的工具循环（只能用本地工具），深度 + 1；
//! 嵌套委托超过深度上限时被拒绝，保证递归有界。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm::ProviderRouter;
use crate::memory::Message;
use crate::tools::agents::PersonaStore;
use crate::tools::{ToolContext, ToolError, TypedTool};

const DEFAULT_MAX_TURNS: usize = 4;
/// 没有激活截止时间时（单独调用工具）每步的上限
const STEP_TIMEOUT: Duration = Duration::from_secs(60);

const DELEGATE_SUFFIX: &str = "\n\nYou have been delegated a task. Use the available tools when they help, \
then finish with a concise, self-contained answer.";

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegateTaskInput {
    pub agent_id: String,
    pub task: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateTaskOutput {
    pub agent_id: String,
    pub name: String,
    pub result: String,
    pub turns: usize,
    pub tool_calls: usize,
}

pub struct DelegateTaskTool {
    llm: Arc<ProviderRouter>,
    personas: Arc<PersonaStore>,
    max_turns: usize,
}

impl DelegateTaskTool {
    pub fn new(llm: Arc<ProviderRouter>, personas: Arc<PersonaStore>) -> Self {
        Self {
            llm,
            personas,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }
}

#[async_trait]
impl TypedTool for DelegateTaskTool {
    type Input = DelegateTaskInput;
    type Output = DelegateTaskOutput;

    const NAME: &'static str = "delegateTask";

    fn description(&self) -> &str {
        "Delegate a self-contained sub-task to a persona created with createAgent; the persona may use tools on its own and returns its answer. Args: agentId, task."
    }

    async fn run(&self, input: DelegateTaskInput, ctx: &ToolContext) -> Result<DelegateTaskOutput, ToolError> {
        let persona = self
            .personas
            .get(&ctx.user_id, &input.agent_id)
            .await
            .ok_or_else(|| ToolError::failed(format!("Agent {} not found", input.agent_id)))?;
        let executor = ctx
            .executor()
            .cloned()
            .ok_or_else(|| ToolError::failed("delegation is unavailable in this context"))?;

        let child = ctx.child();
        if child.depth_exceeded() {
            return Err(ToolError::DepthExceeded {
                depth: child.depth,
                max: child.max_depth,
            });
        }

        let specs = executor.registry().specs();
        let mut messages = vec![
            Message::system(format!("{}{}", persona.system_prompt, DELEGATE_SUFFIX)),
            Message::user(&input.task),
        ];
        let mut tool_calls = 0usize;

        for turn in 1..=self.max_turns {
            let response = self
                .llm
                .complete_with(&messages, &specs, ctx.provider.as_deref())
                .await
                .map_err(|e| ToolError::failed(format!("{} failed: {}", persona.name, e)))?;

            if !response.tool_calls.is_empty() {
                let calls = response.tool_calls.clone();
                messages.push(Message::assistant_tool_calls(response.content.clone(), calls.clone()));
                for call in &calls {
                    let remaining = child.remaining().unwrap_or(STEP_TIMEOUT);
                    let result = executor.execute(call, remaining, &child).await;
                    messages.push(Message::tool_result(&call.id, result.to_content()));
                    tool_calls += 1;
                }
                continue;
            }

            let Some(text) = response.content_text() else {
                return Err(ToolError::failed(format!("{} returned an empty answer", persona.name)));
            };
            tracing::info!(
                session_id = %ctx.session_id,
                agent_id = %persona.id,
                depth = child.depth,
                turns = turn,
                tool_calls,
                "delegated task finished"
            );
            return Ok(DelegateTaskOutput {
                agent_id: persona.id,
                name: persona.name,
                result: text.to_string(),
                turns: turn,
                tool_calls,
            });
        }

        Err(ToolError::failed(format!(
            "delegated task did not finish within {} turns",
            self.max_turns
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ScriptedLlmClient};
    use crate::memory::ToolCall;
    use crate::tools::agents::Persona;
    use crate::tools::{ToolExecutor, ToolRegistry};
    use serde_json::{json, Value};

    #[derive(Deserialize, JsonSchema)]
    struct UpperInput {
        text: String,
    }

    struct UpperTool;

    #[async_trait]
    impl TypedTool for UpperTool {
        type Input = UpperInput;
        type Output = Value;
        const NAME: &'static str = "upper";

        fn description(&self) -> &str {
            "uppercase"
        }

        async fn run(&self, input: UpperInput, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(json!(input.text.to_uppercase()))
        }
    }

    async fn setup(llm: Arc<ScriptedLlmClient>) -> (Arc<ToolExecutor>, ToolContext) {
        let personas = Arc::new(PersonaStore::in_memory());
        personas
            .insert(Persona {
                id: "agent_1".into(),
                user_id: "u1".into(),
                name: "Helper".into(),
                specification: "a helper".into(),
                system_prompt: "You help.".into(),
                created_at: String::new(),
            })
            .await
            .unwrap();
        let router = Arc::new(ProviderRouter::new("mock", llm));
        let mut registry = ToolRegistry::new();
        registry.register_typed(UpperTool);
        registry.register_typed(DelegateTaskTool::new(router, personas));
        let executor = Arc::new(ToolExecutor::new(Arc::new(registry)));
        let ctx = ToolContext::new("s1", "u1").with_executor(executor.clone());
        (executor, ctx)
    }

    #[tokio::test]
    async fn test_persona_runs_nested_tool_loop() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_tool_calls(vec![ToolCall::new("upper", json!({"text": "abc"}))]);
        llm.push_text("The answer is ABC");
        let (executor, ctx) = setup(llm.clone()).await;

        let call = ToolCall::new("delegateTask", json!({"agentId": "agent_1", "task": "uppercase abc"}));
        let result = executor.execute(&call, Duration::from_secs(5), &ctx).await;
        assert!(!result.is_error(), "{:?}", result);

        let second = &llm.requests()[1];
        assert_eq!(second.last().unwrap().role, crate::memory::Role::Tool);
        assert!(second.last().unwrap().text().contains("ABC"));
        match result {
            crate::tools::ToolResult::Success { result, .. } => {
                assert_eq!(result["result"], "The answer is ABC");
                assert_eq!(result["toolCalls"], 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_depth_limit_stops_recursion() {
        let llm = Arc::new(ScriptedLlmClient::new().with_fallback(LlmResponse::text("done")));
        let (executor, ctx) = setup(llm).await;
        let ctx = ctx.with_max_depth(0);
        let call = ToolCall::new("delegateTask", json!({"agentId": "agent_1", "task": "x"}));
        let result = executor.execute(&call, Duration::from_secs(5), &ctx).await;
        assert!(result.is_error());
        assert!(result.to_content().contains("exceeds the limit"));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let (_executor, ctx) = setup(llm).await;
        let tool = DelegateTaskTool::new(
            Arc::new(ProviderRouter::new("mock", Arc::new(ScriptedLlmClient::new()))),
            Arc::new(PersonaStore::in_memory()),
        );
        let err = tool
            .run(DelegateTaskInput { agent_id: "nope".into(), task: "x".into() }, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Agent nope not found");
    }
}
