//! 编排集成测试：直接回答、工具调用、工具超时、预算挂起与续跑、上下文压缩

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::config::AppConfig;
    use hive::core::{
        ComputeBudget, ContinuationMessage, ContinuationQueue, Engine, Session, SessionStatus,
    };
    use hive::llm::{LlmResponse, MockLlmClient, ProviderRouter, ScriptedLlmClient};
    use hive::memory::{Message, Role, ToolCall};
    use hive::react::{ActivationOutcome, EventType};
    use hive::store::{EventLog, SessionStore};
    use hive::tools::{ToolContext, ToolError, ToolExecutor, ToolRegistry, ToolResult, TypedTool};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::{json, Value};

    async fn engine(llm: Arc<ScriptedLlmClient>) -> Engine {
        let router = Arc::new(ProviderRouter::new("mock", llm));
        Engine::build(&AppConfig::default(), router, Arc::new(MockLlmClient))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_answer_without_tools() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_text("2 + 2 = 4");
        let engine = engine(llm.clone()).await;

        let session = engine.submit("u1", "What is 2+2?", None, None).await.unwrap();
        let done = engine.run_until_finished(&session.id).await.unwrap();

        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.final_response.as_ref().unwrap().content, "2 + 2 = 4");
        assert!(done.messages.iter().all(|m| m.role != Role::Tool));
        assert_eq!(llm.call_count(), 1);

        // 完成时在对话线程中写入 assistant 回复
        let thread = done.thread_id().unwrap();
        let transcript = engine.store().transcript(thread).await.unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].content, "2 + 2 = 4");
        assert!(!transcript[0].is_error);
    }

    #[tokio::test]
    async fn test_create_agent_result_feeds_next_llm_call() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_tool_calls(vec![ToolCall::new(
            "createAgent",
            json!({"specification": "a cybersecurity expert"}),
        )]);
        // createAgent 自己向 LLM 要 persona 定义
        llm.push_text(r#"{"name": "Sentinel", "systemPrompt": "You are a cybersecurity expert."}"#);
        llm.push_text("I consulted Sentinel, our cybersecurity expert: patch early, patch often.");
        let engine = engine(llm.clone()).await;

        let session = engine
            .submit("u1", "I need an expert opinion on patching", None, None)
            .await
            .unwrap();
        let done = engine.run_until_finished(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);

        let tool_msg = done.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        let envelope: Value = serde_json::from_str(tool_msg.text()).unwrap();
        assert_eq!(envelope["status"], "success");
        let agent_id = envelope["result"]["id"].as_str().unwrap().to_string();
        assert_eq!(envelope["result"]["persona"]["name"], "Sentinel");

        let final_request = llm.last_request().unwrap();
        assert!(final_request
            .iter()
            .any(|m| m.role == Role::Tool && m.text().contains(&agent_id)));
        assert!(done.final_response.unwrap().content.contains("Sentinel"));
        assert_eq!(engine.personas().list("u1").await.len(), 1);
        assert_eq!(done.tool_state["created_agent_ids"], json!([agent_id]));
    }

    #[derive(Deserialize, JsonSchema)]
    struct SlowInput {}

    struct SlowTool;

    #[async_trait]
    impl TypedTool for SlowTool {
        type Input = SlowInput;
        type Output = Value;
        const NAME: &'static str = "slowReport";

        fn description(&self) -> &str {
            "takes two seconds"
        }

        async fn run(&self, _input: SlowInput, _ctx: &ToolContext) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(json!("report"))
        }
    }

    #[tokio::test]
    async fn test_tool_slower_than_budget_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register_typed(SlowTool);
        let executor = ToolExecutor::new(Arc::new(registry));

        let started = std::time::Instant::now();
        let result = executor
            .execute(
                &ToolCall::new("slowReport", json!({})),
                Duration::from_millis(500),
                &ToolContext::new("s1", "u1"),
            )
            .await;
        assert!(started.elapsed() < Duration::from_millis(1500));

        let envelope: Value = serde_json::from_str(&result.to_content()).unwrap();
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["errorType"], "Timeout");
        assert!(envelope["suggestion"]
            .as_str()
            .unwrap()
            .ends_with("consider breaking the task into smaller steps."));
        assert!(matches!(result, ToolResult::Error { .. }));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_checkpoints_and_resumes() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_tool_calls(vec![ToolCall::new("recallMemory", json!({"query": "revenue"}))]);
        // 第二次 LLM 调用超出预算：本次激活挂起，不追加任何消息
        llm.push_delayed(Duration::from_secs(2), LlmResponse::text("too late"));
        llm.push_text("Revenue was not discussed before.");
        let engine = engine(llm.clone()).await;

        let session = engine
            .submit("u1", "what did we say about revenue?", None, None)
            .await
            .unwrap();
        let delivery = engine.queue().dequeue().await.unwrap().unwrap();
        let budget = ComputeBudget::new(Duration::from_millis(400), Duration::from_millis(100));
        let outcome = engine
            .orchestrator()
            .run_activation_with_budget(&delivery.message, budget)
            .await
            .unwrap();
        engine.queue().ack(&delivery.receipt).await.unwrap();
        assert_eq!(outcome, ActivationOutcome::Suspended);

        let suspended = engine.store().load(&session.id).await.unwrap();
        assert_eq!(suspended.status, SessionStatus::Resuming);
        let roles: Vec<Role> = suspended.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
        assert!(suspended.thread_id().is_some());
        assert_eq!(engine.queue().pending().await.unwrap(), 1);

        let done = engine.run_until_finished(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.execution_count, 2);
        assert_eq!(done.thread_id(), suspended.thread_id());
        assert_eq!(&done.messages[..3], &suspended.messages[..]);
        assert_eq!(llm.call_count(), 3);

        // 已完成的工具调用没有被重新执行
        let events = engine.events().for_session(&session.id).await.unwrap();
        let tool_calls = events
            .iter()
            .filter(|e| e.event_type == EventType::ToolCall)
            .count();
        assert_eq!(tool_calls, 1);
        let statuses: Vec<String> = events
            .iter()
            .filter(|e| e.event_type == EventType::StatusUpdate)
            .filter_map(|e| e.data["status"].as_str().map(str::to_string))
            .collect();
        assert_eq!(statuses, vec!["running", "resuming", "running", "completed"]);
    }

    #[tokio::test]
    async fn test_compaction_only_affects_llm_view() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_text("Summary of our long chat.");
        let engine = engine(llm.clone()).await;

        // 30 条 12k 字符的消息 ≈ 90k token，超过 100k * 0.8
        let mut session = Session::new("u1");
        session.status = SessionStatus::Resuming;
        session.messages.push(Message::user("Let's plan the migration."));
        for i in 0..30 {
            let body = format!("{} {}", i, "x".repeat(12_000));
            session.messages.push(if i % 2 == 0 {
                Message::assistant(body)
            } else {
                Message::user(body)
            });
        }
        let original = session.messages.clone();
        engine.store().create(&session).await.unwrap();
        engine
            .queue()
            .enqueue(ContinuationMessage::resume(&session))
            .await
            .unwrap();

        let done = engine.run_until_finished(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);

        let sent = &llm.requests()[0];
        assert_eq!(sent.len(), 13);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[1].text(), "Let's plan the migration.");
        assert_eq!(sent[2].role, Role::System);
        assert!(sent[2].text().contains("compacted"));
        assert_eq!(&sent[3..], &original[original.len() - 10..]);

        // 存储的历史保持完整
        assert_eq!(done.messages.len(), original.len() + 1);
        assert_eq!(&done.messages[..original.len()], &original[..]);
        assert_eq!(done.tool_state["context_compacted"], json!(true));
        let events = engine.events().for_session(&session.id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::Compaction));
    }
}
