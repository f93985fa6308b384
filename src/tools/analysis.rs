//! analyzeResults：对已收集的材料做结构化分析

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm::ProviderRouter;
use crate::memory::Message;
use crate::tools::{ToolContext, ToolError, TypedTool};

const ANALYST_PROMPT: &str = "You are a rigorous analyst. Identify the key findings, points of agreement, \
points of disagreement and open risks in the material you are given. Be concise and concrete; \
do not invent facts that are not in the material.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeResultsInput {
    /// 待分析的材料（例如 gatherResponses 或 runDiscussion 的结果）
    pub content: String,
    /// 分析侧重点
    #[serde(default)]
    pub focus: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResultsOutput {
    pub analysis: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

pub struct AnalyzeResultsTool {
    llm: Arc<ProviderRouter>,
}

impl AnalyzeResultsTool {
    pub fn new(llm: Arc<ProviderRouter>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl TypedTool for AnalyzeResultsTool {
    type Input = AnalyzeResultsInput;
    type Output = AnalyzeResultsOutput;

    const NAME: &'static str = "analyzeResults";

    fn description(&self) -> &str {
        "Analyze collected material (answers, discussion transcripts, data) and summarize findings, agreements, disagreements and risks. Args: content, focus (optional)."
    }

    async fn run(&self, input: AnalyzeResultsInput, ctx: &ToolContext) -> Result<AnalyzeResultsOutput, ToolError> {
        if input.content.trim().is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: Self::NAME.to_string(),
                reason: "content must not be empty".to_string(),
            });
        }
        let focus = input.focus.filter(|f| !f.trim().is_empty());
        let mut request = String::new();
        if let Some(f) = &focus {
            request.push_str(&format!("Focus on: {}\n\n", f));
        }
        request.push_str("Material:\n");
        request.push_str(&input.content);

        let messages = [Message::system(ANALYST_PROMPT), Message::user(request)];
        let response = self
            .llm
            .complete_with(&messages, &[], ctx.provider.as_deref())
            .await
            .map_err(|e| ToolError::failed(format!("analysis failed: {}", e)))?;
        let analysis = response
            .content_text()
            .ok_or_else(|| ToolError::failed("analysis failed: empty response"))?
            .to_string();

        Ok(AnalyzeResultsOutput { analysis, focus })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_focus_is_passed_to_llm() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_text("Findings: both agree.");
        let tool = AnalyzeResultsTool::new(Arc::new(ProviderRouter::new("mock", llm.clone())));
        let out = tool
            .run(
                AnalyzeResultsInput { content: "A: yes\nB: yes".into(), focus: Some("consensus".into()) },
                &ToolContext::new("s1", "u1"),
            )
            .await
            .unwrap();
        assert_eq!(out.analysis, "Findings: both agree.");
        let req = llm.last_request().unwrap();
        assert!(req[1].text().starts_with("Focus on: consensus"));
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let tool = AnalyzeResultsTool::new(Arc::new(ProviderRouter::new(
            "mock",
            Arc::new(ScriptedLlmClient::new()),
        )));
        let err = tool
            .run(
                AnalyzeResultsInput { content: " ".into(), focus: None },
                &ToolContext::new("s1", "u1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
