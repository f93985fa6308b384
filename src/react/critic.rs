//! Verifier：让 LLM 判断产出是否达成目标
//!
//! 按结果类型拼出对应的评判标准（rubric），要求 LLM 只返回一个 JSON 判断：
//! `{achieved, confidence, issues, suggestions}`。既用于每次工具调用的结果，也用于最终回复。
//! LLM 调用失败或返回的判断无法解析时，按 `achieved=false, confidence=0` 处理，不向上抛错。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::LlmClient;
use crate::memory::Message;

/// 一次校验的结构化判断
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub achieved: bool,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Verdict {
    pub fn failed(issue: impl Into<String>) -> Self {
        Self {
            achieved: false,
            confidence: 0.0,
            issues: vec![issue.into()],
            suggestions: Vec::new(),
        }
    }

    /// 未达成且置信度低于阈值时需要重试
    pub fn needs_retry(&self, threshold: f64) -> bool {
        !self.achieved && self.confidence < threshold
    }

    /// 从 LLM 文本中取出 JSON 判断；允许外层包着 ```json 代码块或说明文字
    pub fn parse(text: &str) -> Option<Self> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end < start {
            return None;
        }
        let mut verdict: Verdict = serde_json::from_str(&text[start..=end]).ok()?;
        if !verdict.confidence.is_finite() {
            return None;
        }
        verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
        Some(verdict)
    }
}

/// 产出类型：决定使用哪一套评判标准
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    AgentCreation,
    Analysis,
    Consensus,
    Discussion,
    ResponseGathering,
    Validation,
    Orchestrator,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::AgentCreation => "agent_creation",
            ResultType::Analysis => "analysis",
            ResultType::Consensus => "consensus",
            ResultType::Discussion => "discussion",
            ResultType::ResponseGathering => "response_gathering",
            ResultType::Validation => "validation",
            ResultType::Orchestrator => "orchestrator",
        }
    }

    /// 本地工具对应的产出类型；其他工具（含远程集成）按通用校验处理
    pub fn for_tool(tool: &str) -> Self {
        match tool {
            "createAgent" => ResultType::AgentCreation,
            "analyzeResults" => ResultType::Analysis,
            "runDiscussion" => ResultType::Discussion,
            "gatherResponses" => ResultType::ResponseGathering,
            _ => ResultType::Validation,
        }
    }

    fn rubric(&self) -> &'static str {
        match self {
            ResultType::AgentCreation => {
                "- The persona has a clear role and domain expertise matching the requested specification.\n\
                 - The persona description is specific enough to drive distinct answers.\n\
                 - An identifier was returned for the created persona."
            }
            ResultType::Analysis => {
                "- The analysis addresses the requested focus.\n\
                 - Claims are supported by the analyzed content rather than invented.\n\
                 - Key findings are stated explicitly."
            }
            ResultType::Consensus => {
                "- Points of agreement and disagreement are identified.\n\
                 - The consensus reflects the positions actually expressed.\n\
                 - Unresolved disagreements are not hidden."
            }
            ResultType::Discussion => {
                "- Every requested participant contributed.\n\
                 - Later turns respond to earlier ones instead of repeating them.\n\
                 - The discussion stays on the requested topic."
            }
            ResultType::ResponseGathering => {
                "- A response was collected from every requested persona.\n\
                 - Each response answers the question that was asked.\n\
                 - Failures for individual personas are reported, not silently dropped."
            }
            ResultType::Validation => {
                "- The result corresponds to the requested operation and arguments.\n\
                 - The result is well formed and not an error disguised as success."
            }
            ResultType::Orchestrator => {
                "- The final answer directly fulfills the user's request.\n\
                 - Information gathered through tool calls is used correctly.\n\
                 - The answer does not claim work that was not performed."
            }
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VERIFIER_SYSTEM_PROMPT: &str = "You are a strict verifier. You judge whether an artifact satisfies a goal. \
You never produce the artifact yourself and you answer with JSON only.";

const DEFAULT_MAX_ARTIFACT_CHARS: usize = 12_000;

pub struct Verifier {
    llm: Arc<dyn LlmClient>,
    max_artifact_chars: usize,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_artifact_chars: DEFAULT_MAX_ARTIFACT_CHARS,
        }
    }

    pub fn with_max_artifact_chars(mut self, max: usize) -> Self {
        self.max_artifact_chars = max;
        self
    }

    fn build_prompt(&self, artifact: &str, goal: &str, result_type: ResultType) -> String {
        let artifact: String = if artifact.chars().count() > self.max_artifact_chars {
            let head: String = artifact.chars().take(self.max_artifact_chars).collect();
            format!("{}\n[truncated]", head)
        } else {
            artifact.to_string()
        };
        format!(
            "Goal: {goal}\nResult type: {kind}\n\nRubric:\n{rubric}\n\nArtifact:\n{artifact}\n\n\
             Respond with only a JSON object of the form \
             {{\"achieved\": true|false, \"confidence\": <number between 0 and 1>, \
             \"issues\": [<string>], \"suggestions\": [<string>]}}",
            kind = result_type,
            rubric = result_type.rubric(),
        )
    }

    pub async fn verify(&self, artifact: &str, goal: &str, result_type: ResultType) -> Verdict {
        let messages = vec![
            Message::system(VERIFIER_SYSTEM_PROMPT),
            Message::user(self.build_prompt(artifact, goal, result_type)),
        ];
        let response = match self.llm.complete(&messages, &[]).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(result_type = %result_type, error = %e, "verifier LLM call failed");
                return Verdict::failed(format!("verification unavailable: {}", e));
            }
        };
        let text = response.content_text().unwrap_or_default();
        match Verdict::parse(text) {
            Some(v) => {
                tracing::debug!(result_type = %result_type, achieved = v.achieved, confidence = v.confidence, "verdict");
                v
            }
            None => {
                tracing::warn!(result_type = %result_type, "malformed verdict from verifier");
                Verdict::failed("malformed verdict")
            }
        }
    }
}
