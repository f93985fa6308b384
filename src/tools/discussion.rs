//! gatherResponses / runDiscussion：多个 persona 参与的问答与讨论
//!
//! gatherResponses 并发向每个 persona 提问（并发只在工具内部，编排循环仍按顺序执行工具调用）；
//! runDiscussion 按轮次依次发言，每位发言者都能看到此前的讨论记录。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm::ProviderRouter;
use crate::memory::Message;
use crate::tools::agents::{Persona, PersonaStore};
use crate::tools::{ToolContext, ToolError, TypedTool};

const MAX_ROUNDS: u32 = 5;
const DEFAULT_ROUNDS: u32 = 2;

fn require_agents(tool: &str, ids: &[String]) -> Result<(), ToolError> {
    if ids.is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: "agentIds must not be empty".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatherResponsesInput {
    /// createAgent 返回的 persona id
    pub agent_ids: Vec<String>,
    pub question: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GatherResponsesOutput {
    pub question: String,
    pub responses: Vec<AgentResponse>,
}

pub struct GatherResponsesTool {
    llm: Arc<ProviderRouter>,
    personas: Arc<PersonaStore>,
}

impl GatherResponsesTool {
    pub fn new(llm: Arc<ProviderRouter>, personas: Arc<PersonaStore>) -> Self {
        Self { llm, personas }
    }

    async fn ask(&self, persona: &Persona, question: &str, provider: Option<&str>) -> AgentResponse {
        let messages = [Message::system(&persona.system_prompt), Message::user(question)];
        let (response, error) = match self.llm.complete_with(&messages, &[], provider).await {
            Ok(r) => match r.content_text() {
                Some(text) => (Some(text.to_string()), None),
                None => (None, Some("empty response".to_string())),
            },
            Err(e) => (None, Some(e.to_string())),
        };
        AgentResponse {
            agent_id: persona.id.clone(),
            name: persona.name.clone(),
            response,
            error,
        }
    }
}

#[async_trait]
impl TypedTool for GatherResponsesTool {
    type Input = GatherResponsesInput;
    type Output = GatherResponsesOutput;

    const NAME: &'static str = "gatherResponses";

    fn description(&self) -> &str {
        "Ask several personas the same question independently and collect every answer. Args: agentIds (persona ids from createAgent), question."
    }

    async fn run(&self, input: GatherResponsesInput, ctx: &ToolContext) -> Result<GatherResponsesOutput, ToolError> {
        require_agents(Self::NAME, &input.agent_ids)?;
        let personas = self.personas.get_many(&ctx.user_id, &input.agent_ids).await?;
        let provider = ctx.provider.as_deref();

        let responses = join_all(
            personas
                .iter()
                .map(|p| self.ask(p, &input.question, provider)),
        )
        .await;

        if responses.iter().all(|r| r.error.is_some()) {
            let first = responses
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_default();
            return Err(ToolError::failed(format!("no persona answered: {}", first)));
        }
        Ok(GatherResponsesOutput {
            question: input.question,
            responses,
        })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunDiscussionInput {
    pub agent_ids: Vec<String>,
    pub topic: String,
    /// 讨论轮数，默认 2，最多 5
    #[serde(default)]
    pub rounds: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub round: u32,
    pub agent_id: String,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct RunDiscussionOutput {
    pub topic: String,
    pub rounds: u32,
    pub transcript: Vec<Contribution>,
}

pub struct RunDiscussionTool {
    llm: Arc<ProviderRouter>,
    personas: Arc<PersonaStore>,
}

impl RunDiscussionTool {
    pub fn new(llm: Arc<ProviderRouter>, personas: Arc<PersonaStore>) -> Self {
        Self { llm, personas }
    }
}

fn render_transcript(topic: &str, transcript: &[Contribution]) -> String {
    let mut out = format!("Discussion topic: {}\n", topic);
    if transcript.is_empty() {
        out.push_str("\nYou speak first.");
    } else {
        out.push_str("\nSo far:\n");
        for c in transcript {
            out.push_str(&format!("[round {}] {}: {}\n", c.round, c.name, c.content));
        }
        out.push_str("\nAdd your contribution. Respond to the points above; agree, challenge or refine them.");
    }
    out
}

#[async_trait]
impl TypedTool for RunDiscussionTool {
    type Input = RunDiscussionInput;
    type Output = RunDiscussionOutput;

    const NAME: &'static str = "runDiscussion";

    fn description(&self) -> &str {
        "Run a moderated multi-round discussion between personas on a topic; each speaker sees the discussion so far. Args: agentIds, topic, rounds (optional, default 2, max 5)."
    }

    async fn run(&self, input: RunDiscussionInput, ctx: &ToolContext) -> Result<RunDiscussionOutput, ToolError> {
        require_agents(Self::NAME, &input.agent_ids)?;
        let personas = self.personas.get_many(&ctx.user_id, &input.agent_ids).await?;
        let rounds = input.rounds.unwrap_or(DEFAULT_ROUNDS).clamp(1, MAX_ROUNDS);

        let mut transcript: Vec<Contribution> = Vec::new();
        for round in 1..=rounds {
            for persona in &personas {
                let prompt = render_transcript(&input.topic, &transcript);
                let messages = [Message::system(&persona.system_prompt), Message::user(prompt)];
                let response = self
                    .llm
                    .complete_with(&messages, &[], ctx.provider.as_deref())
                    .await
                    .map_err(|e| ToolError::failed(format!("{} failed to respond: {}", persona.name, e)))?;
                let Some(content) = response.content_text() else {
                    tracing::debug!(agent_id = %persona.id, round, "persona passed");
                    continue;
                };
                transcript.push(Contribution {
                    round,
                    agent_id: persona.id.clone(),
                    name: persona.name.clone(),
                    content: content.to_string(),
                });
            }
        }

        Ok(RunDiscussionOutput {
            topic: input.topic,
            rounds,
            transcript,
        })
    }
}
