//! createAgent / listAgents：按需生成的专家 persona
//!
//! persona 由 LLM 根据一句话描述生成（名字 + 系统提示词），按用户归属保存；
//! 配置了 workspace 时持久化到 `agents.json`，否则只在内存中。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::keys;
use crate::llm::ProviderRouter;
use crate::memory::Message;
use crate::tools::{ToolContext, ToolError, TypedTool};

const AGENTS_FILE: &str = "agents.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub specification: String,
    pub system_prompt: String,
    pub created_at: String,
}

/// persona 存储
pub struct PersonaStore {
    path: Option<PathBuf>,
    personas: RwLock<Vec<Persona>>,
}

impl PersonaStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            personas: RwLock::new(Vec::new()),
        }
    }

    /// 从 workspace 下的 agents.json 加载；文件不存在或损坏时从空开始
    pub async fn open(workspace: &Path) -> Self {
        let path = workspace.join(AGENTS_FILE);
        let personas = match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable persona file");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path: Some(path),
            personas: RwLock::new(personas),
        }
    }

    pub async fn insert(&self, persona: Persona) -> Result<(), ToolError> {
        let mut personas = self.personas.write().await;
        personas.push(persona);
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::failed(format!("failed to create workspace: {}", e)))?;
            }
            let json = serde_json::to_string_pretty(&*personas)
                .map_err(|e| ToolError::failed(e.to_string()))?;
            tokio::fs::write(path, json)
                .await
                .map_err(|e| ToolError::failed(format!("failed to save personas: {}", e)))?;
        }
        Ok(())
    }

    /// 只能取到属于该用户的 persona
    pub async fn get(&self, user_id: &str, id: &str) -> Option<Persona> {
        self.personas
            .read()
            .await
            .iter()
            .find(|p| p.id == id && p.user_id == user_id)
            .cloned()
    }

    /// 按 id 批量取，缺失的报 not found
    pub async fn get_many(&self, user_id: &str, ids: &[String]) -> Result<Vec<Persona>, ToolError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let persona = self
                .get(user_id, id)
                .await
                .ok_or_else(|| ToolError::failed(format!("Agent {} not found", id)))?;
            found.push(persona);
        }
        Ok(found)
    }

    pub async fn list(&self, user_id: &str) -> Vec<Persona> {
        self.personas
            .read()
            .await
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }
}

/// LLM 生成 persona 时的期望格式
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedPersona {
    name: String,
    system_prompt: String,
}

const PERSONA_PROMPT: &str = "You design expert personas for a multi-agent assistant. \
Given a short specification, reply with JSON only: \
{\"name\": \"<short display name>\", \"systemPrompt\": \"<second-person instructions defining the persona's expertise, tone and limits>\"}";

fn fallback_name(specification: &str) -> String {
    let name: String = specification.chars().take(40).collect();
    name.trim().to_string()
}

/// 从 LLM 文本中取出 persona；不是合法 JSON 时整段作为系统提示词
fn parse_generated(text: &str, specification: &str) -> GeneratedPersona {
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => "",
    };
    serde_json::from_str::<GeneratedPersona>(json)
        .ok()
        .filter(|g| !g.name.trim().is_empty() && !g.system_prompt.trim().is_empty())
        .unwrap_or_else(|| GeneratedPersona {
            name: fallback_name(specification),
            system_prompt: if text.trim().is_empty() {
                format!("You are {}.", specification)
            } else {
                text.trim().to_string()
            },
        })
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateAgentInput {
    /// 一句话描述需要的专家，例如 "a cybersecurity expert"
    pub specification: String,
}

#[derive(Debug, Serialize)]
pub struct CreateAgentOutput {
    pub id: String,
    pub persona: Persona,
}

pub struct CreateAgentTool {
    llm: Arc<ProviderRouter>,
    personas: Arc<PersonaStore>,
}

impl CreateAgentTool {
    pub fn new(llm: Arc<ProviderRouter>, personas: Arc<PersonaStore>) -> Self {
        Self { llm, personas }
    }
}

#[async_trait]
impl TypedTool for CreateAgentTool {
    type Input = CreateAgentInput;
    type Output = CreateAgentOutput;

    const NAME: &'static str = "createAgent";

    fn description(&self) -> &str {
        "Create an expert persona from a short specification (e.g. \"a cybersecurity expert\"). Returns its id for use with gatherResponses, runDiscussion and delegateTask."
    }

    async fn run(&self, input: CreateAgentInput, ctx: &ToolContext) -> Result<CreateAgentOutput, ToolError> {
        let specification = input.specification.trim();
        if specification.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: Self::NAME.to_string(),
                reason: "specification must not be empty".to_string(),
            });
        }

        let messages = [Message::system(PERSONA_PROMPT), Message::user(specification)];
        let response = self
            .llm
            .complete_with(&messages, &[], ctx.provider.as_deref())
            .await
            .map_err(|e| ToolError::failed(format!("persona generation failed: {}", e)))?;
        let generated = parse_generated(response.content.as_deref().unwrap_or(""), specification);

        let persona = Persona {
            id: format!("agent_{}", uuid::Uuid::new_v4().simple()),
            user_id: ctx.user_id.clone(),
            name: generated.name,
            specification: specification.to_string(),
            system_prompt: generated.system_prompt,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.personas.insert(persona.clone()).await?;
        ctx.append(keys::CREATED_AGENTS, serde_json::Value::String(persona.id.clone()))
            .await;
        tracing::info!(session_id = %ctx.session_id, agent_id = %persona.id, name = %persona.name, "persona created");

        Ok(CreateAgentOutput {
            id: persona.id.clone(),
            persona,
        })
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListAgentsInput {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub specification: String,
}

pub struct ListAgentsTool {
    personas: Arc<PersonaStore>,
}

impl ListAgentsTool {
    pub fn new(personas: Arc<PersonaStore>) -> Self {
        Self { personas }
    }
}

#[async_trait]
impl TypedTool for ListAgentsTool {
    type Input = ListAgentsInput;
    type Output = Vec<AgentSummary>;

    const NAME: &'static str = "listAgents";

    fn description(&self) -> &str {
        "List the expert personas created so far for this user (id, name, specification)."
    }

    async fn run(&self, _input: ListAgentsInput, ctx: &ToolContext) -> Result<Vec<AgentSummary>, ToolError> {
        Ok(self
            .personas
            .list(&ctx.user_id)
            .await
            .into_iter()
            .map(|p| AgentSummary {
                id: p.id,
                name: p.name,
                specification: p.specification,
            })
            .collect())
    }
}
