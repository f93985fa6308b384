//! recallMemory：在本 Session 的完整历史中做关键词检索
//!
//! 上下文压缩后，LLM 只能看到摘要与最近的消息；被折叠的内容仍完整保存在 Session 中，
//! 通过这个工具按需找回。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::tokenizer::{relevance, tokenize_to_set};
use crate::memory::Role;
use crate::tools::{ToolContext, ToolError, TypedTool};

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 20;
const MAX_SNIPPET_CHARS: usize = 800;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecallMemoryInput {
    /// 关键词或问题
    pub query: String,
    /// 返回条数，默认 5，最多 20
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct Recalled {
    /// 在 Session 消息列表中的位置
    pub index: usize,
    pub role: Role,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct RecallMemoryOutput {
    pub query: String,
    pub matches: Vec<Recalled>,
}

#[derive(Debug, Default)]
pub struct RecallMemoryTool;

impl RecallMemoryTool {
    pub fn new() -> Self {
        Self
    }
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= MAX_SNIPPET_CHARS {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(MAX_SNIPPET_CHARS).collect();
        s.push_str("...");
        s
    }
}

#[async_trait]
impl TypedTool for RecallMemoryTool {
    type Input = RecallMemoryInput;
    type Output = RecallMemoryOutput;

    const NAME: &'static str = "recallMemory";

    fn description(&self) -> &str {
        "Search the full history of this session (including messages compacted out of the visible context) by keywords. Args: query, limit (optional, default 5)."
    }

    async fn run(&self, input: RecallMemoryInput, ctx: &ToolContext) -> Result<RecallMemoryOutput, ToolError> {
        let terms = tokenize_to_set(&input.query);
        if terms.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: Self::NAME.to_string(),
                reason: "query has no searchable terms".to_string(),
            });
        }
        let limit = input.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let mut matches: Vec<Recalled> = ctx
            .history
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != Role::System && !m.text().is_empty())
            .filter_map(|(index, m)| {
                let score = relevance(&terms, m.text());
                (score > 0.0).then(|| Recalled {
                    index,
                    role: m.role,
                    content: snippet(m.text()),
                    score,
                })
            })
            .collect();
        // 分数相同时越新越靠前
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.index.cmp(&a.index)));
        matches.truncate(limit);

        tracing::debug!(session_id = %ctx.session_id, hits = matches.len(), "memory recalled");
        Ok(RecallMemoryOutput {
            query: input.query,
            matches,
        })
    }
}
