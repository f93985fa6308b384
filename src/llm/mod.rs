//! LLM 层：抽象接口、OpenAI 兼容实现、DeepSeek、Mock 与多后端路由

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage, OPENAI_BASE_URL};
pub use router::ProviderRouter;
pub use traits::{LlmClient, LlmError, LlmResponse, RetryConfig, RetryingLlmClient, Usage};
