//! 记忆层：对话消息模型、token 估算、关键词检索

pub mod conversation;
pub mod token_budget;
pub mod tokenizer;

pub use conversation::{first_user_input, unanswered_tool_calls, Message, Role, ToolCall};
pub use token_budget::{TokenBudget, TokenEstimator};
