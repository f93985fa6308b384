//! 工具层：注册表、执行上下文、执行器与本地工具

pub mod agents;
pub mod analysis;
pub mod context;
pub mod delegate;
pub mod discussion;
pub mod executor;
pub mod recall;
pub mod registry;

use std::sync::Arc;

use crate::llm::ProviderRouter;

pub use agents::{CreateAgentTool, ListAgentsTool, Persona, PersonaStore};
pub use analysis::AnalyzeResultsTool;
pub use context::{ToolContext, DEFAULT_MAX_DEPTH};
pub use delegate::DelegateTaskTool;
pub use discussion::{GatherResponsesTool, RunDiscussionTool};
pub use executor::{ToolExecutor, ToolResult};
pub use recall::RecallMemoryTool;
pub use registry::{input_schema, Tool, ToolError, ToolRegistry, ToolSpec, TypedTool};

/// 注册全部本地工具
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    llm: Arc<ProviderRouter>,
    personas: Arc<PersonaStore>,
) {
    registry.register_typed(CreateAgentTool::new(llm.clone(), personas.clone()));
    registry.register_typed(ListAgentsTool::new(personas.clone()));
    registry.register_typed(GatherResponsesTool::new(llm.clone(), personas.clone()));
    registry.register_typed(RunDiscussionTool::new(llm.clone(), personas.clone()));
    registry.register_typed(AnalyzeResultsTool::new(llm.clone()));
    registry.register_typed(RecallMemoryTool::new());
    registry.register_typed(DelegateTaskTool::new(llm, personas));
}
