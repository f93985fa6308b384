//! 编排层：主循环、结果校验、上下文压缩与编排事件

pub mod critic;
pub mod events;
pub mod loop_;
pub mod memory;

pub use critic::{ResultType, Verdict, Verifier};
pub use events::{EventType, OrchestrationEvent};
pub use loop_::{ActivationOutcome, Orchestrator, OrchestratorConfig, DEFAULT_SYSTEM_PROMPT};
pub use memory::{ContextManager, PreparedContext};
