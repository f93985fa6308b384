//! 核心层：Session 模型、错误与恢复分类、计算预算、续跑调度与引擎装配

pub mod budget;
pub mod continuation;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;

pub use budget::ComputeBudget;
pub use continuation::{
    ContinuationAction, ContinuationMessage, ContinuationQueue, ContinuationScheduler, Delivery,
    InMemoryQueue,
};
pub use error::{AgentError, StoreError};
pub use orchestrator::{Engine, WorkerConfig};
pub use recovery::{RecoveryEngine, ToolErrorKind};
pub use session::{keys, FinalResponse, Session, SessionPatch, SessionStatus, ToolState};
