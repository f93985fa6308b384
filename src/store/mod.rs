//! 持久化：Session、对话线程、编排事件、远程调用审计、活跃索引、续跑队列
//!
//! 每种存储都是 trait，附带内存实现；启用 `async-sqlite` 时 `SqliteStore` 一次实现全部。

pub mod active_index;
pub mod event_log;
pub mod execution_log;
pub mod session_store;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

pub use active_index::{ActiveIndex, InMemoryActiveIndex};
pub use event_log::{EventLog, InMemoryEventLog};
pub use execution_log::{ExecutionLog, ExecutionRecord, ExecutionStatus, InMemoryExecutionLog};
pub use session_store::{InMemorySessionStore, SessionStore, TranscriptEntry};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
