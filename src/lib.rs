//! Hive - 可恢复的工具调用编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Session 模型、错误分类、计算预算、续跑调度、引擎装配与 worker
//! - **integrations**: 远程集成代理（JSON-RPC 工具发现与调用、缓存、重试）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与多后端路由
//! - **memory**: 消息模型、token 估算、关键词检索
//! - **observability**: 日志初始化
//! - **react**: 编排主循环、Verifier、上下文压缩、编排事件
//! - **store**: Session / 事件 / 执行日志 / 活跃索引（内存与 SQLite）
//! - **tools**: 工具注册表、执行上下文、执行器与本地工具

pub mod config;
pub mod core;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;

pub use crate::core::{Engine, Session, SessionStatus};
pub use crate::react::ActivationOutcome;
