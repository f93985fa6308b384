//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::integrations::{CachePolicy, ProxyConfig};
use crate::llm::RetryConfig;
use crate::memory::TokenBudget;
use crate::react::{ContextManager, OrchestratorConfig, DEFAULT_SYSTEM_PROMPT};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub context: ContextSection,
    pub tools: ToolsSection,
    pub integrations: IntegrationsSection,
    pub store: StoreSection,
    pub observability: ObservabilitySection,
}

/// [llm] 段：默认后端与超时、重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 默认后端：openai / deepseek / mock；Session 可通过 toolState.llm_provider 另选
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 限流 / 网络错误的重试次数
    pub retry_attempts: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            request_timeout_secs: 120,
            retry_attempts: 3,
        }
    }
}

impl LlmSection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_attempts,
            ..RetryConfig::default()
        }
    }
}

/// [orchestrator] 段：激活预算与校验
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub invocation_budget_secs: u64,
    /// 剩余时间低于此值即写检查点挂起
    pub safety_margin_secs: u64,
    pub verification_threshold: f64,
    pub max_verification_retries: u32,
    pub max_tool_depth: u32,
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            invocation_budget_secs: 900,
            safety_margin_secs: 30,
            verification_threshold: 0.6,
            max_verification_retries: 3,
            max_tool_depth: crate::tools::DEFAULT_MAX_DEPTH,
            system_prompt: None,
        }
    }
}

/// [context] 段：上下文窗口与压缩
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub context_window: usize,
    /// 超过窗口的该比例即压缩
    pub compaction_ratio: f64,
    pub keep_recent: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            context_window: 100_000,
            compaction_ratio: 0.8,
            keep_recent: 10,
        }
    }
}

impl ContextSection {
    pub fn context_manager(&self) -> ContextManager {
        ContextManager::new(
            TokenBudget::new(self.context_window, self.compaction_ratio),
            self.keep_recent,
        )
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 成功的工具结果是否交给 Verifier 校验
    pub verify_results: bool,
    /// persona 持久化目录；未设置时只保存在内存
    pub workspace_root: Option<PathBuf>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            verify_results: true,
            workspace_root: None,
        }
    }
}

/// [integrations] 段：远程集成代理的重试与缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegrationsSection {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub cache_min_secs: u64,
    pub cache_max_secs: u64,
    pub cache_default_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for IntegrationsSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1000,
            cache_min_secs: 10,
            cache_max_secs: 3600,
            cache_default_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

impl IntegrationsSection {
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            cache: CachePolicy {
                min_ttl: Duration::from_secs(self.cache_min_secs),
                max_ttl: Duration::from_secs(self.cache_max_secs),
                default_ttl: Duration::from_secs(self.cache_default_secs),
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// [store] 段：持久化
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite 文件路径；未设置时全部存储都在内存中
    pub database_path: Option<PathBuf>,
    pub active_index_ttl_secs: u64,
    /// 续跑消息的租约：超过此时间未确认即重新投递
    pub queue_lease_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: None,
            active_index_ttl_secs: 3600,
            queue_lease_secs: 960,
        }
    }
}

/// [observability] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilitySection {
    /// 日志输出为 JSON 行
    pub json: bool,
}

impl AppConfig {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            invocation_budget: Duration::from_secs(o.invocation_budget_secs),
            safety_margin: Duration::from_secs(o.safety_margin_secs),
            verification_threshold: o.verification_threshold,
            max_verification_retries: o.max_verification_retries,
            max_tool_depth: o.max_tool_depth,
            system_prompt: o
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            active_ttl: Duration::from_secs(self.store.active_index_ttl_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
