//! 引擎装配与续跑 worker
//!
//! 负责：按配置创建 LLM 路由、本地工具、远程集成代理、Verifier 与各类存储，
//! 组装出编排循环；worker 从续跑队列取消息、运行一次激活并确认（ack）或延后重投（nack）。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    AgentError, ContinuationQueue, ContinuationScheduler, InMemoryQueue, Session,
};
use crate::integrations::{InMemoryEndpoints, IntegrationProxy};
use crate::llm::{
    create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient, ProviderRouter,
    RetryingLlmClient,
};
use crate::react::{ActivationOutcome, Orchestrator, Verifier};
use crate::store::{
    ActiveIndex, EventLog, ExecutionLog, InMemoryActiveIndex, InMemoryEventLog,
    InMemoryExecutionLog, InMemorySessionStore, SessionStore,
};
use crate::tools::{register_builtin_tools, PersonaStore, ToolExecutor, ToolRegistry};

/// worker 行为
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 队列为空时的等待上限
    pub poll_interval: Duration,
    /// 同一条消息最多投递次数，超过后丢弃
    pub max_deliveries: u32,
    /// 激活出错后重投的基础延迟（乘以已投递次数）
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_deliveries: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// 根据配置与环境变量注册 LLM 后端（OpenAI 兼容 / DeepSeek / Mock），均带重试包装
pub fn router_from_config(cfg: &AppConfig) -> ProviderRouter {
    let timeout = Duration::from_secs(cfg.llm.request_timeout_secs);
    let retry = cfg.llm.retry_config();
    let wrap = |client: Arc<dyn LlmClient>| -> Arc<dyn LlmClient> {
        Arc::new(RetryingLlmClient::new(client, retry.clone()))
    };

    let mut router = ProviderRouter::new("mock", Arc::new(MockLlmClient));
    if std::env::var("DEEPSEEK_API_KEY").is_ok() {
        let model = cfg.llm.model.as_deref().filter(|_| cfg.llm.provider == "deepseek");
        router = router.with_provider("deepseek", wrap(Arc::new(create_deepseek_client(model, timeout))));
    }
    if std::env::var("OPENAI_API_KEY").is_ok() {
        let model = cfg
            .llm
            .model
            .clone()
            .filter(|_| cfg.llm.provider == "openai")
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let client = OpenAiClient::with_timeout(cfg.llm.base_url.as_deref(), &model, None, timeout);
        router = router.with_provider("openai", wrap(Arc::new(client)));
    }

    let wanted = cfg.llm.provider.to_lowercase();
    if router.has_provider(&wanted) {
        tracing::info!(provider = %wanted, "default LLM provider selected");
        router.with_default(wanted)
    } else {
        tracing::warn!(provider = %wanted, "no API key for configured provider, using Mock LLM");
        router
    }
}

/// 一套完整的编排引擎
pub struct Engine {
    router: Arc<ProviderRouter>,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventLog>,
    executions: Arc<dyn ExecutionLog>,
    active: Arc<dyn ActiveIndex>,
    endpoints: Arc<InMemoryEndpoints>,
    personas: Arc<PersonaStore>,
    scheduler: Arc<ContinuationScheduler>,
    orchestrator: Arc<Orchestrator>,
    worker: WorkerConfig,
}

impl Engine {
    /// 按配置装配；LLM 后端由环境变量中的 API Key 决定
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let router = Arc::new(router_from_config(cfg));
        let verifier_llm: Arc<dyn LlmClient> = router.clone();
        Self::build(cfg, router, verifier_llm).await
    }

    /// 用给定的 LLM 路由与校验模型装配（测试注入脚本化客户端）
    pub async fn build(
        cfg: &AppConfig,
        router: Arc<ProviderRouter>,
        verifier_llm: Arc<dyn LlmClient>,
    ) -> Result<Self, AgentError> {
        let (store, events, executions, queue) = open_stores(cfg).await?;
        let active: Arc<dyn ActiveIndex> = Arc::new(InMemoryActiveIndex::new());
        let endpoints = Arc::new(InMemoryEndpoints::new());

        let personas = Arc::new(match &cfg.tools.workspace_root {
            Some(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(|e| AgentError::Config(format!("workspace {}: {}", root.display(), e)))?;
                PersonaStore::open(root).await
            }
            None => PersonaStore::in_memory(),
        });

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, router.clone(), personas.clone());

        let verifier = Arc::new(Verifier::new(verifier_llm));
        let proxy = Arc::new(IntegrationProxy::new(
            endpoints.clone(),
            executions.clone(),
            cfg.integrations.proxy_config(),
        ));
        let mut executor = ToolExecutor::new(Arc::new(registry)).with_proxy(proxy);
        if cfg.tools.verify_results {
            executor = executor.with_verifier(verifier.clone());
        }

        let scheduler = Arc::new(ContinuationScheduler::new(
            store.clone(),
            queue,
            events.clone(),
        ));
        let orchestrator = Orchestrator::new(
            router.clone(),
            Arc::new(executor),
            verifier,
            store.clone(),
            events.clone(),
            active.clone(),
            scheduler.clone(),
        )
        .with_config(cfg.orchestrator_config())
        .with_context_manager(cfg.context.context_manager());

        tracing::info!(
            providers = ?router.provider_names(),
            persistent = cfg.store.database_path.is_some(),
            "engine ready"
        );
        Ok(Self {
            router,
            store,
            events,
            executions,
            active,
            endpoints,
            personas,
            scheduler,
            orchestrator: Arc::new(orchestrator),
            worker: WorkerConfig::default(),
        })
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<dyn EventLog> {
        &self.events
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionLog> {
        &self.executions
    }

    pub fn active(&self) -> &Arc<dyn ActiveIndex> {
        &self.active
    }

    /// 远程集成端点（按用户注册）
    pub fn endpoints(&self) -> &Arc<InMemoryEndpoints> {
        &self.endpoints
    }

    pub fn personas(&self) -> &Arc<PersonaStore> {
        &self.personas
    }

    pub fn queue(&self) -> &Arc<dyn ContinuationQueue> {
        self.scheduler.queue()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// 新请求：创建 Session 并投递 start
    pub async fn submit(
        &self,
        user_id: &str,
        input: &str,
        thread_id: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Session, AgentError> {
        if input.trim().is_empty() {
            return Err(AgentError::Scheduling("input must not be empty".to_string()));
        }
        let mut session = Session::new(user_id);
        if let Some(thread) = thread_id {
            session = session.with_thread(thread);
        }
        if let Some(p) = provider {
            if !self.router.has_provider(p) {
                return Err(AgentError::Config(format!("unknown LLM provider: {}", p)));
            }
            session = session.with_provider(p);
        }
        self.scheduler.start(session, input).await
    }

    /// 取一条续跑消息并处理；队列为空返回 None
    pub async fn process_one(&self) -> Result<Option<ActivationOutcome>, AgentError> {
        let Some(delivery) = self.queue().dequeue().await? else {
            return Ok(None);
        };
        let session_id = delivery.message.session_id.clone();
        match self.orchestrator.run_activation(&delivery.message).await {
            Ok(outcome) => {
                self.queue().ack(&delivery.receipt).await?;
                tracing::debug!(session_id = %session_id, outcome = ?outcome, "continuation acknowledged");
                Ok(Some(outcome))
            }
            Err(e) if delivery.attempts >= self.worker.max_deliveries => {
                tracing::error!(
                    session_id = %session_id,
                    attempts = delivery.attempts,
                    error = %e,
                    "continuation dropped after repeated failures"
                );
                self.queue().ack(&delivery.receipt).await?;
                Err(e)
            }
            Err(e) => {
                let delay = self.worker.retry_delay.saturating_mul(delivery.attempts.max(1));
                tracing::warn!(
                    session_id = %session_id,
                    attempts = delivery.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "activation errored, continuation will be redelivered"
                );
                self.queue().nack(&delivery.receipt, delay).await?;
                Err(e)
            }
        }
    }

    /// 常驻 worker：直到 cancel 被触发
    pub async fn run_worker(&self, cancel: CancellationToken) {
        tracing::info!("continuation worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let processed = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.process_one() => r,
            };
            match processed {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.queue().wait(self.worker.poll_interval) => {}
                    }
                }
                Err(e) => tracing::warn!(error = %e, "worker iteration failed"),
            }
        }
        tracing::info!("continuation worker stopped");
    }

    /// 处理队列直到指定 Session 进入终态（CLI 与测试用）
    pub async fn run_until_finished(&self, session_id: &str) -> Result<Session, AgentError> {
        loop {
            let session = self.store.load(session_id).await?;
            if session.is_finished() {
                return Ok(session);
            }
            match self.process_one().await {
                Ok(Some(_)) => {}
                Ok(None) => self.queue().wait(self.worker.poll_interval).await,
                Err(e) if e.is_version_conflict() => {}
                Err(e) => tracing::warn!(session_id, error = %e, "activation errored"),
            }
        }
    }
}

type Stores = (
    Arc<dyn SessionStore>,
    Arc<dyn EventLog>,
    Arc<dyn ExecutionLog>,
    Arc<dyn ContinuationQueue>,
);

#[cfg(feature = "async-sqlite")]
async fn open_stores(cfg: &AppConfig) -> Result<Stores, AgentError> {
    let lease = Duration::from_secs(cfg.store.queue_lease_secs);
    match &cfg.store.database_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| AgentError::Config(format!("database dir {}: {}", dir.display(), e)))?;
            }
            let db = Arc::new(crate::store::SqliteStore::new(path).await?.with_lease(lease));
            tracing::info!(path = %path.display(), "using SQLite stores");
            let store: Arc<dyn SessionStore> = db.clone();
            let events: Arc<dyn EventLog> = db.clone();
            let executions: Arc<dyn ExecutionLog> = db.clone();
            let queue: Arc<dyn ContinuationQueue> = db;
            Ok((store, events, executions, queue))
        }
        None => Ok(in_memory_stores(lease)),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn open_stores(cfg: &AppConfig) -> Result<Stores, AgentError> {
    if cfg.store.database_path.is_some() {
        tracing::warn!("built without async-sqlite, database_path ignored");
    }
    Ok(in_memory_stores(Duration::from_secs(cfg.store.queue_lease_secs)))
}

fn in_memory_stores(lease: Duration) -> Stores {
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let events: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
    let executions: Arc<dyn ExecutionLog> = Arc::new(InMemoryExecutionLog::new());
    let queue: Arc<dyn ContinuationQueue> = Arc::new(InMemoryQueue::new(lease));
    (store, events, executions, queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionStatus;
    use crate::llm::ScriptedLlmClient;

    async fn engine(llm: Arc<ScriptedLlmClient>) -> Engine {
        let router = Arc::new(ProviderRouter::new("mock", llm));
        Engine::build(&AppConfig::default(), router, Arc::new(MockLlmClient))
            .await
            .unwrap()
            .with_worker_config(WorkerConfig {
                poll_interval: Duration::from_millis(10),
                max_deliveries: 2,
                retry_delay: Duration::from_millis(10),
            })
    }

    #[tokio::test]
    async fn test_submit_and_run_to_completion() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_text("Hi!");
        let engine = engine(llm).await;

        let session = engine.submit("u1", "hello", None, None).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        let done = engine.run_until_finished(&session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.final_response.unwrap().content, "Hi!");
        assert_eq!(engine.queue().pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let engine = engine(Arc::new(ScriptedLlmClient::new())).await;
        let err = engine.submit("u1", "hello", None, Some("nope")).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_session_is_dropped_after_max_deliveries() {
        let engine = engine(Arc::new(ScriptedLlmClient::new())).await;
        let ghost = Session::new("u1");
        engine
            .queue()
            .enqueue(crate::core::ContinuationMessage::resume(&ghost))
            .await
            .unwrap();

        assert!(engine.process_one().await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.process_one().await.is_err());
        assert_eq!(engine.queue().pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let engine = Arc::new(engine(Arc::new(ScriptedLlmClient::new())).await);
        let cancel = CancellationToken::new();
        let handle = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run_worker(cancel).await })
        };
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
