//! Agent 门面
//!
//! 供展示层（REPL、HTTP 等）调用：submit_user_message 对单条用户输入跑有界工具调用循环并返回回答，
//! list_session_stats / clear_session / list_notes 直接读写记忆存储。
//! 存储与后端句柄显式注入，不存在全局单例。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{AppConfig, BackendChoice};
use crate::core::{AgentError, RecoveryEngine, SessionSupervisor};
use crate::llm::{LlmBackend, MockBackend, OpenAiBackend};
use crate::memory::{ConversationTurn, MemoryStore, Note, SessionStats, SqliteStore};
use crate::react::{run_query, LoopOptions, ReactEvent, ReactOutcome, ReactSession};
use crate::tools::{
    CalculatorTool, DateTimeTool, DeleteNoteTool, GetNotesTool, SaveNoteTool, SearchTool, ToolExecutor,
    ToolRegistry, WeatherTool,
};

/// 按配置注册内置工具；注册顺序即向模型展示的顺序
pub fn default_registry(cfg: &AppConfig, store: Arc<dyn MemoryStore>) -> Result<ToolRegistry, AgentError> {
    let net = cfg.tools.network_timeout_secs;
    let mut tools = ToolRegistry::new();
    tools.register(SearchTool::new(
        cfg.tools.search.base_url.clone(),
        net,
        cfg.tools.search.max_results,
        cfg.tools.search.default_results,
    ))?;
    tools.register(CalculatorTool)?;
    tools.register(WeatherTool::new(cfg.tools.weather.base_url.clone(), net))?;
    tools.register(SaveNoteTool::new(store.clone()))?;
    tools.register(GetNotesTool::new(store.clone()))?;
    tools.register(DeleteNoteTool::new(store))?;
    tools.register(DateTimeTool)?;
    Ok(tools)
}

/// 按解析后的后端选择构建 LLM 后端
pub fn create_backend(cfg: &AppConfig) -> Arc<dyn LlmBackend> {
    match cfg.resolve_backend() {
        BackendChoice::OpenAiCompatible {
            provider,
            base_url,
            model,
            api_key,
        } => {
            tracing::info!(provider = %provider, model = %model, "using OpenAI-compatible backend");
            Arc::new(
                OpenAiBackend::new(base_url.as_deref(), &model, &api_key)
                    .with_sampling(cfg.llm.temperature, cfg.llm.max_tokens)
                    .with_name(format!("{provider}:{model}")),
            )
        }
        BackendChoice::Mock => {
            tracing::warn!("No API key set or provider is mock, using Mock backend");
            Arc::new(MockBackend)
        }
    }
}

pub struct Agent {
    backend: Arc<dyn LlmBackend>,
    executor: ToolExecutor,
    store: Arc<dyn MemoryStore>,
    recovery: RecoveryEngine,
    supervisor: SessionSupervisor,
    system_prompt: String,
    options: LoopOptions,
}

pub struct AgentBuilder {
    backend: Arc<dyn LlmBackend>,
    store: Arc<dyn MemoryStore>,
    executor: Option<ToolExecutor>,
    recovery: RecoveryEngine,
    system_prompt: String,
    options: LoopOptions,
}

impl AgentBuilder {
    pub fn new(backend: Arc<dyn LlmBackend>, store: Arc<dyn MemoryStore>) -> Self {
        Self {
            backend,
            store,
            executor: None,
            recovery: RecoveryEngine::default(),
            system_prompt: crate::config::DEFAULT_SYSTEM_PROMPT.to_string(),
            options: LoopOptions::default(),
        }
    }

    pub fn executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            backend: self.backend,
            executor: self
                .executor
                .unwrap_or_else(|| ToolExecutor::new(ToolRegistry::new(), 10)),
            store: self.store,
            recovery: self.recovery,
            supervisor: SessionSupervisor::new(),
            system_prompt: self.system_prompt,
            options: self.options,
        }
    }
}

impl Agent {
    pub fn builder(backend: Arc<dyn LlmBackend>, store: Arc<dyn MemoryStore>) -> AgentBuilder {
        AgentBuilder::new(backend, store)
    }

    /// 从配置构建：打开 SQLite、解析后端、注册内置工具
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let store: Arc<dyn MemoryStore> = Arc::new(SqliteStore::open(&cfg.app.db_path)?);
        let registry = default_registry(cfg, store.clone())?;
        tracing::info!(
            db = %cfg.app.db_path.display(),
            tools = ?registry.tool_names(),
            "agent initialised"
        );
        Ok(AgentBuilder::new(create_backend(cfg), store)
            .executor(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs))
            .recovery(RecoveryEngine::new(cfg.retry_config()))
            .system_prompt(cfg.system_prompt())
            .options(cfg.loop_options())
            .build())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.backend.token_usage()
    }

    /// 跑一次查询并返回完整结果（含状态与用量）；同一会话的查询按提交顺序串行
    pub async fn submit(
        &self,
        session_id: &str,
        text: &str,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<ReactOutcome, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::Validation("message is empty".to_string()));
        }
        let _guard = self.supervisor.lock_session(session_id).await;
        let query = self.supervisor.begin_query(session_id);
        let mut session = ReactSession::new(
            self.backend.as_ref(),
            &self.executor,
            self.store.as_ref(),
            &self.recovery,
        )
        .with_system_prompt(&self.system_prompt)
        .with_options(self.options.clone())
        .with_cancel_token(query.token());
        if let Some(tx) = event_tx {
            session = session.with_event_tx(tx);
        }
        run_query(&session, session_id, text).await
    }

    /// 返回最终回答；预算耗尽时返回 MaxIterationsExceeded（携带部分回答，且部分回答已写入会话）
    pub async fn submit_user_message(&self, session_id: &str, text: &str) -> Result<String, AgentError> {
        let outcome = self.submit(session_id, text, None).await?;
        outcome.into_result(self.options.max_iterations)
    }

    pub fn list_session_stats(&self, session_id: &str) -> Result<SessionStats, AgentError> {
        Ok(self.store.session_stats(session_id)?)
    }

    /// 最近 limit 个轮次（时间顺序），展示层据此显示每轮的工具使用情况
    pub fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>, AgentError> {
        Ok(self.store.recent_turns(session_id, limit)?)
    }

    pub fn clear_session(&self, session_id: &str) -> Result<usize, AgentError> {
        let removed = self.store.clear_session(session_id)?;
        tracing::info!(session_id = %session_id, removed, "session cleared");
        Ok(removed)
    }

    pub fn list_notes(&self, query: Option<&str>, limit: Option<usize>) -> Result<Vec<Note>, AgentError> {
        Ok(self.store.list_notes(query, limit)?)
    }

    /// 取消所有正在进行的查询；没有时返回 false
    pub fn cancel_current(&self) -> bool {
        self.supervisor.cancel_current()
    }
}
