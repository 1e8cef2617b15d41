//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FORGE__*` 覆盖（双下划线表示嵌套，如 `FORGE__LLM__MODEL=gpt-4o-mini`）。
//! API Key 只在这里解析（llm.api_key > GROQ_API_KEY > OPENAI_API_KEY），核心层只接收解析后的值。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentError, RetryConfig};
use crate::llm::GROQ_BASE_URL;
use crate::react::LoopOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// [app] 段：会话、数据库位置、上下文轮数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub session_id: String,
    pub db_path: PathBuf,
    /// 每次模型调用带上的最近轮次数
    pub context_turns: usize,
    /// 系统提示词文件；未设置时按默认位置查找
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            db_path: PathBuf::from("database/agentforge.db"),
            context_turns: 8,
            system_prompt_path: None,
        }
    }
}

/// [llm] 段：后端选择、采样参数、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// auto / groq / openai / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeouts: LlmTimeoutsSection,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            model: None,
            base_url: None,
            api_key: None,
            temperature: 0.7,
            max_tokens: 2000,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

/// [agent] 段：循环预算与批处理策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub parallel_tool_calls: bool,
    pub dedupe_repeated_calls: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            parallel_tool_calls: false,
            dedupe_repeated_calls: true,
        }
    }
}

/// [tools] 段：超时与各工具端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 纯计算类工具超时（秒）
    pub tool_timeout_secs: u64,
    /// 网络类工具超时（秒）
    pub network_timeout_secs: u64,
    pub search: SearchSection,
    pub weather: WeatherSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 10,
            network_timeout_secs: 15,
            search: SearchSection::default(),
            weather: WeatherSection::default(),
        }
    }
}

/// [tools.search] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub base_url: String,
    pub max_results: usize,
    pub default_results: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: crate::tools::search::DUCKDUCKGO_API.to_string(),
            max_results: 10,
            default_results: 3,
        }
    }
}

/// [tools.weather] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    pub base_url: String,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            base_url: crate::tools::weather::WTTR_BASE_URL.to_string(),
        }
    }
}

/// 解析后的后端选择
#[derive(Debug, Clone, PartialEq)]
pub enum BackendChoice {
    OpenAiCompatible {
        provider: String,
        base_url: Option<String>,
        model: String,
        api_key: String,
    },
    Mock,
}

impl AppConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.llm.retry.max_retries,
            base_delay: Duration::from_millis(self.llm.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.llm.retry.max_delay_ms),
        }
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            max_iterations: self.agent.max_iterations,
            context_turns: self.app.context_turns,
            model_timeout: Duration::from_secs(self.llm.timeouts.request),
            parallel_tool_calls: self.agent.parallel_tool_calls,
            dedupe_repeated_calls: self.agent.dedupe_repeated_calls,
        }
    }

    /// 按 provider 与可用密钥决定后端；env_key 为环境变量读取函数（测试可注入）
    pub fn resolve_backend_with(&self, env_key: impl Fn(&str) -> Option<String>) -> BackendChoice {
        let provider = self.llm.provider.to_lowercase();
        if provider == "mock" {
            return BackendChoice::Mock;
        }
        let groq = env_key("GROQ_API_KEY").filter(|k| !k.is_empty());
        let openai = env_key("OPENAI_API_KEY").filter(|k| !k.is_empty());
        let explicit = self.llm.api_key.clone().filter(|k| !k.is_empty());

        let (name, default_base, key) = match provider.as_str() {
            "groq" => ("groq", Some(GROQ_BASE_URL), explicit.or(groq)),
            "openai" => ("openai", None, explicit.or(openai)),
            _ => match (explicit, groq, openai) {
                (Some(k), _, _) => ("openai", None, Some(k)),
                (None, Some(k), _) => ("groq", Some(GROQ_BASE_URL), Some(k)),
                (None, None, Some(k)) => ("openai", None, Some(k)),
                (None, None, None) => ("openai", None, None),
            },
        };
        let Some(api_key) = key else {
            return BackendChoice::Mock;
        };
        let model = self.llm.model.clone().unwrap_or_else(|| match name {
            "groq" => crate::llm::GROQ_DEFAULT_MODEL.to_string(),
            _ => "gpt-4o-mini".to_string(),
        });
        BackendChoice::OpenAiCompatible {
            provider: name.to_string(),
            base_url: self.llm.base_url.clone().or(default_base.map(String::from)),
            model,
            api_key,
        }
    }

    pub fn resolve_backend(&self) -> BackendChoice {
        self.resolve_backend_with(|k| std::env::var(k).ok())
    }

    /// 读取系统提示词：显式路径 > config/prompts/system.txt > 内置默认
    pub fn system_prompt(&self) -> String {
        let explicit = self.app.system_prompt_path.clone();
        explicit
            .into_iter()
            .chain(
                ["config/prompts/system.txt", "../config/prompts/system.txt"]
                    .into_iter()
                    .map(PathBuf::from),
            )
            .find_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are AgentForge, an AI assistant with access to tools: \
web search, calculator, weather, notes and the current date and time.\n\
Use a tool only when it helps answer the request, and call each tool at most once per request.\n\
If a tool fails, explain the problem to the user instead of retrying it.\n\
Base your answers on tool results and say clearly when you cannot complete a task.";

/// 从 config 目录加载配置，环境变量 FORGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FORGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FORGE")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AgentError::ConfigError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |k| pairs.iter().find(|(n, _)| *n == k).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 5);
        assert_eq!(cfg.app.context_turns, 8);
        let opts = cfg.loop_options();
        assert_eq!(opts.model_timeout, Duration::from_secs(60));
        assert!(opts.dedupe_repeated_calls);
        assert_eq!(cfg.retry_config().max_retries, 3);
    }

    #[test]
    fn test_groq_key_preferred_in_auto_mode() {
        let cfg = AppConfig::default();
        let choice = cfg.resolve_backend_with(env(&[("GROQ_API_KEY", "gsk"), ("OPENAI_API_KEY", "sk")]));
        match choice {
            BackendChoice::OpenAiCompatible { provider, base_url, api_key, .. } => {
                assert_eq!(provider, "groq");
                assert_eq!(base_url.as_deref(), Some(GROQ_BASE_URL));
                assert_eq!(api_key, "gsk");
            }
            BackendChoice::Mock => panic!("expected groq backend"),
        }
    }

    #[test]
    fn test_openai_fallback_and_mock() {
        let cfg = AppConfig::default();
        let choice = cfg.resolve_backend_with(env(&[("OPENAI_API_KEY", "sk")]));
        assert!(matches!(
            choice,
            BackendChoice::OpenAiCompatible { ref provider, base_url: None, .. } if provider == "openai"
        ));
        assert_eq!(cfg.resolve_backend_with(env(&[])), BackendChoice::Mock);

        let mut forced = AppConfig::default();
        forced.llm.provider = "mock".into();
        assert_eq!(
            forced.resolve_backend_with(env(&[("OPENAI_API_KEY", "sk")])),
            BackendChoice::Mock
        );
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[agent]\nmax_iterations = 7\n[tools.search]\ndefault_results = 5\n",
        )
        .unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 7);
        assert_eq!(cfg.tools.search.default_results, 5);
        assert_eq!(cfg.tools.search.max_results, 10);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[agent]\nmax_iterations = \"lots\"\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert_eq!(err.reason_code(), "config_error");
        assert!(err.to_string().contains("max_iterations"));
    }
}
