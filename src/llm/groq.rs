//! Groq API 后端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.groq.com/openai/v1
//! - 默认模型: llama-3.3-70b-versatile（支持 tool calling）

use crate::llm::OpenAiBackend;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const GROQ_DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

/// 创建 Groq 后端；密钥由配置层解析后传入
pub fn create_groq_backend(model: Option<&str>, api_key: &str) -> OpenAiBackend {
    let model = model.filter(|m| !m.is_empty()).unwrap_or(GROQ_DEFAULT_MODEL);
    OpenAiBackend::new(Some(GROQ_BASE_URL), model, api_key).with_name(format!("groq:{model}"))
}
