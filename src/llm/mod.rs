//! LLM 层：后端抽象与实现（OpenAI 兼容 / Groq / Mock / Scripted）

pub mod groq;
pub mod mock;
pub mod openai;
pub mod traits;

pub use groq::{create_groq_backend, GROQ_BASE_URL, GROQ_DEFAULT_MODEL};
pub use mock::{MockBackend, ScriptedBackend};
pub use openai::{OpenAiBackend, TokenUsage};
pub use traits::{BackendReply, BackendRequest, LlmBackend, LlmError};
