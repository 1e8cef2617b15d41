//! AgentForge - Rust 工具调用智能体
//!
//! 模块划分：
//! - **agent**: Agent 门面（submit_user_message / list_session_stats / clear_session / list_notes）
//! - **config**: 应用配置加载（TOML + 环境变量），API Key 解析
//! - **core**: 错误分类、恢复策略、阶段状态机、会话监管
//! - **llm**: LLM 后端抽象与实现（OpenAI 兼容 / Groq / Mock / Scripted）
//! - **memory**: 会话轮次与笔记的 SQLite 持久化
//! - **react**: 有界工具调用循环与过程事件
//! - **tools**: 工具契约、注册表、执行器与内置工具（search、calculator、weather、notes、datetime）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{Agent, AgentBuilder};
pub use config::{load_config, AppConfig};
pub use core::AgentError;
