//! LLM 后端抽象
//!
//! 所有后端（OpenAI 兼容 / Groq / Mock / Scripted）实现 LlmBackend：
//! 输入为「有序对话轮次 + 可用工具 schema」，输出为 BackendReply（最终回答 或 有序工具调用列表）。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::ConversationTurn;
use crate::tools::{ToolCallRequest, ToolSpec};

/// 一次模型调用的完整上下文
#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub system_prompt: &'a str,
    /// 按时间顺序排列的最近对话轮次（来自 MemoryStore）
    pub turns: &'a [ConversationTurn],
    /// 本次查询内的临时指令（如解析失败反馈、重复调用提醒），不落盘
    pub instructions: &'a [String],
    /// registry.describe_all() 的结果，顺序即注册顺序
    pub tools: &'a [ToolSpec],
}

/// 后端回复：最终回答 或 有序工具调用
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    FinalAnswer(String),
    ToolCalls {
        calls: Vec<ToolCallRequest>,
        /// 模型随工具调用一起输出的文本（可能为空）
        text: Option<String>,
    },
}

/// 后端错误：区分可重试（网络、限流、超时）与不可重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request timed out")]
    Timeout,

    /// 响应无法解析（结构缺失、JSON 错误等）；由循环回灌给模型自我修正
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// 鉴权失败、参数非法等，重试无意义
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::RateLimited { .. } | LlmError::Timeout
        )
    }
}

/// LLM 后端 trait
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<BackendReply, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Network("reset".into()).is_transient());
        assert!(LlmError::RateLimited { retry_after_ms: Some(1000) }.is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(!LlmError::MalformedResponse("no choices".into()).is_transient());
        assert!(!LlmError::Rejected("401".into()).is_transient());
    }
}
