//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据后端错误决定 RetryAfter / FeedBack / Abort。
//! 工具层错误不在这里：执行器内被捕获为 ToolResult（status=error）并回灌给模型。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::StorageError;

/// Agent 运行过程中可能出现、需要上报给调用方的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 工具参数不符合声明的 schema（通常在执行器内就地恢复，不会上抛）
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    /// 后端在有限次退避重试后仍不可用
    #[error("LLM backend unavailable after {attempts} attempt(s): {source}")]
    BackendUnavailable {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    /// 迭代预算耗尽；partial 为尽力给出的部分回答
    #[error("Max iterations exceeded ({max})")]
    MaxIterationsExceeded { max: usize, partial: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 稳定的结构化原因码，供展示层或日志聚合使用
    pub fn reason_code(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation_error",
            AgentError::UnknownTool(_) => "unknown_tool",
            AgentError::DuplicateTool(_) => "duplicate_tool",
            AgentError::BackendUnavailable { .. } => "backend_unavailable",
            AgentError::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            AgentError::Storage(StorageError::NotFound(_)) => "not_found",
            AgentError::Storage(_) => "storage_error",
            AgentError::Cancelled => "cancelled",
            AgentError::ConfigError(_) => "config_error",
        }
    }
}

/// 恢复引擎根据后端错误给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待后重试同一次模型调用（不消耗迭代预算）
    RetryAfter(Duration),
    /// 将提示注入下一轮上下文，让模型自我修正（消耗一次迭代）
    FeedBack(String),
    /// 终止当前查询
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(AgentError::UnknownTool("x".into()).reason_code(), "unknown_tool");
        assert_eq!(
            AgentError::MaxIterationsExceeded { max: 5, partial: String::new() }.reason_code(),
            "max_iterations_exceeded"
        );
        assert_eq!(
            AgentError::Storage(StorageError::NotFound(3)).reason_code(),
            "not_found"
        );
        let err = AgentError::BackendUnavailable {
            attempts: 3,
            source: LlmError::Timeout,
        };
        assert_eq!(err.reason_code(), "backend_unavailable");
        assert!(err.to_string().contains("3 attempt"));
    }
}
