//! 工具执行器
//!
//! 持有 ToolRegistry 与默认超时，execute(tool_name, args) 依次做：查找 → schema 校验 → 超时内执行，
//! 任何失败（未知工具、参数错误、工具报错、超时）都归一化为 status=error 的 ToolResult，绝不上抛；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{ToolRegistry, ToolSpec};

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// 后端分配的调用 id（OpenAI tool_call_id），用于把结果回填到对应调用
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// 用于重复调用检测的键：工具名 + 规范化后的参数
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.tool_name, self.arguments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// 失败类别，便于日志聚合与展示层区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    Validation,
    Execution,
    Timeout,
}

/// 统一的工具结果信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub elapsed_ms: u64,
}

impl ToolResult {
    pub fn ok(payload: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: ToolStatus::Ok,
            payload: Some(payload.into()),
            error_kind: None,
            error_message: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn error(kind: ToolErrorKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: ToolStatus::Error,
            payload: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// 回灌给模型的文本
    pub fn to_model_content(&self) -> String {
        match self.status {
            ToolStatus::Ok => self.payload.clone().unwrap_or_default(),
            ToolStatus::Error => format!(
                "Error: {}",
                self.error_message.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// 工具执行器：对每次调用施加校验与超时，并将一切失败捕获为 ToolResult
pub struct ToolExecutor {
    registry: ToolRegistry,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn describe_all(&self) -> Vec<ToolSpec> {
        self.registry.describe_all()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行指定工具；永不返回 Err，失败体现在 ToolResult.status
    pub async fn execute(&self, tool_name: &str, args: Value) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = self.run(tool_name, args, start).await;

        let outcome = match result.error_kind {
            None => "ok",
            Some(ToolErrorKind::UnknownTool) => "unknown_tool",
            Some(ToolErrorKind::Validation) => "invalid_arguments",
            Some(ToolErrorKind::Execution) => "error",
            Some(ToolErrorKind::Timeout) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": result.elapsed_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    async fn run(&self, tool_name: &str, args: Value, start: Instant) -> ToolResult {
        let tool = match self.registry.lookup(tool_name) {
            Ok(t) => t,
            Err(e) => {
                let known = self.registry.tool_names().join(", ");
                return ToolResult::error(
                    ToolErrorKind::UnknownTool,
                    format!("{e}. Available tools: {known}"),
                    start.elapsed(),
                );
            }
        };
        if let Some(spec) = self.registry.spec(tool_name) {
            if let Err(e) = spec.validate_arguments(&args) {
                return ToolResult::error(
                    ToolErrorKind::Validation,
                    format!("Invalid arguments for {tool_name}: {e}"),
                    start.elapsed(),
                );
            }
        }
        let budget = tool.timeout().unwrap_or(self.default_timeout);
        match timeout(budget, tool.execute(args)).await {
            Ok(Ok(content)) => ToolResult::ok(content, start.elapsed()),
            Ok(Err(e)) => ToolResult::error(ToolErrorKind::Execution, e, start.elapsed()),
            Err(_) => ToolResult::error(ToolErrorKind::Timeout, "timeout", start.elapsed()),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
