//! 循环过程事件：供展示层实时显示迭代、工具调用、观察与最终回复

use serde::Serialize;

use crate::core::AgentPhase;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 第几次模型调用（从 1 开始）
    StepUpdate { step: usize, max_steps: usize },
    Phase { phase: AgentPhase },
    /// 正在等待模型回复
    Thinking,
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 恢复动作（退避重试 / 回灌提示 / 重复调用拦截）
    Recovery { action: String, detail: String },
    FinalAnswer { text: String },
    /// 迭代预算耗尽，附部分回答
    MaxIterations { partial: String },
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    Error { reason_code: String, text: String },
}
