//! 会话轮次：user / assistant / tool 三种角色
//!
//! 轮次只追加不修改；tool 轮次携带本批次实际执行的 (请求, 结果) 对，
//! 因此即使窗口截断也能独立还原成「assistant 发起调用 + tool 返回」的上下文。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::{ToolCallRequest, ToolResult};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// 一次已执行的工具调用：请求与结果成对保存
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub request: ToolCallRequest,
    pub result: ToolResult,
}

/// 单条会话轮次
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ConversationTurn {
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content, Vec::new())
    }

    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content, Vec::new())
    }

    /// 一批工具调用对应一条 tool 轮次；content 为简短摘要（如 "search: ok; save_note: error"）
    pub fn tool(session_id: impl Into<String>, records: Vec<ToolCallRecord>) -> Self {
        let summary = records
            .iter()
            .map(|r| {
                let status = if r.result.is_ok() { "ok" } else { "error" };
                format!("{}: {}", r.request.tool_name, status)
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::new(session_id, Role::Tool, summary, records)
    }

    fn new(
        session_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls,
        }
    }
}

/// 会话统计（展示层的 list_session_stats）
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub turn_count: u64,
    pub user_turns: u64,
    pub assistant_turns: u64,
    pub tool_turns: u64,
    pub tool_calls: u64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}
