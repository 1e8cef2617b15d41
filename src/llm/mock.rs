//! Mock 后端（无需 API）
//!
//! - MockBackend：回显最后一条用户消息作为最终回答，未配置密钥时使用，便于本地跑通流程
//! - ScriptedBackend：按顺序吐出预设回复，并记录每次收到的请求，供测试断言上下文内容

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{BackendReply, BackendRequest, LlmBackend, LlmError};
use crate::memory::{ConversationTurn, Role};
use crate::tools::ToolCallRequest;

/// 回显最后一条 user 轮次
#[derive(Debug, Default)]
pub struct MockBackend;

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<BackendReply, LlmError> {
        let last_user = request
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or("(no input)");
        Ok(BackendReply::FinalAnswer(format!("Echo from Mock: {last_user}")))
    }
}

/// 一次被记录的请求快照
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub turns: Vec<ConversationTurn>,
    pub instructions: Vec<String>,
    pub tool_names: Vec<String>,
}

/// 预设回复队列；队列耗尽后重复最后一条（repeat_last）或返回 MalformedResponse
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<BackendReply, LlmError>>>,
    repeat: Option<Result<BackendReply, LlmError>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<BackendReply, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 每次都返回同一条回复
    pub fn repeating(reply: Result<BackendReply, LlmError>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(reply),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn final_answer(text: impl Into<String>) -> Result<BackendReply, LlmError> {
        Ok(BackendReply::FinalAnswer(text.into()))
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Result<BackendReply, LlmError> {
        Ok(BackendReply::ToolCalls { calls, text: None })
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<BackendReply, LlmError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(RecordedRequest {
                turns: request.turns.to_vec(),
                instructions: request.instructions.to_vec(),
                tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            });
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        match (next, &self.repeat) {
            (Some(reply), _) => reply,
            (None, Some(reply)) => reply.clone(),
            (None, None) => Err(LlmError::MalformedResponse("script exhausted".to_string())),
        }
    }
}
