//! OpenAI 兼容 API 后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url，OpenAI / Groq / 自建代理）。
//! 请求与响应走 byot（自带类型）接口，以 JSON 组装 tools / tool_calls，自己解析回复：
//! 这样可以把「结构缺失」与「网络失败」区分开，前者作为 MalformedResponse 交还给循环。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{BackendReply, BackendRequest, LlmBackend, LlmError};
use crate::memory::{ConversationTurn, Role};
use crate::tools::ToolCallRequest;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容后端：持有 Client、模型名与采样参数
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    name: String,
    pub usage: TokenUsage,
}

impl OpenAiBackend {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            name: format!("openai:{model}"),
            usage: TokenUsage::new(),
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 组装 chat/completions 请求体
    pub fn build_request_body(&self, request: &BackendRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": to_openai_messages(request),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.parameters_json_schema(),
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn call_id(req: &ToolCallRequest, index: usize) -> String {
    if req.id.is_empty() {
        format!("call_{index}")
    } else {
        req.id.clone()
    }
}

fn push_turn(messages: &mut Vec<Value>, turn: &ConversationTurn) {
    match turn.role {
        Role::User => messages.push(json!({"role": "user", "content": turn.content})),
        Role::Assistant => messages.push(json!({"role": "assistant", "content": turn.content})),
        Role::Tool => {
            // 一个工具轮次 = 一条带 tool_calls 的 assistant 消息 + 每个调用一条 tool 消息
            if turn.tool_calls.is_empty() {
                return;
            }
            let calls: Vec<Value> = turn
                .tool_calls
                .iter()
                .enumerate()
                .map(|(i, rec)| {
                    json!({
                        "id": call_id(&rec.request, i),
                        "type": "function",
                        "function": {
                            "name": rec.request.tool_name,
                            "arguments": rec.request.arguments.to_string(),
                        }
                    })
                })
                .collect();
            messages.push(json!({"role": "assistant", "content": Value::Null, "tool_calls": calls}));
            for (i, rec) in turn.tool_calls.iter().enumerate() {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id(&rec.request, i),
                    "content": rec.result.to_model_content(),
                }));
            }
        }
    }
}

/// 有序轮次 → OpenAI messages：system 在前，本次查询的临时指令在末尾
pub fn to_openai_messages(request: &BackendRequest<'_>) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.turns.len() + request.instructions.len() + 1);
    if !request.system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": request.system_prompt}));
    }
    for turn in request.turns {
        push_turn(&mut messages, turn);
    }
    for instruction in request.instructions {
        messages.push(json!({"role": "user", "content": instruction}));
    }
    messages
}

/// 解析 chat/completions 响应为 BackendReply
pub fn parse_reply(response: &Value) -> Result<BackendReply, LlmError> {
    let message = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::MalformedResponse("response has no choices".to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let raw_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if raw_calls.is_empty() {
        return text
            .map(BackendReply::FinalAnswer)
            .ok_or_else(|| LlmError::MalformedResponse("empty response".to_string()));
    }

    let mut calls = Vec::with_capacity(raw_calls.len());
    for (i, raw) in raw_calls.iter().enumerate() {
        let function = raw
            .get("function")
            .ok_or_else(|| LlmError::MalformedResponse(format!("tool call {i} has no function")))?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LlmError::MalformedResponse(format!("tool call {i} has no name")))?;
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) if s.trim().is_empty() => json!({}),
            // 参数不是合法 JSON 时原样保留为字符串，由 schema 校验给出 not-an-object 反馈
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
            Some(v) => v.clone(),
            None => json!({}),
        };
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("call_{i}"));
        calls.push(ToolCallRequest::new(id, name, arguments));
    }
    Ok(BackendReply::ToolCalls { calls, text })
}

/// async-openai 错误 → LlmError（可重试 / 不可重试）
fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout,
        OpenAIError::Reqwest(e) => {
            if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
                LlmError::RateLimited { retry_after_ms: None }
            } else {
                LlmError::Network(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => classify_api_error(api),
        e @ OpenAIError::JSONDeserialize(..) => LlmError::MalformedResponse(e.to_string()),
        other => LlmError::Rejected(other.to_string()),
    }
}

/// 服务端错误体按 type / code 分类
///
/// Groq 在模型生成的工具调用无法解析时返回 400 + `tool_use_failed`（附 `failed_generation`），
/// 这类错误交给循环回灌给模型，而不是终止查询。
fn classify_api_error(api: ApiError) -> LlmError {
    let kind = api.r#type.as_deref().unwrap_or_default();
    let code = api.code.as_deref().unwrap_or_default();
    let is = |names: &[&str]| names.iter().any(|n| *n == kind || *n == code);

    if is(&["tool_use_failed", "failed_generation"]) || api.message.contains("failed_generation") {
        return LlmError::MalformedResponse(api.message);
    }
    if is(&["rate_limit_exceeded", "rate_limit_error", "requests", "tokens"]) {
        return LlmError::RateLimited { retry_after_ms: None };
    }
    if is(&[
        "server_error",
        "overloaded_error",
        "service_unavailable",
        "internal_server_error",
        "api_error",
    ]) {
        return LlmError::Network(api.to_string());
    }
    LlmError::Rejected(api.to_string())
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<BackendReply, LlmError> {
        let body = self.build_request_body(request);
        let response: Value = self
            .client
            .chat()
            .create_byot(body)
            .await
            .map_err(classify)?;

        if let Some(usage) = response.get("usage") {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            self.usage.add(prompt, completion);
        }

        parse_reply(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCallRecord;
    use crate::tools::{ParamSpec, ParamType, ToolResult, ToolSpec};
    use std::time::Duration;

    #[test]
    fn test_tool_turn_becomes_assistant_plus_tool_messages() {
        let req = ToolCallRequest::new("call_a", "calculator", json!({"expression": "1+1"}));
        let record = ToolCallRecord {
            request: req,
            result: ToolResult::ok("2", Duration::from_millis(1)),
        };
        let turns = vec![
            ConversationTurn::user("s", "what is 1+1"),
            ConversationTurn::tool("s", vec![record]),
        ];
        let instructions = vec!["Answer from the results above.".to_string()];
        let request = BackendRequest {
            system_prompt: "be brief",
            turns: &turns,
            instructions: &instructions,
            tools: &[],
        };
        let msgs = to_openai_messages(&request);
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[2]["tool_calls"][0]["id"], "call_a");
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["tool_call_id"], "call_a");
        assert_eq!(msgs[3]["content"], "2");
        assert_eq!(msgs[4]["content"], "Answer from the results above.");
    }

    #[test]
    fn test_tools_only_advertised_when_present() {
        let backend = OpenAiBackend::new(Some("http://localhost:1"), "test-model", "sk-test");
        let empty = BackendRequest {
            system_prompt: "",
            turns: &[],
            instructions: &[],
            tools: &[],
        };
        assert!(backend.build_request_body(&empty).get("tools").is_none());

        let tools = vec![ToolSpec::new("calculator", "math")
            .param(ParamSpec::required("expression", ParamType::String, "expr"))];
        let request = BackendRequest { tools: &tools, ..empty };
        let body = backend.build_request_body(&request);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "calculator");
    }

    #[test]
    fn test_parse_final_answer() {
        let resp = json!({"choices": [{"message": {"role": "assistant", "content": " Paris. "}}]});
        assert_eq!(parse_reply(&resp).unwrap(), BackendReply::FinalAnswer("Paris.".into()));
    }

    #[test]
    fn test_parse_tool_calls_keeps_order_and_raw_arguments() {
        let resp = json!({"choices": [{"message": {
            "content": null,
            "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "web_search", "arguments": "{\"query\":\"rust\"}"}},
                {"id": "c2", "type": "function", "function": {"name": "calculator", "arguments": "not json"}}
            ]
        }}]});
        match parse_reply(&resp).unwrap() {
            BackendReply::ToolCalls { calls, text } => {
                assert!(text.is_none());
                assert_eq!(calls[0].tool_name, "web_search");
                assert_eq!(calls[0].arguments["query"], "rust");
                assert_eq!(calls[1].arguments, Value::String("not json".into()));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_reply(&json!({})), Err(LlmError::MalformedResponse(_))));
        let empty = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(matches!(parse_reply(&empty), Err(LlmError::MalformedResponse(_))));
        let nameless = json!({"choices": [{"message": {"tool_calls": [{"id": "x", "function": {}}]}}]});
        assert!(matches!(parse_reply(&nameless), Err(LlmError::MalformedResponse(_))));
    }

    fn api_error(kind: Option<&str>, code: Option<&str>, message: &str) -> OpenAIError {
        OpenAIError::ApiError(ApiError {
            message: message.to_string(),
            r#type: kind.map(String::from),
            param: None,
            code: code.map(String::from),
        })
    }

    #[test]
    fn test_groq_tool_use_failed_is_malformed() {
        let err = classify(api_error(
            Some("invalid_request_error"),
            Some("tool_use_failed"),
            "Failed to call a function. Please adjust your prompt. See 'failed_generation' for more details.",
        ));
        assert!(matches!(err, LlmError::MalformedResponse(ref m) if m.contains("Failed to call a function")));
        // 恢复引擎据此回灌而不是终止
        let action = crate::core::RecoveryEngine::default().on_backend_error(&err, 0);
        assert!(matches!(action, crate::core::RecoveryAction::FeedBack(_)));
    }

    #[test]
    fn test_server_side_api_errors_are_transient() {
        let server = classify(api_error(
            Some("server_error"),
            None,
            "The server had an error while processing your request. Sorry about that!",
        ));
        assert!(matches!(server, LlmError::Network(_)));
        assert!(server.is_transient());

        let overloaded = classify(api_error(Some("overloaded_error"), None, "Overloaded"));
        assert!(overloaded.is_transient());

        let limited = classify(api_error(Some("tokens"), Some("rate_limit_exceeded"), "Rate limit reached"));
        assert!(matches!(limited, LlmError::RateLimited { .. }));
    }

    #[test]
    fn test_auth_errors_are_rejected() {
        let err = classify(api_error(
            Some("invalid_request_error"),
            Some("invalid_api_key"),
            "Incorrect API key provided",
        ));
        assert!(matches!(err, LlmError::Rejected(ref m) if m.contains("invalid_api_key")));
        assert!(!err.is_transient());
    }
}
