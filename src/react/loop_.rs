//! 有界工具调用循环
//!
//! 用户输入落盘 -> 从存储重建上下文 -> 调模型 -> 若为工具调用则按请求顺序执行并整批落盘 -> 下一轮；
//! 若为最终回答则落盘并返回。模型调用次数受 max_iterations 约束，耗尽时返回尽力而为的部分回答。
//! 后端的可重试错误按退避重试同一次调用（不计入预算），无法解析的回复作为临时指令回灌（计入预算）。
//! 可选 event_tx：向展示层推送 StepUpdate / ToolCall / Observation / FinalAnswer 等事件。

use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentPhase, PhaseMachine, RecoveryAction, RecoveryEngine};
use crate::llm::{BackendReply, BackendRequest, LlmBackend, LlmError};
use crate::memory::{ConversationTurn, MemoryStore, ToolCallRecord};
use crate::react::ReactEvent;
use crate::tools::{ToolCallRequest, ToolExecutor, ToolSpec};

/// 工具结果在部分回答中的最大字符数
const PARTIAL_RESULT_CHARS: usize = 200;
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

const REPEATED_CALL_NUDGE: &str =
    "Please provide your final answer based on the previous tool results. Do not call tools again.";
const EMPTY_TOOL_CALLS_NUDGE: &str =
    "Your previous response requested an empty list of tool calls. Either call a declared tool or answer directly.";
const NO_PROGRESS_NOTICE: &str =
    "Maximum iterations reached. Try breaking the task into smaller parts.";

/// 循环参数（由配置层给出）
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub max_iterations: usize,
    /// 每次模型调用带上的最近轮次数
    pub context_turns: usize,
    /// 单次模型调用超时
    pub model_timeout: Duration,
    /// 同一批工具调用是否并发执行（结果仍按请求顺序重组）
    pub parallel_tool_calls: bool,
    /// 整批调用都已执行过时不再重复执行
    pub dedupe_repeated_calls: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            context_turns: 8,
            model_timeout: Duration::from_secs(60),
            parallel_tool_calls: false,
            dedupe_repeated_calls: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    MaxIterationsExceeded,
}

/// 一次查询的结果：回答（或部分回答）与用量
#[derive(Debug, Clone)]
pub struct ReactOutcome {
    pub answer: String,
    pub status: LoopStatus,
    /// 实际发生的模型调用轮次
    pub iterations: usize,
    pub tool_calls: usize,
}

impl ReactOutcome {
    /// 预算耗尽时转换为 MaxIterationsExceeded（携带部分回答）
    pub fn into_result(self, max: usize) -> Result<String, AgentError> {
        match self.status {
            LoopStatus::Completed => Ok(self.answer),
            LoopStatus::MaxIterationsExceeded => Err(AgentError::MaxIterationsExceeded {
                max,
                partial: self.answer,
            }),
        }
    }
}

/// 循环依赖：后端、执行器、存储、恢复引擎均由调用方显式传入
pub struct ReactSession<'a> {
    pub backend: &'a dyn LlmBackend,
    pub executor: &'a ToolExecutor,
    pub store: &'a dyn MemoryStore,
    pub recovery: &'a RecoveryEngine,
    pub system_prompt: &'a str,
    pub options: LoopOptions,
    pub cancel_token: CancellationToken,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<ReactEvent>>,
}

impl<'a> ReactSession<'a> {
    pub fn new(
        backend: &'a dyn LlmBackend,
        executor: &'a ToolExecutor,
        store: &'a dyn MemoryStore,
        recovery: &'a RecoveryEngine,
    ) -> Self {
        Self {
            backend,
            executor,
            store,
            recovery,
            system_prompt: "",
            options: LoopOptions::default(),
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &'a str) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send_event(&self, ev: ReactEvent) {
        if let Some(t) = self.event_tx {
            let _ = t.send(ev);
        }
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

/// 预算耗尽时的部分回答：优先用模型最后说过的话，否则汇总已拿到的工具结果
fn partial_answer(last_text: Option<&str>, gathered: &[ToolCallRecord]) -> String {
    if let Some(text) = last_text {
        return text.to_string();
    }
    if gathered.is_empty() {
        return NO_PROGRESS_NOTICE.to_string();
    }
    let mut summary = String::from("I've gathered the following information:\n\n");
    for rec in gathered {
        summary.push_str(&format!(
            "- Used {}: {}\n\n",
            rec.request.tool_name,
            preview(&rec.result.to_model_content(), PARTIAL_RESULT_CHARS)
        ));
    }
    summary.push_str("However, I reached the maximum number of steps. Please ask a more specific question.");
    summary
}

/// 单次查询的运行状态（仅在查询期间存在，不落盘）
struct Run<'s, 'a> {
    session: &'s ReactSession<'a>,
    session_id: &'s str,
    phase: PhaseMachine,
}

impl Run<'_, '_> {
    fn enter(&mut self, to: AgentPhase) {
        match self.phase.transition(to) {
            Ok(phase) => self.session.send_event(ReactEvent::Phase { phase }),
            Err(e) => tracing::warn!(session_id = %self.session_id, error = %e, "phase transition rejected"),
        }
    }

    fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.session.cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// 调一次模型：可重试错误在这里退避重试；无法解析的回复返回 Ok(Err(反馈))
    async fn call_backend(
        &self,
        request: &BackendRequest<'_>,
        iteration: usize,
    ) -> Result<Result<BackendReply, String>, AgentError> {
        let s = self.session;
        let mut attempt: u32 = 0;
        loop {
            s.send_event(ReactEvent::Thinking);
            let call = tokio::time::timeout(s.options.model_timeout, s.backend.complete(request));
            let result = tokio::select! {
                _ = s.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                r = call => r,
            };
            let err = match result {
                Ok(Ok(reply)) => return Ok(Ok(reply)),
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout,
            };
            match s.recovery.on_backend_error(&err, attempt) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        iteration,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backend call failed, retrying"
                    );
                    s.send_event(ReactEvent::Recovery {
                        action: "retry".to_string(),
                        detail: err.to_string(),
                    });
                    attempt += 1;
                    tokio::select! {
                        _ = s.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::FeedBack(msg) => {
                    tracing::warn!(session_id = %self.session_id, iteration, error = %err, "malformed backend reply");
                    s.send_event(ReactEvent::Recovery {
                        action: "feedback".to_string(),
                        detail: err.to_string(),
                    });
                    return Ok(Err(msg));
                }
                RecoveryAction::Abort => {
                    return Err(AgentError::BackendUnavailable {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }

    /// 执行一批工具调用；结果顺序与请求顺序一致
    async fn dispatch(&self, calls: Vec<ToolCallRequest>) -> Result<Vec<ToolCallRecord>, AgentError> {
        let s = self.session;
        for call in &calls {
            s.send_event(ReactEvent::ToolCall {
                tool: call.tool_name.clone(),
                args: call.arguments.clone(),
            });
        }
        let results = if s.options.parallel_tool_calls {
            let batch = join_all(
                calls
                    .iter()
                    .map(|c| s.executor.execute(&c.tool_name, c.arguments.clone())),
            );
            tokio::select! {
                _ = s.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                r = batch => r,
            }
        } else {
            let mut out = Vec::with_capacity(calls.len());
            for c in &calls {
                let result = tokio::select! {
                    _ = s.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                    r = s.executor.execute(&c.tool_name, c.arguments.clone()) => r,
                };
                out.push(result);
            }
            out
        };

        let records: Vec<ToolCallRecord> = calls
            .into_iter()
            .zip(results)
            .map(|(request, result)| ToolCallRecord { request, result })
            .collect();
        for rec in &records {
            s.send_event(ReactEvent::Observation {
                tool: rec.request.tool_name.clone(),
                ok: rec.result.is_ok(),
                preview: preview(&rec.result.to_model_content(), OBSERVATION_PREVIEW_CHARS),
            });
        }
        Ok(records)
    }

    async fn run(&mut self, user_input: &str) -> Result<ReactOutcome, AgentError> {
        let s = self.session;
        let opts = &s.options;
        let max_iterations = opts.max_iterations.max(1);

        s.store.append_turn(&ConversationTurn::user(self.session_id, user_input))?;
        let tools: Vec<ToolSpec> = s.executor.describe_all();

        let mut instructions: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut gathered: Vec<ToolCallRecord> = Vec::new();
        let mut last_text: Option<String> = None;
        let mut iterations = 0;
        // 本次查询已写入的轮次（用户轮次 + 各批 tool 轮次）
        let mut query_turns = 1;

        self.enter(AgentPhase::ModelCall);
        while iterations < max_iterations {
            self.check_cancelled()?;
            iterations += 1;
            s.send_event(ReactEvent::StepUpdate {
                step: iterations,
                max_steps: max_iterations,
            });
            tracing::debug!(session_id = %self.session_id, iteration = iterations, "model call");

            // 每轮都从存储重建上下文，存储是会话历史的唯一来源；窗口至少覆盖本次查询的全部轮次
            let window = opts.context_turns.max(query_turns);
            let turns = s.store.recent_turns(self.session_id, window)?;
            let request = BackendRequest {
                system_prompt: s.system_prompt,
                turns: &turns,
                instructions: &instructions,
                tools: &tools,
            };
            let reply = match self.call_backend(&request, iterations).await? {
                Ok(reply) => reply,
                Err(feedback) => {
                    instructions.push(feedback);
                    self.enter(AgentPhase::ModelCall);
                    continue;
                }
            };
            instructions.clear();

            let (calls, text) = match reply {
                BackendReply::FinalAnswer(text) => {
                    return self.finish(text, iterations, gathered.len());
                }
                BackendReply::ToolCalls { calls, text } => (calls, text),
            };
            if let Some(t) = text.filter(|t| !t.trim().is_empty()) {
                last_text = Some(t);
            }
            if calls.is_empty() {
                match last_text.take() {
                    Some(t) => return self.finish(t, iterations, gathered.len()),
                    None => {
                        instructions.push(EMPTY_TOOL_CALLS_NUDGE.to_string());
                        self.enter(AgentPhase::ModelCall);
                        continue;
                    }
                }
            }

            if opts.dedupe_repeated_calls && calls.iter().all(|c| seen.contains(&c.dedupe_key())) {
                tracing::info!(
                    session_id = %self.session_id,
                    iteration = iterations,
                    calls = calls.len(),
                    "repeated tool calls skipped"
                );
                s.send_event(ReactEvent::Recovery {
                    action: "dedupe".to_string(),
                    detail: REPEATED_CALL_NUDGE.to_string(),
                });
                instructions.push(REPEATED_CALL_NUDGE.to_string());
                self.enter(AgentPhase::ModelCall);
                continue;
            }

            self.enter(AgentPhase::ToolDispatch);
            let calls: Vec<ToolCallRequest> = calls
                .into_iter()
                .map(|mut c| {
                    if c.id.is_empty() {
                        c.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    }
                    c
                })
                .collect();
            let records = self.dispatch(calls).await?;
            // 整批落盘后才进入下一次模型调用；取消时部分结果不写入
            s.store
                .append_turn(&ConversationTurn::tool(self.session_id, records.clone()))?;
            query_turns += 1;
            for rec in &records {
                seen.insert(rec.request.dedupe_key());
            }
            gathered.extend(records);
            self.enter(AgentPhase::ModelCall);
        }

        let partial = partial_answer(last_text.as_deref(), &gathered);
        tracing::warn!(
            session_id = %self.session_id,
            max_iterations,
            tool_calls = gathered.len(),
            "iteration budget exhausted"
        );
        s.store
            .append_turn(&ConversationTurn::assistant(self.session_id, partial.clone()))?;
        self.enter(AgentPhase::Failed);
        s.send_event(ReactEvent::MaxIterations {
            partial: partial.clone(),
        });
        Ok(ReactOutcome {
            answer: partial,
            status: LoopStatus::MaxIterationsExceeded,
            iterations,
            tool_calls: gathered.len(),
        })
    }

    fn finish(&mut self, text: String, iterations: usize, tool_calls: usize) -> Result<ReactOutcome, AgentError> {
        self.enter(AgentPhase::FinalAnswer);
        self.session
            .store
            .append_turn(&ConversationTurn::assistant(self.session_id, text.clone()))?;
        self.enter(AgentPhase::Done);
        self.session.send_event(ReactEvent::FinalAnswer { text: text.clone() });
        Ok(ReactOutcome {
            answer: text,
            status: LoopStatus::Completed,
            iterations,
            tool_calls,
        })
    }
}

/// 处理一条用户消息，直到得到最终回答、预算耗尽或出错
///
/// 工具层错误不会出现在返回值里（已作为 error 结果回灌给模型）；
/// 存储错误、后端不可用、取消则立即上抛。
pub async fn run_query(
    session: &ReactSession<'_>,
    session_id: &str,
    user_input: &str,
) -> Result<ReactOutcome, AgentError> {
    let started = std::time::Instant::now();
    let mut run = Run {
        session,
        session_id,
        phase: PhaseMachine::new(),
    };
    let result = run.run(user_input).await;
    match &result {
        Ok(outcome) => {
            tracing::info!(
                session_id = %session_id,
                iterations = outcome.iterations,
                tool_calls = outcome.tool_calls,
                status = ?outcome.status,
                duration_ms = started.elapsed().as_millis() as u64,
                "query finished"
            );
        }
        Err(e) => {
            run.enter(AgentPhase::Failed);
            tracing::warn!(
                session_id = %session_id,
                reason = e.reason_code(),
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "query failed"
            );
            session.send_event(ReactEvent::Error {
                reason_code: e.reason_code().to_string(),
                text: e.to_string(),
            });
        }
    }
    let (prompt_tokens, completion_tokens, total_tokens) = session.backend.token_usage();
    if total_tokens > 0 {
        session.send_event(ReactEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        });
    }
    result
}
