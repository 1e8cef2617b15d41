//! 错误恢复引擎
//!
//! 根据后端错误返回 RecoveryAction：可重试错误（网络、限流、超时）按指数退避重试同一次调用，
//! 无法解析的回复回灌给模型自我修正，其余一律终止。

use std::time::Duration;

use crate::core::RecoveryAction;
use crate::llm::LlmError;

/// 退避重试配置
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    config: RetryConfig,
}

impl RecoveryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// base * 2^attempt，封顶 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as u64;
        let cap = self.config.max_delay.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << attempt.min(32)).min(cap);
        Duration::from_millis(delay)
    }

    /// attempt 为同一次模型调用已经重试过的次数（从 0 开始）
    pub fn on_backend_error(&self, err: &LlmError, attempt: u32) -> RecoveryAction {
        match err {
            LlmError::MalformedResponse(detail) => RecoveryAction::FeedBack(format!(
                "Your previous response could not be processed ({detail}). \
                 Reply with either a plain final answer or tool calls that use only the declared tools \
                 and their parameter schemas."
            )),
            e if e.is_transient() && attempt < self.config.max_retries => {
                let delay = match e {
                    LlmError::RateLimited {
                        retry_after_ms: Some(ms),
                    } => Duration::from_millis(*ms).min(self.config.max_delay),
                    _ => self.backoff(attempt),
                };
                RecoveryAction::RetryAfter(delay)
            }
            _ => RecoveryAction::Abort,
        }
    }
}
