//! 错误恢复引擎
//!
//! 根据 CrewError 类型与已失败次数返回 RecoveryAction：补全服务错误按指数退避重试，
//! 输出校验失败给出纠正提示，其余错误直接终止。

use std::time::Duration;

use crate::core::{CrewError, RecoveryAction};
use crate::llm::LlmError;

/// 指数退避策略：第 n 次失败后等待 initial * multiplier^(n-1)，不超过 max
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    /// 不等待（测试与确定性桩使用）
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0)
    }

    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(32) as i32;
        let max_ms = self.max.as_millis() as f64;
        let ms = (self.initial.as_millis() as f64 * self.multiplier.powi(exp)).min(max_ms);
        Duration::from_millis(ms as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10), 2.0)
    }
}

/// 语义化错误恢复：将错误映射为可执行动作（退避重试 / 纠正重试 / 终止）
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// failed_attempts：包含本次在内，该错误类别已经失败的次数（从 1 开始）
    pub fn handle(&self, err: &CrewError, failed_attempts: u32) -> RecoveryAction {
        match err {
            CrewError::Service(LlmError::RateLimited { retry_after_ms })
                if failed_attempts <= self.max_retries =>
            {
                let hinted = Duration::from_millis(*retry_after_ms);
                RecoveryAction::RetryAfter(self.backoff.delay_for(failed_attempts).max(hinted))
            }
            CrewError::Service(_) if failed_attempts <= self.max_retries => {
                RecoveryAction::RetryAfter(self.backoff.delay_for(failed_attempts))
            }
            CrewError::OutputValidation { reason, .. } if failed_attempts <= 1 => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Your previous final answer was rejected: {reason}. \
                    Produce a corrected final answer that satisfies the expected output. \
                    Start it with \"Final Answer:\"."
                ))
            }
            _ => RecoveryAction::Abort,
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3, BackoffPolicy::default())
    }
}
