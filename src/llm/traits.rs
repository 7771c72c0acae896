//! 补全服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted 桩）实现 LlmClient：complete(messages) -> text | LlmError。
//! 凭据与端点属于环境配置，不进入编排核心。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// 补全服务错误（由引擎按指数退避重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("empty response")]
    EmptyResponse,
}

/// 补全客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
