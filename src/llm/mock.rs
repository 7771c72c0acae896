//! 确定性补全桩（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：从最后一条 User 消息中取 "Current Task:" 行，直接给出最终答案；
//!   评估提示词（"Evaluation Task:"）返回固定分数的 JSON。
//! - ScriptedLlmClient：按顺序返回预设响应，并记录每次收到的消息，便于断言上下文拼接。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};
use crate::workflow::evaluation::EVALUATION_PREFIX;

const MOCK_SCORE: u32 = 5;

/// Mock 客户端：对任何任务直接给出确定性的最终答案
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        if let Some(task) = last_user.lines().find_map(|l| l.strip_prefix(EVALUATION_PREFIX)) {
            return Ok(serde_json::json!({
                "score": MOCK_SCORE,
                "feedback": format!("[mock] no review performed for {}", task.trim()),
            })
            .to_string());
        }

        let task_line = last_user
            .lines()
            .find_map(|l| l.strip_prefix("Current Task:"))
            .unwrap_or(last_user)
            .trim();

        Ok(format!("Final Answer: [mock] {}", task_line))
    }
}

/// 脚本化客户端：每次 complete 弹出队首响应；队列为空时返回 fallback（未设置则报错）
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<Result<String, LlmError>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用都返回同一错误
    pub fn failing(err: LlmError) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(Err(err)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一个错误响应（按顺序出队）
    pub fn then_error(self, err: LlmError) -> Self {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(err));
        }
        self
    }

    /// 追加一个正常响应
    pub fn then(self, response: impl Into<String>) -> Self {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Ok(response.into()));
        }
        self
    }

    /// 脚本耗尽后一直返回该响应
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(Ok(response.into()));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 所有调用收到的完整消息列表（按调用顺序）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(r) => r,
            None => self
                .fallback
                .clone()
                .unwrap_or_else(|| Err(LlmError::ApiError("script exhausted".to_string()))),
        }
    }
}
