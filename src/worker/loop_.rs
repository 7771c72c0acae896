//! Worker 推理主循环
//!
//! Plan -> Act (Tool / Delegate) -> Observe -> 下一轮 Plan，直到给出最终答案或达到最大轮数。
//! 工具失败、越权工具与无法解析的输出都作为 Observation 反馈，不中断循环；
//! 补全服务错误与取消直接返回，交给引擎按重试策略处理。

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{send_event, CrewError, RunEvent, ToolErrorKind, WorkerErrorKind};
use crate::llm::{LlmError, Message};
use crate::tools::ToolInvoker;
use crate::worker::delegation::DelegationHandler;
use crate::worker::planner::{parse_step, Step, ToolCall};
use crate::worker::{prompt, Worker};
use crate::workflow::types::TaskDefinition;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 一次 act 调用所需的全部输入
pub struct WorkerSession<'a> {
    pub task: &'a TaskDefinition,
    /// 已拼接好的上游上下文
    pub context: &'a str,
    pub invoker: &'a ToolInvoker,
    pub cancel_token: CancellationToken,
    /// 上一次输出未通过校验时的纠正提示
    pub feedback: Option<&'a str>,
    /// 可选：委派处理器（仅层级模式且 Worker 允许委派时生效）
    pub delegation: Option<&'a dyn DelegationHandler>,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<RunEvent>>,
    /// 可选：覆盖工具调用超时
    pub tool_timeout: Option<Duration>,
}

impl<'a> WorkerSession<'a> {
    pub fn new(
        task: &'a TaskDefinition,
        context: &'a str,
        invoker: &'a ToolInvoker,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            task,
            context,
            invoker,
            cancel_token,
            feedback: None,
            delegation: None,
            event_tx: None,
            tool_timeout: None,
        }
    }

    pub fn with_feedback(mut self, feedback: Option<&'a str>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_delegation(mut self, handler: &'a dyn DelegationHandler) -> Self {
        self.delegation = Some(handler);
        self
    }

    pub fn with_event_tx(mut self, tx: Option<&'a UnboundedSender<RunEvent>>) -> Self {
        self.event_tx = tx;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

impl Worker {
    /// 执行任务，返回候选输出（尚未校验）
    pub async fn act(&self, session: &WorkerSession<'_>) -> Result<String, CrewError> {
        let task_id = session.task.name.as_str();
        let max_iterations = self.max_iterations();
        let delegation = session.delegation.filter(|_| self.can_delegate());
        let coworkers = delegation
            .map(|h| h.coworkers(self.name()))
            .unwrap_or_default();
        let tools = session.invoker.describe(&self.definition().tools);

        let mut messages = vec![
            Message::system(prompt::system_prompt(self.definition(), &tools, &coworkers)),
            Message::user(prompt::task_prompt(session.task, session.context, session.feedback)),
        ];
        let mut last_error: Option<String> = None;

        for iteration in 1..=max_iterations {
            if session.cancel_token.is_cancelled() {
                return Err(CrewError::Cancelled);
            }
            send_event(
                session.event_tx,
                RunEvent::Thinking {
                    task: task_id.to_string(),
                    worker: self.name().to_string(),
                    iteration,
                    max_iterations,
                },
            );
            tracing::debug!(task = %task_id, worker = %self.name(), iteration, "thinking");

            let output = self.complete(&messages, &session.cancel_token).await?;

            let observation = match parse_step(&output) {
                Ok(Step::FinalAnswer(answer)) => {
                    tracing::info!(task = %task_id, worker = %self.name(), iteration, "final answer");
                    return Ok(answer);
                }
                Ok(Step::ToolCall(call)) => match self.call_tool(session, call).await {
                    Ok(obs) => obs,
                    Err(CrewError::Cancelled) => return Err(CrewError::Cancelled),
                    Err(e) => {
                        last_error = Some(e.to_string());
                        format!("Error: {e}")
                    }
                },
                Ok(Step::Delegate(requests)) => match delegation {
                    Some(handler) => {
                        send_event(
                            session.event_tx,
                            RunEvent::Delegation {
                                task: task_id.to_string(),
                                children: requests.iter().map(|r| r.worker.clone()).collect(),
                            },
                        );
                        let aggregation = handler
                            .dispatch(task_id, self.name(), requests, session.cancel_token.clone())
                            .await?;
                        if aggregation.is_partial() {
                            last_error = Some(format!(
                                "{} delegated sub-task(s) failed",
                                aggregation.failed()
                            ));
                        }
                        aggregation.render()
                    }
                    None => {
                        let msg = "delegation is not available to you; do the work yourself";
                        last_error = Some(msg.to_string());
                        format!("Error: {msg}")
                    }
                },
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "unparseable step");
                    last_error = Some(e.to_string());
                    format!(
                        "Error: {e}\nReply with exactly one JSON tool call, or with 'Final Answer: <answer>'."
                    )
                }
            };

            messages.push(Message::assistant(output));
            messages.push(Message::user(format!("Observation: {observation}")));
        }

        tracing::warn!(task = %task_id, worker = %self.name(), max_iterations, "iterations exhausted");
        Err(CrewError::Worker {
            worker: self.name().to_string(),
            kind: WorkerErrorKind::Exhausted {
                iterations: max_iterations,
                last_error,
            },
        })
    }

    /// 单次补全调用：受 completion_timeout 与取消令牌约束
    async fn complete(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, CrewError> {
        let limit = self.settings().completion_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(CrewError::Cancelled),
            res = tokio::time::timeout(limit, self.llm().complete(messages)) => match res {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(CrewError::Service(e)),
                Err(_) => Err(CrewError::Service(LlmError::Timeout(limit))),
            },
        }
    }

    async fn call_tool(&self, session: &WorkerSession<'_>, call: ToolCall) -> Result<String, CrewError> {
        let task_id = session.task.name.as_str();
        send_event(
            session.event_tx,
            RunEvent::ToolCall {
                task: task_id.to_string(),
                tool: call.tool.clone(),
                args: call.args.clone(),
            },
        );

        let result = if !self.permits_tool(&call.tool) {
            let kind = if session.invoker.get_tool(&call.tool).is_some() {
                ToolErrorKind::NotPermitted
            } else {
                ToolErrorKind::Unknown
            };
            Err(CrewError::ToolExecution {
                tool: call.tool.clone(),
                kind,
            })
        } else {
            let limit = session
                .tool_timeout
                .unwrap_or_else(|| session.invoker.default_timeout());
            tokio::select! {
                _ = session.cancel_token.cancelled() => Err(CrewError::Cancelled),
                res = session.invoker.invoke_with_timeout(&call.tool, call.args, limit) => res,
            }
        };

        match &result {
            Ok(obs) => send_event(
                session.event_tx,
                RunEvent::Observation {
                    task: task_id.to_string(),
                    tool: call.tool.clone(),
                    preview: preview(obs),
                },
            ),
            Err(CrewError::Cancelled) => {}
            Err(e) => send_event(
                session.event_tx,
                RunEvent::ToolFailure {
                    task: task_id.to_string(),
                    tool: call.tool.clone(),
                    reason: e.to_string(),
                },
            ),
        }
        result
    }
}
