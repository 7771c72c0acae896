//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 CrewError 决定 RetryAfter（指数退避）/ RetryWithPrompt（纠正一次）/ Abort。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 工具调用失败的具体原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// 超过调用方给定的超时
    Timeout(Duration),
    /// 工具自身返回错误
    Failed(String),
    /// 注册表中不存在该工具
    Unknown,
    /// 工具存在，但不在该 Worker 的许可列表中
    NotPermitted,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolErrorKind::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            ToolErrorKind::Failed(msg) => write!(f, "{msg}"),
            ToolErrorKind::Unknown => write!(f, "unknown tool"),
            ToolErrorKind::NotPermitted => write!(f, "tool not permitted for this worker"),
        }
    }
}

/// Worker 推理循环失败的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// 达到最大迭代次数仍未给出最终答案
    Exhausted {
        iterations: usize,
        last_error: Option<String>,
    },
}

impl fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErrorKind::Exhausted {
                iterations,
                last_error: Some(e),
            } => write!(f, "exhausted after {iterations} iterations (last error: {e})"),
            WorkerErrorKind::Exhausted { iterations, .. } => {
                write!(f, "exhausted after {iterations} iterations")
            }
        }
    }
}

/// 编排过程中可能出现的错误（配置、依赖、工具、补全服务、输出校验、取消等）
#[derive(Error, Debug)]
pub enum CrewError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Dependency error: task '{task}' depends on failed task '{dependency}'")]
    Dependency { task: String, dependency: String },

    #[error("Tool execution failed: {tool}: {kind}")]
    ToolExecution { tool: String, kind: ToolErrorKind },

    #[error("Completion service error: {0}")]
    Service(#[from] LlmError),

    #[error("Output validation failed for task '{task}': {reason}")]
    OutputValidation { task: String, reason: String },

    #[error("Worker '{worker}' failed: {kind}")]
    Worker { worker: String, kind: WorkerErrorKind },

    #[error("Task '{task}' timed out after {}ms", .after.as_millis())]
    Timeout { task: String, after: Duration },

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Context conflict: {0}")]
    ContextConflict(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Cancelled")]
    Cancelled,
}

impl CrewError {
    pub fn config(msg: impl Into<String>) -> Self {
        CrewError::Config(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CrewError::Timeout { .. }
                | CrewError::Service(LlmError::Timeout(_))
                | CrewError::ToolExecution {
                    kind: ToolErrorKind::Timeout(_),
                    ..
                }
        )
    }

    /// 归类到运行终态使用的失败种类
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CrewError::Config(_) => FailureKind::Config,
            CrewError::Dependency { .. } => FailureKind::Dependency,
            CrewError::ToolExecution { .. } => FailureKind::Tool,
            CrewError::Service(_) => FailureKind::Service,
            CrewError::OutputValidation { .. } => FailureKind::Validation,
            CrewError::Worker { .. } | CrewError::JsonParse(_) => FailureKind::Worker,
            CrewError::Timeout { .. } => FailureKind::Timeout,
            CrewError::Cancelled => FailureKind::Cancelled,
            CrewError::ContextConflict(_) | CrewError::PathEscape(_) | CrewError::Io(_) => {
                FailureKind::Internal
            }
        }
    }
}

impl From<std::io::Error> for CrewError {
    fn from(e: std::io::Error) -> Self {
        CrewError::Io(e.to_string())
    }
}

/// 失败种类（写入 RunReport，可序列化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Dependency,
    Tool,
    Service,
    Validation,
    Worker,
    Timeout,
    Cancelled,
    Internal,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待指定时长后重新调用 Worker（补全服务的瞬时错误）
    RetryAfter(Duration),
    /// 将提示追加到上下文后重新调用 Worker（输出校验失败）
    RetryWithPrompt(String),
    /// 终止当前任务
    Abort,
}
