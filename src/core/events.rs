//! 运行过程事件：用于日志订阅者 / 前端展示任务进度、思考、工具调用、委派与重试

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// 运行开始
    RunStarted { run_id: String, tasks: usize },
    /// 任务开始执行
    TaskStarted { task: String, worker: String },
    /// Worker 正在调用补全服务（第几轮）
    Thinking {
        task: String,
        worker: String,
        iteration: usize,
        max_iterations: usize,
    },
    /// 调用工具
    ToolCall {
        task: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { task: String, tool: String, preview: String },
    /// 工具执行失败（作为 Observation 反馈给 Worker）
    ToolFailure { task: String, tool: String, reason: String },
    /// 委派给其他 Worker 的子任务
    Delegation { task: String, children: Vec<String> },
    /// 按退避策略重试
    Retry {
        task: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// 输出未通过校验
    ValidationFailed { task: String, reason: String },
    /// 任务完成
    TaskCompleted { task: String, attempts: u32 },
    /// 任务失败
    TaskFailed { task: String, error: String },
    /// 运行终止时尚未执行的任务
    TaskSkipped { task: String, reason: String },
    /// 运行结束
    RunFinished { run_id: String, status: String },
}

pub fn send_event(tx: Option<&UnboundedSender<RunEvent>>, ev: RunEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
