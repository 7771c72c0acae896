//! RunReport：一次运行的最终产物与元数据
//!
//! 包含每个任务的记录（执行顺序）、委派汇总、上下文条目与失败信息；
//! 可序列化为 JSON 快照，供 replay 从某个任务重新执行。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{CrewError, FailureKind};
use crate::worker::Aggregation;
use crate::workflow::context::ContextEntry;
use crate::workflow::types::{ProcessModel, RunStatus, TaskId, TaskState, WorkerId};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_EXECUTION: u8 = 3;

/// 单个任务的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskId,
    pub worker: WorkerId,
    pub status: TaskState,
    /// Worker 被调用的次数；依赖失败传播与快照种子为 0
    pub attempts: u32,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifact: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_by: Option<TaskId>,
    /// 由快照直接填充，未重新执行
    #[serde(default)]
    pub seeded: bool,
}

/// 导致运行失败的首个任务及诊断信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub task: TaskId,
    pub kind: FailureKind,
    pub message: String,
    /// 失败任务最后一次拼接的上下文
    pub context_snapshot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub process: ProcessModel,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: i64,
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub delegations: Vec<Aggregation>,
    pub context: Vec<ContextEntry>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            EXIT_SUCCESS
        } else {
            EXIT_EXECUTION
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).max(0)
    }

    /// 真正被执行过的图任务（不含委派子任务、快照种子与未执行的传播失败），按执行顺序
    pub fn execution_order(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|r| r.delegated_by.is_none() && !r.seeded && r.attempts > 0)
            .map(|r| r.task.as_str())
            .collect()
    }

    pub fn output_of(&self, task: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|e| e.task_id == task)
            .map(|e| e.artifact.as_str())
    }

    pub fn record(&self, task: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|r| r.task == task)
    }

    /// 最后一个完成的图任务的输出
    pub fn final_output(&self) -> Option<&str> {
        self.tasks
            .iter()
            .rev()
            .filter(|r| r.delegated_by.is_none() && r.status == TaskState::Completed)
            .find_map(|r| r.output.as_deref())
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), CrewError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| CrewError::JsonParse(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, CrewError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|e| CrewError::JsonParse(e.to_string()))
    }
}
