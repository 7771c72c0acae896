//! ContextStore：已完成任务输出的只追加记录
//!
//! 每个成功完成的任务恰好追加一次；context_for 按「声明的依赖顺序」返回产物，
//! 与依赖实际完成的先后无关。条目一经追加不可修改。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::CrewError;
use crate::workflow::graph::TaskGraph;
use crate::workflow::types::{TaskId, TaskState, WorkerId};

/// 上下文中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub artifact: String,
    pub status: TaskState,
    /// 追加时间（毫秒时间戳）
    pub recorded_at: i64,
    /// 产生该输出所用的尝试次数
    pub attempts: u32,
    /// 委派子任务的父任务
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_by: Option<TaskId>,
}

impl ContextEntry {
    pub fn completed(
        task_id: impl Into<String>,
        worker: impl Into<String>,
        artifact: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker: worker.into(),
            artifact: artifact.into(),
            status: TaskState::Completed,
            recorded_at: chrono::Utc::now().timestamp_millis(),
            attempts,
            delegated_by: None,
        }
    }

    pub fn delegated_by(mut self, parent: impl Into<String>) -> Self {
        self.delegated_by = Some(parent.into());
        self
    }
}

/// 运行期上下文存储；依赖顺序取自 TaskGraph
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    entries: Vec<ContextEntry>,
    by_task: HashMap<TaskId, usize>,
    dependencies: HashMap<TaskId, Vec<TaskId>>,
}

impl ContextStore {
    pub fn for_graph(graph: &TaskGraph) -> Self {
        let dependencies = graph
            .tasks()
            .iter()
            .map(|t| (t.name.clone(), t.depends_on.clone()))
            .collect();
        Self {
            entries: Vec::new(),
            by_task: HashMap::new(),
            dependencies,
        }
    }

    /// 追加一条记录；同一任务重复追加返回 ContextConflict
    pub fn append(&mut self, entry: ContextEntry) -> Result<(), CrewError> {
        if self.by_task.contains_key(&entry.task_id) {
            return Err(CrewError::ContextConflict(format!(
                "task '{}' already has a context entry",
                entry.task_id
            )));
        }
        tracing::debug!(task = %entry.task_id, chars = entry.artifact.len(), "context append");
        self.by_task.insert(entry.task_id.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// task_id 声明的依赖的产物，按声明顺序；尚未完成的依赖不出现
    pub fn context_for(&self, task_id: &str) -> Vec<String> {
        self.dependencies
            .get(task_id)
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| self.get(d))
                    .map(|e| e.artifact.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 拼接后的上下文文本（每个依赖一个小节），没有依赖时为空串
    pub fn assemble(&self, task_id: &str) -> String {
        let Some(deps) = self.dependencies.get(task_id) else {
            return String::new();
        };
        deps.iter()
            .filter_map(|d| self.get(d))
            .map(|e| format!("## Output of {}\n{}", e.task_id, e.artifact.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    pub fn get(&self, task_id: &str) -> Option<&ContextEntry> {
        self.by_task.get(task_id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.by_task.contains_key(task_id)
    }

    /// 追加顺序的全部条目
    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
