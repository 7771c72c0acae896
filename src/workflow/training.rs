//! 训练（`crew train`）
//!
//! 同一任务图重复运行 N 次，每个完成的任务由 FeedbackSource 给出改进建议（评估模型或人工输入），
//! 结果按 Worker 汇总为 TrainingData 并以 JSON 落盘。之后的运行通过 `CrewBuilder::training`
//! 把建议附加到对应 Worker 的背景描述中。

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;

use crate::core::CrewError;
use crate::workflow::engine::ExecutionEngine;
use crate::workflow::evaluation::Evaluator;
use crate::workflow::graph::TaskGraph;
use crate::workflow::types::{RunStatus, TaskDefinition, TaskId, WorkerId};

/// 任务输出的改进建议来源
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// None 表示对该输出没有建议
    async fn feedback(&self, task: &TaskDefinition, output: &str) -> Result<Option<String>, CrewError>;
}

#[async_trait]
impl FeedbackSource for Evaluator {
    async fn feedback(&self, task: &TaskDefinition, output: &str) -> Result<Option<String>, CrewError> {
        let score = self.score(task, output).await?;
        let text = score.feedback.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}

/// 人工反馈：输出打印到 stderr，从 stdin 读取一行建议，空行跳过
pub struct ConsoleFeedback {
    stdin: Mutex<BufReader<Stdin>>,
}

impl ConsoleFeedback {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for ConsoleFeedback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedbackSource for ConsoleFeedback {
    async fn feedback(&self, task: &TaskDefinition, output: &str) -> Result<Option<String>, CrewError> {
        eprintln!("\n=== {} ({}) ===\n{}\n", task.name, task.worker, output.trim_end());
        eprintln!("Feedback for '{}' (empty line to skip):", task.name);
        let mut line = String::new();
        self.stdin.lock().await.read_line(&mut line).await?;
        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFeedback {
    pub task: TaskId,
    pub worker: WorkerId,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingIteration {
    pub iteration: usize,
    pub run_id: String,
    pub status: RunStatus,
    pub feedback: Vec<TaskFeedback>,
}

/// 训练数据文件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub crew: String,
    pub created_at: i64,
    pub iterations: Vec<TrainingIteration>,
    /// Worker -> 去重后的建议（按最近出现排序，最多 max_suggestions 条）
    #[serde(default)]
    pub suggestions: BTreeMap<WorkerId, Vec<String>>,
}

impl TrainingData {
    pub fn new(crew: impl Into<String>) -> Self {
        Self {
            crew: crew.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    pub fn suggestions_for(&self, worker: &str) -> &[String] {
        self.suggestions.get(worker).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_succeeded(&self) -> bool {
        !self.iterations.is_empty() && self.iterations.iter().all(|i| i.status == RunStatus::Succeeded)
    }

    /// 由全部轮次的反馈重新汇总每个 Worker 的建议
    pub fn consolidate(&mut self, max_suggestions: usize) {
        let mut suggestions: BTreeMap<WorkerId, Vec<String>> = BTreeMap::new();
        for fb in self.iterations.iter().rev().flat_map(|i| i.feedback.iter().rev()) {
            let list = suggestions.entry(fb.worker.clone()).or_default();
            if list.len() < max_suggestions && !list.contains(&fb.feedback) {
                list.push(fb.feedback.clone());
            }
        }
        self.suggestions = suggestions;
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CrewError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| CrewError::JsonParse(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), iterations = self.iterations.len(), "training data saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CrewError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|e| CrewError::JsonParse(e.to_string()))
    }
}

/// 运行 iterations 次（至少一次）并收集反馈；取得反馈失败只记日志，不中断训练
pub async fn train(
    engine: &ExecutionEngine,
    graph: &TaskGraph,
    crew: &str,
    source: &dyn FeedbackSource,
    iterations: usize,
    max_suggestions: usize,
) -> TrainingData {
    let mut data = TrainingData::new(crew);

    for iteration in 1..=iterations.max(1) {
        if engine.supervisor().is_cancelled() {
            tracing::warn!(iteration, "training cancelled");
            break;
        }
        let run = engine.run(graph.clone()).await;
        let mut feedback = Vec::new();
        for task in graph.tasks() {
            let Some(output) = run.output_of(&task.name) else {
                continue;
            };
            match source.feedback(task, output).await {
                Ok(Some(text)) => feedback.push(TaskFeedback {
                    task: task.name.clone(),
                    worker: task.worker.clone(),
                    feedback: text,
                }),
                Ok(None) => {}
                Err(e) => tracing::warn!(task = %task.name, error = %e, "feedback unavailable"),
            }
        }
        tracing::info!(iteration, run_id = %run.run_id, collected = feedback.len(), "training run finished");
        data.iterations.push(TrainingIteration {
            iteration,
            run_id: run.run_id,
            status: run.status,
            feedback,
        });
    }

    data.consolidate(max_suggestions.max(1));
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fb(worker: &str, text: &str) -> TaskFeedback {
        TaskFeedback {
            task: format!("{worker}_task"),
            worker: worker.into(),
            feedback: text.into(),
        }
    }

    fn iteration(n: usize, feedback: Vec<TaskFeedback>) -> TrainingIteration {
        TrainingIteration {
            iteration: n,
            run_id: format!("run_{n}"),
            status: RunStatus::Succeeded,
            feedback,
        }
    }

    #[test]
    fn test_consolidate_prefers_recent_and_dedups() {
        let mut data = TrainingData::new("review");
        data.iterations = vec![
            iteration(1, vec![fb("reviewer", "old"), fb("reviewer", "cite lines"), fb("editor", "smaller diff")]),
            iteration(2, vec![fb("reviewer", "cite lines"), fb("reviewer", "newest")]),
        ];
        data.consolidate(2);
        assert_eq!(data.suggestions_for("reviewer"), ["newest", "cite lines"]);
        assert_eq!(data.suggestions_for("editor"), ["smaller diff"]);
        assert!(data.suggestions_for("nobody").is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train/data.json");
        let mut data = TrainingData::new("review");
        data.iterations.push(iteration(1, vec![fb("reviewer", "be concise")]));
        data.consolidate(5);
        data.save(&path).unwrap();
        assert_eq!(TrainingData::load(&path).unwrap(), data);
    }

    #[test]
    fn test_load_garbage_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(TrainingData::load(&path), Err(CrewError::JsonParse(_))));
    }
}
