//! 运行评估（`crew test`）
//!
//! Evaluator 用独立的补全客户端给每个已完成任务的输出打 1-10 分并附一句改进建议，
//! 可与 Worker 使用不同模型，避免自我认同。evaluate_runs 把同一任务图重复运行 N 次并逐任务汇总分数。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::CrewError;
use crate::llm::{LlmClient, LlmError, Message};
use crate::workflow::engine::ExecutionEngine;
use crate::workflow::graph::TaskGraph;
use crate::workflow::types::{RunStatus, TaskDefinition, TaskId, WorkerId};
use crate::workflow::validation::extract_json_object;

/// 评估提示词首行前缀
pub const EVALUATION_PREFIX: &str = "Evaluation Task:";

const MIN_SCORE: f64 = 1.0;
const MAX_SCORE: f64 = 10.0;

/// 单个任务输出的评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskScore {
    pub task: TaskId,
    pub worker: WorkerId,
    pub score: f64,
    #[serde(default)]
    pub feedback: String,
}

pub struct Evaluator {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn score(&self, task: &TaskDefinition, output: &str) -> Result<TaskScore, CrewError> {
        let messages = vec![
            Message::system(
                "You are an impartial reviewer grading the work of an autonomous worker. \
                 Judge only how well the output accomplishes the task.",
            ),
            Message::user(evaluation_prompt(task, output)),
        ];
        let reply = tokio::time::timeout(self.timeout, self.llm.complete(&messages))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))??;
        let (score, feedback) = parse_score(&reply)?;
        tracing::debug!(task = %task.name, score, "task scored");
        Ok(TaskScore {
            task: task.name.clone(),
            worker: task.worker.clone(),
            score,
            feedback,
        })
    }
}

fn evaluation_prompt(task: &TaskDefinition, output: &str) -> String {
    let mut out = format!("{} {}", EVALUATION_PREFIX, task.description.trim());
    let expected = task.expected_output.describe();
    if !expected.trim().is_empty() {
        out.push_str(&format!("\n\nExpected output: {}", expected.trim()));
    }
    out.push_str(&format!("\n\nOutput to grade:\n{}", output.trim_end()));
    out.push_str(
        "\n\nRate the output from 1 (unusable) to 10 (excellent) and give one concrete suggestion \
         for improving it. Reply with ONLY a JSON object: {\"score\": <1-10>, \"feedback\": \"<suggestion>\"}",
    );
    out
}

/// 解析评估回复：优先 JSON 对象，其次 `score: N` 形式；分数截断到 1-10
pub fn parse_score(reply: &str) -> Result<(f64, String), CrewError> {
    if let Some(obj) = extract_json_object(reply) {
        if let Some(score) = obj.get("score").and_then(|v| v.as_f64()) {
            let feedback = obj
                .get("feedback")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            return Ok((score.clamp(MIN_SCORE, MAX_SCORE), feedback));
        }
    }
    let re = Regex::new(r"(?i)\bscore\b\D{0,5}(\d+(?:\.\d+)?)").map_err(|e| CrewError::JsonParse(e.to_string()))?;
    re.captures(reply)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|score| (score.clamp(MIN_SCORE, MAX_SCORE), String::new()))
        .ok_or_else(|| {
            let preview: String = reply.chars().take(80).collect();
            CrewError::JsonParse(format!("evaluator reply has no score: {preview}"))
        })
}

/// 一次运行的评估结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: usize,
    pub run_id: String,
    pub status: RunStatus,
    pub duration_ms: i64,
    pub scores: Vec<TaskScore>,
    /// 未打分的任务及原因（未完成或评估失败）
    #[serde(default)]
    pub unscored: BTreeMap<TaskId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// 声明顺序
    pub tasks: Vec<TaskId>,
    pub iterations: Vec<IterationResult>,
}

impl EvaluationReport {
    pub fn all_succeeded(&self) -> bool {
        !self.iterations.is_empty() && self.iterations.iter().all(|i| i.status == RunStatus::Succeeded)
    }

    pub fn score_of(&self, iteration: usize, task: &str) -> Option<f64> {
        self.iterations
            .iter()
            .find(|i| i.iteration == iteration)?
            .scores
            .iter()
            .find(|s| s.task == task)
            .map(|s| s.score)
    }

    /// 每个任务在已打分轮次上的平均分
    pub fn averages(&self) -> BTreeMap<TaskId, f64> {
        let mut sums: BTreeMap<TaskId, (f64, usize)> = BTreeMap::new();
        for s in self.iterations.iter().flat_map(|i| &i.scores) {
            let e = sums.entry(s.task.clone()).or_insert((0.0, 0));
            e.0 += s.score;
            e.1 += 1;
        }
        sums.into_iter().map(|(k, (sum, n))| (k, sum / n as f64)).collect()
    }

    pub fn overall(&self) -> Option<f64> {
        let avgs = self.averages();
        (!avgs.is_empty()).then(|| avgs.values().sum::<f64>() / avgs.len() as f64)
    }

    /// 文本表格：每行一个任务，每列一轮运行，末列平均；未打分记为 -
    pub fn render_table(&self) -> String {
        let width = self.tasks.iter().map(|t| t.len()).max().unwrap_or(4).max(4);
        let mut out = format!("{:<width$}", "Task");
        for i in &self.iterations {
            out.push_str(&format!(" | Run {:<3}", i.iteration));
        }
        out.push_str(" | Avg");

        let averages = self.averages();
        for task in &self.tasks {
            out.push_str(&format!("\n{task:<width$}"));
            for i in &self.iterations {
                match self.score_of(i.iteration, task) {
                    Some(s) => out.push_str(&format!(" | {s:<7.1}")),
                    None => out.push_str(&format!(" | {:<7}", "-")),
                }
            }
            match averages.get(task) {
                Some(avg) => out.push_str(&format!(" | {avg:.1}")),
                None => out.push_str(" | -"),
            }
        }
        out.push_str(&format!("\n{:<width$}", "Overall"));
        for _ in &self.iterations {
            out.push_str(&format!(" | {:<7}", ""));
        }
        match self.overall() {
            Some(o) => out.push_str(&format!(" | {o:.1}")),
            None => out.push_str(" | -"),
        }
        out
    }
}

/// 同一任务图运行 iterations 次（至少一次），逐任务评分；取消后不再开始新的运行
pub async fn evaluate_runs(
    engine: &ExecutionEngine,
    graph: &TaskGraph,
    evaluator: &Evaluator,
    iterations: usize,
) -> EvaluationReport {
    let mut report = EvaluationReport {
        tasks: graph.tasks().iter().map(|t| t.name.clone()).collect(),
        iterations: Vec::new(),
    };

    for iteration in 1..=iterations.max(1) {
        if engine.supervisor().is_cancelled() {
            tracing::warn!(iteration, "evaluation cancelled");
            break;
        }
        let run = engine.run(graph.clone()).await;
        let mut result = IterationResult {
            iteration,
            run_id: run.run_id.clone(),
            status: run.status,
            duration_ms: run.duration_ms(),
            scores: Vec::new(),
            unscored: BTreeMap::new(),
        };

        for task in graph.tasks() {
            let Some(output) = run.output_of(&task.name) else {
                let reason = run
                    .record(&task.name)
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "not completed".to_string());
                result.unscored.insert(task.name.clone(), reason);
                continue;
            };
            match evaluator.score(task, output).await {
                Ok(score) => result.scores.push(score),
                Err(e) => {
                    tracing::warn!(task = %task.name, error = %e, "scoring failed");
                    result.unscored.insert(task.name.clone(), e.to_string());
                }
            }
        }
        tracing::info!(
            iteration,
            run_id = %result.run_id,
            status = %result.status,
            scored = result.scores.len(),
            "evaluation run finished"
        );
        report.iterations.push(result);
    }
    report
}
