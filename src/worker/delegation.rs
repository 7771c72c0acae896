//! 委派：Worker 循环与执行引擎之间的接缝
//!
//! Worker 产出 `delegate` 步骤后，通过 DelegationHandler 把子任务交给协作者；
//! 引擎侧实现负责有界并发、子任务超时与汇合屏障，Worker 只拿到 Aggregation 作为 Observation。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::CrewError;
use crate::workflow::types::{TaskId, WorkerId};

/// 一条委派请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// 协作者名称
    pub worker: WorkerId,
    /// 子任务说明
    #[serde(alias = "task")]
    pub instruction: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// 可被委派的协作者（写入 prompt）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coworker {
    pub name: WorkerId,
    pub role: String,
}

/// 单个子任务的结果；失败也必须保留一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubTaskOutcome {
    Completed {
        child: TaskId,
        worker: WorkerId,
        output: String,
    },
    Failed {
        child: TaskId,
        worker: WorkerId,
        reason: String,
    },
}

impl SubTaskOutcome {
    pub fn child(&self) -> &str {
        match self {
            SubTaskOutcome::Completed { child, .. } | SubTaskOutcome::Failed { child, .. } => child,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SubTaskOutcome::Completed { .. })
    }
}

/// 一次委派步骤的汇总，outcomes 与请求一一对应、顺序一致
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub parent: TaskId,
    pub delegator: WorkerId,
    pub outcomes: Vec<SubTaskOutcome>,
}

impl Aggregation {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_partial(&self) -> bool {
        self.failed() > 0
    }

    /// 反馈给委派方的文本；失败条目以 FAILED 标记保留
    pub fn render(&self) -> String {
        let mut out = format!(
            "Delegation results: {} completed, {} failed.",
            self.succeeded(),
            self.failed()
        );
        for outcome in &self.outcomes {
            match outcome {
                SubTaskOutcome::Completed { child, worker, output } => {
                    out.push_str(&format!("\n\n### {child} ({worker}) COMPLETED\n{}", output.trim_end()));
                }
                SubTaskOutcome::Failed { child, worker, reason } => {
                    out.push_str(&format!("\n\n### {child} ({worker}) FAILED\n{reason}"));
                }
            }
        }
        if self.is_partial() {
            out.push_str("\n\nSome delegated work failed. Decide whether the completed results are enough, retry differently, or finish the work yourself.");
        }
        out
    }
}

#[async_trait]
pub trait DelegationHandler: Send + Sync {
    /// delegator 可委派的协作者（不含自身）
    fn coworkers(&self, delegator: &str) -> Vec<Coworker>;

    /// 并发执行全部请求并等待全部结束（屏障）；只在取消时返回 Err
    async fn dispatch(
        &self,
        parent: &str,
        delegator: &str,
        requests: Vec<DelegationRequest>,
        cancel: CancellationToken,
    ) -> Result<Aggregation, CrewError>;
}
