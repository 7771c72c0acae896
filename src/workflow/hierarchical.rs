//! 层级模式的委派分派器
//!
//! 每个子任务获得显式 ID `<parent>::delegate-<n>`，上下文在分派前算好且执行期间不变；
//! 子任务受 Semaphore 限制并发、受单独超时约束，自身不能再委派，join_all 作为汇合屏障。
//! 失败、超时、越界的请求都以 Failed 条目保留在 Aggregation 中。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::{CrewError, RunEvent};
use crate::tools::ToolInvoker;
use crate::worker::{
    Aggregation, Coworker, DelegationHandler, DelegationRequest, SubTaskOutcome, WorkerSession,
    WorkerSet,
};
use crate::workflow::types::TaskDefinition;

/// 委派相关限制（来自 [engine] 配置）
#[derive(Debug, Clone)]
pub struct DelegationLimits {
    pub max_fanout: usize,
    pub child_timeout: Duration,
    pub max_per_step: usize,
    pub tool_timeout: Option<Duration>,
}

/// 为单个父任务服务的分派器；子任务编号在该任务的所有尝试中递增
pub struct Dispatcher<'a> {
    workers: &'a WorkerSet,
    invoker: &'a ToolInvoker,
    parent_context: &'a str,
    limits: DelegationLimits,
    event_tx: Option<&'a UnboundedSender<RunEvent>>,
    next_child: AtomicUsize,
    aggregations: Mutex<Vec<Aggregation>>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        workers: &'a WorkerSet,
        invoker: &'a ToolInvoker,
        parent_context: &'a str,
        limits: DelegationLimits,
    ) -> Self {
        Self {
            workers,
            invoker,
            parent_context,
            limits,
            event_tx: None,
            next_child: AtomicUsize::new(0),
            aggregations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_event_tx(mut self, tx: Option<&'a UnboundedSender<RunEvent>>) -> Self {
        self.event_tx = tx;
        self
    }

    /// 取出迄今为止的全部汇总（按分派顺序）
    pub fn take_aggregations(&self) -> Vec<Aggregation> {
        self.aggregations
            .lock()
            .map(|mut a| std::mem::take(&mut *a))
            .unwrap_or_default()
    }

    fn child_context(&self, delegator: &str, extra: Option<&str>) -> String {
        match extra.map(str::trim).filter(|c| !c.is_empty()) {
            Some(extra) if self.parent_context.trim().is_empty() => {
                format!("## Context from {delegator}\n{extra}")
            }
            Some(extra) => format!(
                "{}\n\n---\n\n## Context from {delegator}\n{extra}",
                self.parent_context
            ),
            None => self.parent_context.to_string(),
        }
    }

    async fn run_child(
        &self,
        child: String,
        delegator: &str,
        index: usize,
        request: DelegationRequest,
        semaphore: &Semaphore,
        cancel: CancellationToken,
    ) -> SubTaskOutcome {
        let fail = |reason: String| SubTaskOutcome::Failed {
            child: child.clone(),
            worker: request.worker.clone(),
            reason,
        };

        if index >= self.limits.max_per_step {
            return fail(format!(
                "delegation limit exceeded: at most {} sub-tasks per step",
                self.limits.max_per_step
            ));
        }
        if request.worker == delegator {
            return fail("a worker cannot delegate to itself".to_string());
        }
        let Some(worker) = self.workers.get(&request.worker) else {
            return fail(format!("unknown coworker '{}'", request.worker));
        };

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return fail("cancelled".to_string()),
            permit = semaphore.acquire() => match permit {
                Ok(p) => p,
                Err(e) => return fail(e.to_string()),
            },
        };

        let task = TaskDefinition::new(child.clone(), request.instruction.clone(), worker.name());
        let context = self.child_context(delegator, request.context.as_deref());
        let mut session = WorkerSession::new(&task, &context, self.invoker, cancel.clone())
            .with_event_tx(self.event_tx);
        if let Some(t) = self.limits.tool_timeout {
            session = session.with_tool_timeout(t);
        }

        tracing::info!(child = %child, worker = %worker.name(), "delegated sub-task started");
        match tokio::time::timeout(self.limits.child_timeout, worker.act(&session)).await {
            Ok(Ok(output)) if output.trim().is_empty() => fail("empty output".to_string()),
            Ok(Ok(output)) => SubTaskOutcome::Completed {
                child: child.clone(),
                worker: request.worker.clone(),
                output,
            },
            Ok(Err(e)) => fail(e.to_string()),
            Err(_) => fail(format!(
                "timed out after {}ms",
                self.limits.child_timeout.as_millis()
            )),
        }
    }
}

#[async_trait]
impl DelegationHandler for Dispatcher<'_> {
    fn coworkers(&self, delegator: &str) -> Vec<Coworker> {
        self.workers.coworkers_of(delegator)
    }

    async fn dispatch(
        &self,
        parent: &str,
        delegator: &str,
        requests: Vec<DelegationRequest>,
        cancel: CancellationToken,
    ) -> Result<Aggregation, CrewError> {
        if cancel.is_cancelled() {
            return Err(CrewError::Cancelled);
        }
        let semaphore = Semaphore::new(self.limits.max_fanout.max(1));
        let children = requests.into_iter().enumerate().map(|(i, req)| {
            let n = self.next_child.fetch_add(1, Ordering::SeqCst) + 1;
            let child = format!("{parent}::delegate-{n}");
            self.run_child(child, delegator, i, req, &semaphore, cancel.clone())
        });
        let outcomes = join_all(children).await;

        let aggregation = Aggregation {
            parent: parent.to_string(),
            delegator: delegator.to_string(),
            outcomes,
        };
        tracing::info!(
            parent = %parent,
            completed = aggregation.succeeded(),
            failed = aggregation.failed(),
            "delegation barrier reached"
        );
        if let Ok(mut all) = self.aggregations.lock() {
            all.push(aggregation.clone());
        }
        Ok(aggregation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::llm::ScriptedLlmClient;
    use crate::tools::ToolRegistry;
    use crate::worker::{Worker, WorkerSettings};
    use crate::workflow::types::WorkerDefinition;

    fn workers() -> WorkerSet {
        let mut set = WorkerSet::new();
        for name in ["lead", "a", "b"] {
            let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new())
                .with_fallback(format!("Final Answer: from {name}")));
            set.insert(Worker::new(
                WorkerDefinition::new(name, format!("{name} role")),
                llm,
                WorkerSettings::default(),
            ));
        }
        set
    }

    fn limits(max_per_step: usize) -> DelegationLimits {
        DelegationLimits {
            max_fanout: 2,
            child_timeout: Duration::from_secs(5),
            max_per_step,
            tool_timeout: None,
        }
    }

    fn req(worker: &str, context: Option<&str>) -> DelegationRequest {
        DelegationRequest {
            worker: worker.into(),
            instruction: format!("help {worker}"),
            context: context.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_dispatch_keeps_order_and_failures() {
        let set = workers();
        let inv = ToolInvoker::new(ToolRegistry::new(), Duration::from_secs(1));
        let dispatcher = Dispatcher::new(&set, &inv, "", limits(3));

        let agg = dispatcher
            .dispatch(
                "review",
                "lead",
                vec![req("a", None), req("ghost", None), req("lead", None), req("b", Some("x"))],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let children: Vec<&str> = agg.outcomes.iter().map(|o| o.child()).collect();
        assert_eq!(
            children,
            vec![
                "review::delegate-1",
                "review::delegate-2",
                "review::delegate-3",
                "review::delegate-4"
            ]
        );
        assert!(matches!(&agg.outcomes[0], SubTaskOutcome::Completed { output, .. } if output == "from a"));
        assert!(matches!(&agg.outcomes[1], SubTaskOutcome::Failed { reason, .. } if reason.contains("unknown coworker")));
        assert!(matches!(&agg.outcomes[2], SubTaskOutcome::Failed { reason, .. } if reason.contains("itself")));
        assert!(matches!(&agg.outcomes[3], SubTaskOutcome::Failed { reason, .. } if reason.contains("limit")));
        assert_eq!(dispatcher.take_aggregations().len(), 1);
        assert!(dispatcher.take_aggregations().is_empty());
    }

    #[tokio::test]
    async fn test_child_numbering_continues_across_steps() {
        let set = workers();
        let inv = ToolInvoker::new(ToolRegistry::new(), Duration::from_secs(1));
        let dispatcher = Dispatcher::new(&set, &inv, "", limits(5));
        dispatcher
            .dispatch("t", "lead", vec![req("a", None)], CancellationToken::new())
            .await
            .unwrap();
        let second = dispatcher
            .dispatch("t", "lead", vec![req("b", None)], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.outcomes[0].child(), "t::delegate-2");
    }

    #[test]
    fn test_child_context_appends_extra() {
        let set = workers();
        let inv = ToolInvoker::new(ToolRegistry::new(), Duration::from_secs(1));
        let dispatcher = Dispatcher::new(&set, &inv, "## Output of plan\nP", limits(5));
        assert_eq!(
            dispatcher.child_context("lead", Some("focus on auth")),
            "## Output of plan\nP\n\n---\n\n## Context from lead\nfocus on auth"
        );
        assert_eq!(dispatcher.child_context("lead", Some("  ")), "## Output of plan\nP");
    }
}
