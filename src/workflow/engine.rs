//! 执行引擎
//!
//! 以显式的 RunState 驱动任务图：start -> step* -> 终态。
//! - 顺序模式：每步执行声明顺序中第一个就绪任务；
//! - 层级模式：每步把整个就绪前沿并发分派（Semaphore 限流，join_all 屏障），按声明顺序落账；
//!   允许委派的 Worker 通过 Dispatcher 派生子任务。
//! 每个任务：拼上下文 -> Worker.act -> 校验 -> 写产物 -> 追加 ContextStore；
//! 补全服务错误按指数退避重试，校验失败给一次纠正机会，其余错误直接失败并向下游传播。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::{
    send_event, BackoffPolicy, CrewError, RecoveryAction, RecoveryEngine, RunEvent, RunSupervisor,
};
use crate::tools::ToolInvoker;
use crate::worker::{Aggregation, SubTaskOutcome, Worker, WorkerSession, WorkerSet};
use crate::workflow::artifacts::ArtifactWriter;
use crate::workflow::context::{ContextEntry, ContextStore};
use crate::workflow::graph::TaskGraph;
use crate::workflow::hierarchical::{DelegationLimits, Dispatcher};
use crate::workflow::report::{RunFailure, RunReport, TaskRecord};
use crate::workflow::types::{ProcessModel, RunStatus, TaskDefinition, TaskId, TaskState, WorkerId};
use crate::workflow::validation::validate_output;

/// 引擎参数（来自 [engine] 配置）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub process: ProcessModel,
    /// 层级模式下唯一允许委派的 Worker；None 时所有允许委派的 Worker 都可委派
    pub manager: Option<WorkerId>,
    /// 补全服务错误的最大重试次数（总尝试 = max_retries + 1）
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// 同时执行的任务 / 子任务上限
    pub max_fanout: usize,
    /// 整个任务（含全部重试）的超时
    pub task_timeout: Option<Duration>,
    pub delegation_timeout: Duration,
    pub max_delegations: usize,
    /// 覆盖 ToolInvoker 的默认超时
    pub tool_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            process: ProcessModel::Sequential,
            manager: None,
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            max_fanout: 4,
            task_timeout: None,
            delegation_timeout: Duration::from_secs(300),
            max_delegations: 5,
            tool_timeout: None,
        }
    }
}

/// 一次运行的全部可变状态，只由引擎在 step 之间传递
#[derive(Debug)]
pub struct RunState {
    pub run_id: String,
    pub process: ProcessModel,
    pub status: RunStatus,
    pub graph: TaskGraph,
    pub context: ContextStore,
    pub states: HashMap<TaskId, TaskState>,
    pub records: Vec<TaskRecord>,
    pub delegations: Vec<Aggregation>,
    /// 本次运行已写过的产物目标
    pub written: BTreeSet<String>,
    pub failure: Option<RunFailure>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl RunState {
    pub fn new(graph: TaskGraph, process: ProcessModel) -> Self {
        let states = graph
            .tasks()
            .iter()
            .map(|t| (t.name.clone(), TaskState::Waiting))
            .collect();
        let context = ContextStore::for_graph(&graph);
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            process,
            status: RunStatus::Idle,
            graph,
            context,
            states,
            records: Vec::new(),
            delegations: Vec::new(),
            written: BTreeSet::new(),
            failure: None,
            started_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }

    pub fn state_of(&self, task: &str) -> Option<TaskState> {
        self.states.get(task).copied()
    }

    pub fn completed(&self) -> HashSet<TaskId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == TaskState::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 就绪且仍在等待的任务，按声明顺序
    pub fn frontier(&self) -> Vec<TaskId> {
        self.graph
            .ready_tasks(&self.completed())
            .into_iter()
            .filter(|id| self.state_of(id) == Some(TaskState::Waiting))
            .collect()
    }

    pub fn into_report(self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            process: self.process,
            status: self.status,
            started_at: self.started_at,
            finished_at: self
                .finished_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            tasks: self.records,
            delegations: self.delegations,
            context: self.context.entries().to_vec(),
            failure: self.failure,
        }
    }
}

/// 单个任务执行完毕（成功或失败）后待落账的结果
struct TaskOutcome {
    task: TaskDefinition,
    context: String,
    result: Result<String, CrewError>,
    attempts: u32,
    aggregations: Vec<Aggregation>,
    started_at: i64,
    finished_at: i64,
}

pub struct ExecutionEngine {
    workers: WorkerSet,
    invoker: ToolInvoker,
    settings: EngineSettings,
    recovery: RecoveryEngine,
    artifacts: Option<ArtifactWriter>,
    event_tx: Option<UnboundedSender<RunEvent>>,
    supervisor: RunSupervisor,
}

impl ExecutionEngine {
    pub fn new(workers: WorkerSet, invoker: ToolInvoker, settings: EngineSettings) -> Self {
        let recovery = RecoveryEngine::new(settings.max_retries, settings.backoff.clone());
        Self {
            workers,
            invoker,
            settings,
            recovery,
            artifacts: None,
            event_tx: None,
            supervisor: RunSupervisor::new(),
        }
    }

    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_supervisor(mut self, supervisor: RunSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn supervisor(&self) -> &RunSupervisor {
        &self.supervisor
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 在下一个任务边界取消运行；进行中的调用经由取消令牌中断
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    fn emit(&self, ev: RunEvent) {
        send_event(self.event_tx.as_ref(), ev);
    }

    /// Idle -> Running
    pub fn start(&self, graph: TaskGraph) -> RunState {
        let mut state = RunState::new(graph, self.settings.process);
        state.status = RunStatus::Running;
        tracing::info!(
            run_id = %state.run_id,
            process = %state.process,
            tasks = state.graph.len(),
            "run started"
        );
        self.emit(RunEvent::RunStarted {
            run_id: state.run_id.clone(),
            tasks: state.graph.len(),
        });
        state
    }

    /// 推进一步；终态直接原样返回
    pub async fn step(&self, mut state: RunState) -> RunState {
        if state.status.is_terminal() {
            return state;
        }
        if state.status == RunStatus::Idle {
            state.status = RunStatus::Running;
        }

        let frontier = state.frontier();
        if frontier.is_empty() {
            let all_done = state.states.values().all(|s| *s == TaskState::Completed);
            if all_done {
                self.finish(&mut state, RunStatus::Succeeded);
            } else {
                // 无就绪任务却仍有未完成任务，只可能是上游已失败
                self.finish(&mut state, RunStatus::Failed);
            }
            return state;
        }

        if self.supervisor.is_cancelled() {
            let id = frontier[0].clone();
            let context = state.context.assemble(&id);
            let now = chrono::Utc::now().timestamp_millis();
            if let Some(task) = state.graph.task(&id).cloned() {
                self.settle(
                    &mut state,
                    TaskOutcome {
                        task,
                        context,
                        result: Err(CrewError::Cancelled),
                        attempts: 0,
                        aggregations: Vec::new(),
                        started_at: now,
                        finished_at: now,
                    },
                );
            }
            self.conclude(&mut state);
            return state;
        }

        let batch: Vec<TaskId> = match state.process {
            ProcessModel::Sequential => frontier.into_iter().take(1).collect(),
            ProcessModel::Hierarchical => frontier,
        };

        // 上下文在分派前计算，执行期间不变
        let prepared: Vec<(TaskDefinition, String)> = batch
            .iter()
            .filter_map(|id| state.graph.task(id).cloned())
            .map(|t| {
                let ctx = state.context.assemble(&t.name);
                (t, ctx)
            })
            .collect();
        for (task, _) in &prepared {
            state.states.insert(task.name.clone(), TaskState::Running);
        }

        let semaphore = Semaphore::new(self.settings.max_fanout.max(1));
        let outcomes = join_all(prepared.into_iter().map(|(task, context)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.execute_task(task, context).await
            }
        }))
        .await;

        for outcome in outcomes {
            self.settle(&mut state, outcome);
        }
        self.conclude(&mut state);
        state
    }

    /// 一步落账完成后决定终态：有失败则传播、记录未执行任务并进入 Failed；全部完成则 Succeeded
    fn conclude(&self, state: &mut RunState) {
        if state.status != RunStatus::Running {
            return;
        }
        if let Some(failed) = state.failure.as_ref().map(|f| f.task.clone()) {
            self.propagate_failure(state);
            self.skip_unreached(state, &failed);
            self.finish(state, RunStatus::Failed);
        } else if state.states.values().all(|s| *s == TaskState::Completed) {
            self.finish(state, RunStatus::Succeeded);
        }
    }

    pub async fn run_to_completion(&self, mut state: RunState) -> RunState {
        while !state.status.is_terminal() {
            state = self.step(state).await;
        }
        state
    }

    pub async fn run(&self, graph: TaskGraph) -> RunReport {
        let state = self.start(graph);
        self.run_to_completion(state).await.into_report()
    }

    /// 从快照重放：from_task 及其下游重新执行，其余任务直接采用快照中的输出
    pub async fn replay(
        &self,
        graph: TaskGraph,
        snapshot: &RunReport,
        from_task: &str,
    ) -> Result<RunReport, CrewError> {
        if !graph.contains(from_task) {
            return Err(CrewError::config(format!("replay target '{from_task}' is not a task")));
        }
        let mut rerun = graph.downstream_of(from_task);
        rerun.insert(from_task.to_string());

        let seeds: Vec<(TaskId, ContextEntry)> = graph
            .topological_order()
            .iter()
            .filter(|id| !rerun.contains(*id))
            .map(|id| {
                snapshot
                    .context
                    .iter()
                    .find(|e| &e.task_id == id)
                    .cloned()
                    .map(|e| (id.clone(), e))
                    .ok_or_else(|| {
                        CrewError::config(format!("snapshot has no output for upstream task '{id}'"))
                    })
            })
            .collect::<Result<_, _>>()?;

        let mut state = self.start(graph);
        for (id, entry) in seeds {
            let now = chrono::Utc::now().timestamp_millis();
            state.records.push(TaskRecord {
                task: id.clone(),
                worker: entry.worker.clone(),
                status: TaskState::Completed,
                attempts: 0,
                output: Some(entry.artifact.clone()),
                error: None,
                artifact: None,
                started_at: now,
                finished_at: now,
                delegated_by: None,
                seeded: true,
            });
            state.context.append(entry)?;
            state.states.insert(id, TaskState::Completed);
        }
        tracing::info!(run_id = %state.run_id, from = %from_task, rerun = rerun.len(), "replay seeded");
        Ok(self.run_to_completion(state).await.into_report())
    }

    fn delegation_enabled(&self, worker: &Worker) -> bool {
        self.settings.process == ProcessModel::Hierarchical
            && worker.can_delegate()
            && self
                .settings
                .manager
                .as_deref()
                .map_or(true, |m| m == worker.name())
    }

    async fn execute_task(&self, task: TaskDefinition, context: String) -> TaskOutcome {
        let started_at = chrono::Utc::now().timestamp_millis();
        self.emit(RunEvent::TaskStarted {
            task: task.name.clone(),
            worker: task.worker.clone(),
        });
        tracing::info!(task = %task.name, worker = %task.worker, "task started");

        let mut attempts = 0u32;
        let mut aggregations = Vec::new();
        let result = match self.workers.get(&task.worker) {
            None => Err(CrewError::config(format!(
                "task '{}' references unknown worker '{}'",
                task.name, task.worker
            ))),
            Some(worker) => {
                let dispatcher = self.delegation_enabled(&worker).then(|| {
                    Dispatcher::new(
                        &self.workers,
                        &self.invoker,
                        &context,
                        DelegationLimits {
                            max_fanout: self.settings.max_fanout,
                            child_timeout: self.settings.delegation_timeout,
                            max_per_step: self.settings.max_delegations,
                            tool_timeout: self.settings.tool_timeout,
                        },
                    )
                    .with_event_tx(self.event_tx.as_ref())
                });
                let cancel = self.supervisor.child_token();
                let attempt_loop =
                    self.attempt_loop(&task, &worker, &context, dispatcher.as_ref(), cancel, &mut attempts);
                let result = match self.settings.task_timeout {
                    Some(limit) => tokio::time::timeout(limit, attempt_loop)
                        .await
                        .unwrap_or_else(|_| {
                            Err(CrewError::Timeout {
                                task: task.name.clone(),
                                after: limit,
                            })
                        }),
                    None => attempt_loop.await,
                };
                if let Some(d) = &dispatcher {
                    aggregations = d.take_aggregations();
                }
                result
            }
        };

        TaskOutcome {
            task,
            context,
            result,
            attempts,
            aggregations,
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 重试循环：补全服务错误退避重试，校验失败带纠正提示重试一次
    async fn attempt_loop(
        &self,
        task: &TaskDefinition,
        worker: &Worker,
        context: &str,
        dispatcher: Option<&Dispatcher<'_>>,
        cancel: CancellationToken,
        attempts: &mut u32,
    ) -> Result<String, CrewError> {
        let mut service_failures = 0u32;
        let mut validation_failures = 0u32;
        let mut feedback: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CrewError::Cancelled);
            }
            *attempts += 1;

            let mut session = WorkerSession::new(task, context, &self.invoker, cancel.clone())
                .with_feedback(feedback.as_deref())
                .with_event_tx(self.event_tx.as_ref());
            if let Some(d) = dispatcher {
                session = session.with_delegation(d);
            }
            if let Some(t) = self.settings.tool_timeout {
                session = session.with_tool_timeout(t);
            }

            let err = match worker.act(&session).await {
                Ok(output) => match validate_output(&task.expected_output, &output) {
                    Ok(()) => return Ok(output),
                    Err(reason) => {
                        validation_failures += 1;
                        tracing::warn!(task = %task.name, reason = %reason, "output validation failed");
                        self.emit(RunEvent::ValidationFailed {
                            task: task.name.clone(),
                            reason: reason.clone(),
                        });
                        let err = CrewError::OutputValidation {
                            task: task.name.clone(),
                            reason,
                        };
                        match self.recovery.handle(&err, validation_failures) {
                            RecoveryAction::RetryWithPrompt(prompt) => {
                                feedback = Some(prompt);
                                continue;
                            }
                            _ => return Err(err),
                        }
                    }
                },
                Err(e) => e,
            };

            if matches!(err, CrewError::Service(_)) {
                service_failures += 1;
            }
            match self.recovery.handle(&err, service_failures) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(
                        task = %task.name,
                        attempt = *attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after backoff"
                    );
                    self.emit(RunEvent::Retry {
                        task: task.name.clone(),
                        attempt: *attempts,
                        delay_ms: delay.as_millis() as u64,
                        reason: err.to_string(),
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CrewError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::RetryWithPrompt(prompt) => feedback = Some(prompt),
                RecoveryAction::Abort => return Err(err),
            }
        }
    }

    /// 落账：成功则写产物、追加上下文；失败则记录首个失败，由 conclude 决定终态
    fn settle(&self, state: &mut RunState, outcome: TaskOutcome) {
        let TaskOutcome {
            task,
            context,
            result,
            attempts,
            aggregations,
            started_at,
            finished_at,
        } = outcome;

        let result = result.and_then(|output| {
            let artifact = match (&self.artifacts, &task.output_file) {
                (Some(writer), Some(dest)) => Some(
                    writer
                        .write_once(&mut state.written, dest, &output)?
                        .display()
                        .to_string(),
                ),
                _ => None,
            };
            Ok((output, artifact))
        });

        let parent_ok = result.is_ok();
        for agg in &aggregations {
            for outcome in &agg.outcomes {
                let (status, output, error) = match outcome {
                    SubTaskOutcome::Completed { output, .. } => {
                        (TaskState::Completed, Some(output.clone()), None)
                    }
                    SubTaskOutcome::Failed { reason, .. } => {
                        (TaskState::Failed, None, Some(reason.clone()))
                    }
                };
                if let (true, SubTaskOutcome::Completed { child, worker, output }) = (parent_ok, outcome) {
                    let entry = ContextEntry::completed(child.clone(), worker.clone(), output.clone(), 1)
                        .delegated_by(task.name.clone());
                    if let Err(e) = state.context.append(entry) {
                        tracing::warn!(child = %child, error = %e, "delegated output not recorded");
                    }
                }
                let worker = match outcome {
                    SubTaskOutcome::Completed { worker, .. } | SubTaskOutcome::Failed { worker, .. } => worker.clone(),
                };
                state.records.push(TaskRecord {
                    task: outcome.child().to_string(),
                    worker,
                    status,
                    attempts: 1,
                    output,
                    error,
                    artifact: None,
                    started_at,
                    finished_at,
                    delegated_by: Some(task.name.clone()),
                    seeded: false,
                });
            }
        }
        state.delegations.extend(aggregations);

        match result {
            Ok((output, artifact)) => {
                let entry = ContextEntry::completed(task.name.clone(), task.worker.clone(), output.clone(), attempts);
                if let Err(e) = state.context.append(entry) {
                    self.fail_task(state, &task, context, attempts, e, started_at, finished_at);
                    return;
                }
                state.states.insert(task.name.clone(), TaskState::Completed);
                state.records.push(TaskRecord {
                    task: task.name.clone(),
                    worker: task.worker.clone(),
                    status: TaskState::Completed,
                    attempts,
                    output: Some(output),
                    error: None,
                    artifact,
                    started_at,
                    finished_at,
                    delegated_by: None,
                    seeded: false,
                });
                tracing::info!(task = %task.name, attempts, "task completed");
                self.emit(RunEvent::TaskCompleted {
                    task: task.name.clone(),
                    attempts,
                });
            }
            Err(e) => self.fail_task(state, &task, context, attempts, e, started_at, finished_at),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fail_task(
        &self,
        state: &mut RunState,
        task: &TaskDefinition,
        context: String,
        attempts: u32,
        err: CrewError,
        started_at: i64,
        finished_at: i64,
    ) {
        tracing::error!(task = %task.name, attempts, timeout = err.is_timeout(), error = %err, "task failed");
        self.emit(RunEvent::TaskFailed {
            task: task.name.clone(),
            error: err.to_string(),
        });
        state.states.insert(task.name.clone(), TaskState::Failed);
        state.records.push(TaskRecord {
            task: task.name.clone(),
            worker: task.worker.clone(),
            status: TaskState::Failed,
            attempts,
            output: None,
            error: Some(err.to_string()),
            artifact: None,
            started_at,
            finished_at,
            delegated_by: None,
            seeded: false,
        });
        if state.failure.is_none() {
            state.failure = Some(RunFailure {
                task: task.name.clone(),
                kind: err.failure_kind(),
                message: err.to_string(),
                context_snapshot: context,
            });
        }
    }

    /// 依赖已失败的等待任务一律标记为 DependencyError，不会被静默跳过
    fn propagate_failure(&self, state: &mut RunState) {
        let order: Vec<TaskId> = state.graph.topological_order().to_vec();
        for id in order {
            if state.state_of(&id) != Some(TaskState::Waiting) {
                continue;
            }
            let failed_dep = state
                .graph
                .dependencies(&id)
                .iter()
                .find(|d| state.state_of(d) == Some(TaskState::Failed))
                .cloned();
            let Some(dependency) = failed_dep else {
                continue;
            };
            let err = CrewError::Dependency {
                task: id.clone(),
                dependency,
            };
            let worker = state.graph.task(&id).map(|t| t.worker.clone()).unwrap_or_default();
            let now = chrono::Utc::now().timestamp_millis();
            tracing::warn!(task = %id, error = %err, "dependency failed");
            self.emit(RunEvent::TaskFailed {
                task: id.clone(),
                error: err.to_string(),
            });
            state.states.insert(id.clone(), TaskState::Failed);
            state.records.push(TaskRecord {
                task: id,
                worker,
                status: TaskState::Failed,
                attempts: 0,
                output: None,
                error: Some(err.to_string()),
                artifact: None,
                started_at: now,
                finished_at: now,
                delegated_by: None,
                seeded: false,
            });
        }
    }

    /// 与失败无依赖关系、但因运行终止而未执行的任务记为 Skipped，报告覆盖全部任务
    fn skip_unreached(&self, state: &mut RunState, failed: &str) {
        let reason = format!("run halted after task '{failed}' failed");
        let order: Vec<TaskId> = state.graph.topological_order().to_vec();
        for id in order {
            if state.state_of(&id) != Some(TaskState::Waiting) {
                continue;
            }
            let worker = state.graph.task(&id).map(|t| t.worker.clone()).unwrap_or_default();
            let now = chrono::Utc::now().timestamp_millis();
            tracing::info!(task = %id, "task skipped");
            self.emit(RunEvent::TaskSkipped {
                task: id.clone(),
                reason: reason.clone(),
            });
            state.states.insert(id.clone(), TaskState::Skipped);
            state.records.push(TaskRecord {
                task: id,
                worker,
                status: TaskState::Skipped,
                attempts: 0,
                output: None,
                error: Some(reason.clone()),
                artifact: None,
                started_at: now,
                finished_at: now,
                delegated_by: None,
                seeded: false,
            });
        }
    }

    fn finish(&self, state: &mut RunState, status: RunStatus) {
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        state.finished_at = Some(chrono::Utc::now().timestamp_millis());
        tracing::info!(
            run_id = %state.run_id,
            status = %status,
            duration_ms = state.finished_at.unwrap_or(state.started_at) - state.started_at,
            "run finished"
        );
        self.emit(RunEvent::RunFinished {
            run_id: state.run_id.clone(),
            status: status.to_string(),
        });
    }
}
