//! 工作流集成测试：以确定性补全桩驱动完整运行

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crew::config::{load_config, AppConfig};
use crew::core::{BackoffPolicy, CrewError, FailureKind, RunEvent};
use crew::llm::{LlmClient, LlmError, Message, MockLlmClient, Role, ScriptedLlmClient};
use crew::runtime::{create_artifact_writer, create_invoker};
use crew::tools::{Tool, ToolInvoker, ToolRegistry};
use crew::worker::SubTaskOutcome;
use crew::workflow::{
    evaluate_runs, train, ArtifactWriter, CrewBuilder, CrewSpec, EngineSettings, Evaluator, FieldKind,
    OutputSchema, ProcessModel, RunReport, RunStatus, TaskDefinition, TaskState, TrainingData,
    WorkerDefinition, EXIT_EXECUTION,
};

const REVIEWERS: [&str; 5] = [
    "code_reviewer",
    "security_analyst",
    "performance_engineer",
    "software_architect",
    "refactoring_editor",
];

fn empty_invoker() -> ToolInvoker {
    ToolInvoker::new(ToolRegistry::new(), Duration::from_secs(5))
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        backoff: BackoffPolicy::none(),
        ..EngineSettings::default()
    }
}

/// 最后一条 user 消息
fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// 第一条 user 消息（任务提示词）
fn task_prompt(messages: &[Message]) -> &str {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// 代码评审流程：三路评审 -> 架构 -> 重构；架构任务的依赖声明顺序与完成顺序不同
fn review_builder() -> CrewBuilder {
    let mut builder = CrewBuilder::new("review");
    for name in REVIEWERS {
        builder = builder.worker(WorkerDefinition::new(name, format!("{name} role")));
    }
    builder
        .task(TaskDefinition::new("code_review", "Review the code", "code_reviewer"))
        .task(TaskDefinition::new("security_audit", "Audit security", "security_analyst"))
        .task(TaskDefinition::new("performance_review", "Review performance", "performance_engineer"))
        .task(
            TaskDefinition::new("architecture", "Plan the refactor", "software_architect").depends_on([
                "security_audit",
                "code_review",
                "performance_review",
            ]),
        )
        .task(
            TaskDefinition::new("refactor", "Write the patch", "refactoring_editor")
                .depends_on(["architecture"]),
        )
}

fn scripted_answers() -> HashMap<&'static str, Arc<ScriptedLlmClient>> {
    REVIEWERS
        .iter()
        .map(|name| {
            let client = ScriptedLlmClient::new([format!("Final Answer: {name} findings")]);
            (*name, Arc::new(client))
        })
        .collect()
}

fn with_clients(
    mut builder: CrewBuilder,
    clients: &HashMap<&'static str, Arc<ScriptedLlmClient>>,
) -> CrewBuilder {
    for (name, client) in clients {
        let llm: Arc<dyn LlmClient> = client.clone();
        builder = builder.llm_for(*name, llm);
    }
    builder
}

async fn run_review(
    clients: &HashMap<&'static str, Arc<ScriptedLlmClient>>,
    settings: EngineSettings,
) -> RunReport {
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), clients)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, settings).unwrap();
    engine.run(graph).await
}

/// 按固定延迟给出最终答案的补全客户端
struct SlowLlm {
    delay: Duration,
    answer: String,
}

#[async_trait]
impl LlmClient for SlowLlm {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("Final Answer: {}", self.answer))
    }
}

/// 永远比调用超时慢的工具
struct SlowTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow_lookup"
    }

    fn description(&self) -> &str {
        "Looks something up, slowly"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok("too late".to_string())
    }
}

#[tokio::test]
async fn test_sequential_order_and_declared_context_order() {
    let clients = scripted_answers();
    let report = run_review(&clients, fast_settings()).await;

    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.execution_order(),
        vec!["code_review", "security_audit", "performance_review", "architecture", "refactor"]
    );

    let architect_calls = clients["software_architect"].calls();
    assert_eq!(architect_calls.len(), 1);
    let prompt = task_prompt(&architect_calls[0]);
    let security = prompt.find("## Output of security_audit\nsecurity_analyst findings").unwrap();
    let review = prompt.find("## Output of code_review\ncode_reviewer findings").unwrap();
    let perf = prompt
        .find("## Output of performance_review\nperformance_engineer findings")
        .unwrap();
    assert!(security < review && review < perf);

    let refactor_prompt = task_prompt(&clients["refactoring_editor"].calls()[0]).to_string();
    assert!(refactor_prompt.contains("software_architect findings"));
    assert!(!refactor_prompt.contains("## Output of code_review"));

    assert_eq!(report.final_output(), Some("refactoring_editor findings"));
    assert_eq!(report.output_of("architecture"), Some("software_architect findings"));
}

#[tokio::test]
async fn test_failure_propagates_downstream_and_stops_run() {
    let mut clients = scripted_answers();
    clients.insert(
        "security_analyst",
        Arc::new(ScriptedLlmClient::failing(LlmError::ApiError("upstream 500".into()))),
    );
    let settings = EngineSettings {
        max_retries: 2,
        ..fast_settings()
    };
    let report = run_review(&clients, settings).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), EXIT_EXECUTION);
    assert_eq!(clients["security_analyst"].call_count(), 3);

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.task, "security_audit");
    assert_eq!(failure.kind, FailureKind::Service);

    for downstream in ["architecture", "refactor"] {
        let record = report.record(downstream).unwrap();
        assert_eq!(record.status, TaskState::Failed);
        assert_eq!(record.attempts, 0);
        assert!(record.error.as_deref().unwrap().contains("Dependency"));
    }
    assert_eq!(clients["software_architect"].call_count(), 0);
    assert_eq!(clients["refactoring_editor"].call_count(), 0);
    assert!(report.output_of("code_review").is_some());
    assert!(report.output_of("architecture").is_none());

    // 与失败无关但未轮到的任务也要出现在报告里
    let unreached = report.record("performance_review").unwrap();
    assert_eq!(unreached.status, TaskState::Skipped);
    assert_eq!(unreached.attempts, 0);
    assert!(unreached.error.as_deref().unwrap().contains("security_audit"));
    assert_eq!(clients["performance_engineer"].call_count(), 0);
    assert_eq!(report.tasks.len(), 5);
    assert_eq!(report.execution_order(), vec!["code_review", "security_audit"]);
}

#[tokio::test]
async fn test_transient_service_errors_are_retried() {
    let mut clients = scripted_answers();
    clients.insert(
        "code_reviewer",
        Arc::new(
            ScriptedLlmClient::new(Vec::<String>::new())
                .then_error(LlmError::RateLimited { retry_after_ms: 0 })
                .then_error(LlmError::ApiError("502".into()))
                .then("Final Answer: recovered"),
        ),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &clients)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    let report = engine.with_events(tx).run(graph).await;

    assert!(report.succeeded());
    assert_eq!(report.record("code_review").unwrap().attempts, 3);
    assert_eq!(report.output_of("code_review"), Some("recovered"));

    let mut retries = 0;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, RunEvent::Retry { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_invalid_output_gets_one_corrective_attempt() {
    let schema = OutputSchema {
        description: "Refactor plan".to_string(),
        required: vec!["summary".to_string(), "steps".to_string()],
        properties: [
            ("summary".to_string(), FieldKind::String),
            ("steps".to_string(), FieldKind::Array),
        ]
        .into_iter()
        .collect(),
    };
    let build = |client: Arc<ScriptedLlmClient>| {
        let invoker = empty_invoker();
        let llm: Arc<dyn LlmClient> = client;
        let crew = CrewBuilder::new("plan")
            .worker(WorkerDefinition::new("architect", "Architect"))
            .task(TaskDefinition::new("plan", "Plan it", "architect").expect_schema(schema.clone()))
            .llm_for("architect", llm)
            .build(Arc::new(MockLlmClient), &invoker)
            .unwrap();
        crew.into_engine(invoker, fast_settings()).unwrap()
    };

    let fixed = Arc::new(ScriptedLlmClient::new([
        "Final Answer: here is my plan in prose",
        r#"Final Answer: {"summary": "split module", "steps": ["a", "b"]}"#,
    ]));
    let (engine, graph) = build(fixed.clone());
    let report = engine.run(graph).await;
    assert!(report.succeeded());
    assert_eq!(report.record("plan").unwrap().attempts, 2);
    assert!(task_prompt(&fixed.calls()[1]).contains("rejected"));

    let stubborn = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()).with_fallback("Final Answer: still prose"));
    let (engine, graph) = build(stubborn.clone());
    let report = engine.run(graph).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failure.unwrap().kind, FailureKind::Validation);
    assert_eq!(stubborn.call_count(), 2);
}

#[tokio::test]
async fn test_tool_timeout_is_observed_until_iterations_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(SlowTool { calls: calls.clone() });
    let invoker = ToolInvoker::new(registry, Duration::from_millis(1));

    let llm = Arc::new(
        ScriptedLlmClient::new(Vec::<String>::new()).with_fallback(r#"{"tool": "slow_lookup", "args": {"q": "x"}}"#),
    );
    let crew = CrewBuilder::new("lookup")
        .worker(
            WorkerDefinition::new("researcher", "Researcher")
                .tools(["slow_lookup"])
                .max_iterations(2),
        )
        .task(TaskDefinition::new("lookup", "Look it up", "researcher"))
        .build(llm.clone(), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    let report = engine.run(graph).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(llm.call_count(), 2);
    let failure = report.failure.unwrap();
    assert_eq!(failure.task, "lookup");
    assert_eq!(failure.kind, FailureKind::Worker);
    // 第二轮提示词中带有第一轮的超时 Observation
    assert!(last_user(&llm.calls()[1]).contains("Observation: Error"));
}

#[tokio::test]
async fn test_hierarchical_delegation_keeps_partial_results() {
    let invoker = empty_invoker();
    let manager = Arc::new(ScriptedLlmClient::new([
        r#"{"delegate": [
            {"worker": "style_checker", "instruction": "check style"},
            {"worker": "security_checker", "instruction": "check security"},
            {"worker": "perf_checker", "instruction": "check performance"}
        ]}"#,
        "Final Answer: merged review",
    ]));
    let style = Arc::new(ScriptedLlmClient::new(["Final Answer: style ok"]));
    let security = Arc::new(ScriptedLlmClient::new(["Final Answer: no injection"]));
    let slow: Arc<dyn LlmClient> = Arc::new(SlowLlm {
        delay: Duration::from_secs(5),
        answer: "perf notes".to_string(),
    });

    let manager_llm: Arc<dyn LlmClient> = manager.clone();
    let style_llm: Arc<dyn LlmClient> = style.clone();
    let security_llm: Arc<dyn LlmClient> = security.clone();
    let crew = CrewBuilder::new("hierarchy")
        .process(ProcessModel::Hierarchical)
        .manager("lead")
        .worker(WorkerDefinition::new("lead", "Review lead").allow_delegation(true))
        .worker(WorkerDefinition::new("style_checker", "Style checker"))
        .worker(WorkerDefinition::new("security_checker", "Security checker"))
        .worker(WorkerDefinition::new("perf_checker", "Performance checker"))
        .task(TaskDefinition::new("review", "Coordinate the review", "lead"))
        .llm_for("lead", manager_llm)
        .llm_for("style_checker", style_llm)
        .llm_for("security_checker", security_llm)
        .llm_for("perf_checker", slow)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let settings = EngineSettings {
        delegation_timeout: Duration::from_millis(100),
        ..fast_settings()
    };
    let (engine, graph) = crew.into_engine(invoker, settings).unwrap();

    let started = Instant::now();
    let report = engine.run(graph).await;
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(report.succeeded());
    assert_eq!(report.final_output(), Some("merged review"));
    assert_eq!(report.execution_order(), vec!["review"]);

    assert_eq!(report.delegations.len(), 1);
    let agg = &report.delegations[0];
    assert_eq!(agg.succeeded(), 2);
    assert_eq!(agg.failed(), 1);
    let ids: Vec<&str> = agg.outcomes.iter().map(|o| o.child()).collect();
    assert_eq!(ids, vec!["review::delegate-1", "review::delegate-2", "review::delegate-3"]);
    match &agg.outcomes[2] {
        SubTaskOutcome::Failed { worker, reason, .. } => {
            assert_eq!(worker, "perf_checker");
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(report.output_of("review::delegate-1"), Some("style ok"));
    assert_eq!(report.output_of("review::delegate-2"), Some("no injection"));
    assert!(report.output_of("review::delegate-3").is_none());
    let child = report.record("review::delegate-1").unwrap();
    assert_eq!(child.delegated_by.as_deref(), Some("review"));

    let observation = last_user(&manager.calls()[1]).to_string();
    assert!(observation.contains("2 completed, 1 failed"));
    assert!(observation.contains("review::delegate-3 (perf_checker) FAILED"));
}

#[tokio::test]
async fn test_hierarchical_runs_ready_frontier_concurrently() {
    let invoker = empty_invoker();
    let mut builder = CrewBuilder::new("parallel").process(ProcessModel::Hierarchical);
    for name in ["a", "b", "c"] {
        let llm: Arc<dyn LlmClient> = Arc::new(SlowLlm {
            delay: Duration::from_millis(300),
            answer: format!("{name} done"),
        });
        builder = builder
            .worker(WorkerDefinition::new(name, name))
            .task(TaskDefinition::new(format!("task_{name}"), "work", name))
            .llm_for(name, llm);
    }
    let crew = builder
        .worker(WorkerDefinition::new("joiner", "Joiner"))
        .task(TaskDefinition::new("join", "Combine", "joiner").depends_on(["task_c", "task_a", "task_b"]))
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();

    let started = Instant::now();
    let report = engine.run(graph).await;
    assert!(started.elapsed() < Duration::from_millis(850));

    assert!(report.succeeded());
    assert_eq!(report.execution_order(), vec!["task_a", "task_b", "task_c", "join"]);
    let join_output = report.output_of("join").unwrap();
    assert!(join_output.starts_with("[mock] Combine"));
}

#[tokio::test]
async fn test_cancel_before_start_settles_first_task() {
    let clients = scripted_answers();
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &clients)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    engine.cancel();
    let report = engine.run(graph).await;

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.task, "code_review");
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert!(clients.values().all(|c| c.call_count() == 0));
    assert_eq!(report.tasks.len(), 5);
    assert_eq!(report.record("security_audit").unwrap().status, TaskState::Skipped);
    assert_eq!(report.record("architecture").unwrap().status, TaskState::Failed);
}

#[tokio::test]
async fn test_cancel_interrupts_running_completion() {
    let invoker = empty_invoker();
    let slow: Arc<dyn LlmClient> = Arc::new(SlowLlm {
        delay: Duration::from_secs(10),
        answer: "never".to_string(),
    });
    let crew = CrewBuilder::new("slow")
        .worker(WorkerDefinition::new("thinker", "Thinker"))
        .task(TaskDefinition::new("think", "Think hard", "thinker"))
        .build(slow, &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    let supervisor = engine.supervisor().clone();

    let started = Instant::now();
    let (report, _) = tokio::join!(engine.run(graph), async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.cancel();
    });
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.failure.unwrap().kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn test_replay_reruns_only_target_and_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("run.json");

    let first = scripted_answers();
    let report = run_review(&first, fast_settings()).await;
    report.save_snapshot(&snapshot_path).unwrap();
    let snapshot = RunReport::load_snapshot(&snapshot_path).unwrap();

    let mut second: HashMap<&'static str, Arc<ScriptedLlmClient>> = REVIEWERS
        .iter()
        .map(|name| (*name, Arc::new(ScriptedLlmClient::new(Vec::<String>::new()))))
        .collect();
    second.insert(
        "software_architect",
        Arc::new(ScriptedLlmClient::new(["Final Answer: revised plan"])),
    );
    second.insert(
        "refactoring_editor",
        Arc::new(ScriptedLlmClient::new(["Final Answer: revised patch"])),
    );

    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &second)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    let replayed = engine.replay(graph, &snapshot, "architecture").await.unwrap();

    assert!(replayed.succeeded());
    assert_ne!(replayed.run_id, snapshot.run_id);
    assert_eq!(replayed.execution_order(), vec!["architecture", "refactor"]);
    assert!(replayed.record("code_review").unwrap().seeded);
    assert_eq!(replayed.output_of("code_review"), Some("code_reviewer findings"));
    assert_eq!(replayed.final_output(), Some("revised patch"));
    assert_eq!(second["code_reviewer"].call_count(), 0);
    assert!(task_prompt(&second["software_architect"].calls()[0]).contains("security_analyst findings"));
}

#[tokio::test]
async fn test_replay_requires_upstream_outputs() {
    let mut clients = scripted_answers();
    clients.insert(
        "performance_engineer",
        Arc::new(ScriptedLlmClient::failing(LlmError::EmptyResponse)),
    );
    let settings = EngineSettings {
        max_retries: 0,
        ..fast_settings()
    };
    let failed = run_review(&clients, settings).await;
    assert!(!failed.succeeded());

    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &scripted_answers())
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    let err = engine.replay(graph, &failed, "refactor").await.unwrap_err();
    assert!(matches!(err, CrewError::Config(msg) if msg.contains("performance_review")));
}

#[tokio::test]
async fn test_artifacts_are_identical_across_runs() {
    let build_and_run = |root: std::path::PathBuf| async move {
        let invoker = empty_invoker();
        let mut builder = review_builder();
        builder = builder.task(
            TaskDefinition::new("summary", "Summarise for {audience}", "code_reviewer")
                .depends_on(["refactor"])
                .output_file("reports/{audience}/summary.md"),
        );
        let crew = builder
            .input("audience", "team")
            .build(Arc::new(MockLlmClient), &invoker)
            .unwrap();
        let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
        engine.with_artifacts(ArtifactWriter::new(&root)).run(graph).await
    };

    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let first = build_and_run(first_dir.path().to_path_buf()).await;
    let second = build_and_run(second_dir.path().to_path_buf()).await;
    assert!(first.succeeded() && second.succeeded());

    let a = std::fs::read_to_string(first_dir.path().join("reports/team/summary.md")).unwrap();
    let b = std::fs::read_to_string(second_dir.path().join("reports/team/summary.md")).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, "[mock] Summarise for team");
    assert!(first.record("summary").unwrap().artifact.is_some());
}

#[tokio::test]
async fn test_build_time_errors_are_config_errors() {
    let invoker = empty_invoker();
    let cyclic = CrewBuilder::new("cycle")
        .worker(WorkerDefinition::new("w", "Worker"))
        .task(TaskDefinition::new("a", "A", "w").depends_on(["b"]))
        .task(TaskDefinition::new("b", "B", "w").depends_on(["a"]))
        .build(Arc::new(MockLlmClient), &invoker);
    assert!(matches!(cyclic, Err(CrewError::Config(_))));

    let unknown_tool = CrewBuilder::new("tools")
        .worker(WorkerDefinition::new("w", "Worker").tools(["teleport"]))
        .task(TaskDefinition::new("a", "A", "w"))
        .build(Arc::new(MockLlmClient), &invoker);
    assert!(matches!(unknown_tool, Err(CrewError::Config(msg)) if msg.contains("teleport")));

    let missing_input = CrewBuilder::new("inputs")
        .worker(WorkerDefinition::new("w", "Worker"))
        .task(TaskDefinition::new("a", "Review {codebase_path}", "w"))
        .build(Arc::new(MockLlmClient), &invoker);
    assert!(matches!(missing_input, Err(CrewError::Config(msg)) if msg.contains("codebase_path")));
}

#[tokio::test]
async fn test_shipped_codereviewer_crew_runs_with_mock() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig::default();
    cfg.app.workspace_root = Some(dir.path().to_path_buf());

    let spec = CrewSpec::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/crews/codereviewer.toml")).unwrap();
    assert_eq!(spec.workers.len(), 5);
    assert_eq!(spec.tasks.len(), 5);

    let invoker = create_invoker(&cfg).unwrap();
    let writer = create_artifact_writer(&cfg).unwrap();
    let crew = spec
        .into_builder()
        .input("codebase_path", "./src")
        .worker_settings(cfg.worker_settings())
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, cfg.engine_settings()).unwrap();
    let report = engine.with_artifacts(writer).run(graph).await;

    assert!(report.succeeded());
    assert_eq!(report.execution_order().len(), 5);
    assert_eq!(report.execution_order().last(), Some(&"refactor_implementation_task"));
    let review = std::fs::read_to_string(dir.path().join("reports/code_review.md")).unwrap();
    assert!(review.contains("./src"));
    assert!(dir.path().join("reports/refactor.patch").is_file());
}

const LEAD_CREW: &str = r#"
name = "lead"

[[workers]]
name = "lead"
role = "Lead"
allow_delegation = true

[[workers]]
name = "helper"
role = "Helper"

[[tasks]]
name = "plan"
description = "Plan the work"
expected_output = "A plan"
worker = "lead"
"#;

fn hierarchical_config(dir: &std::path::Path, manager: &str) -> AppConfig {
    let path = dir.join("engine.toml");
    std::fs::write(
        &path,
        format!("[engine]\nprocess = \"hierarchical\"\nmanager = \"{manager}\"\n"),
    )
    .unwrap();
    load_config(Some(path)).unwrap()
}

#[test]
fn test_engine_config_applies_when_crew_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = hierarchical_config(dir.path(), "lead");
    assert_eq!(cfg.engine.process, ProcessModel::Hierarchical);

    let spec = CrewSpec::from_toml_str(LEAD_CREW).unwrap();
    assert_eq!(spec.process, None);
    let invoker = empty_invoker();
    let crew = spec.into_builder().build(Arc::new(MockLlmClient), &invoker).unwrap();
    let (engine, _graph) = crew.into_engine(invoker, cfg.engine_settings()).unwrap();

    assert_eq!(engine.settings().process, ProcessModel::Hierarchical);
    assert_eq!(engine.settings().manager.as_deref(), Some("lead"));
}

#[test]
fn test_crew_process_overrides_engine_config() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = hierarchical_config(dir.path(), "lead");

    let text = LEAD_CREW.replacen("name = \"lead\"\n", "name = \"lead\"\nprocess = \"sequential\"\n", 1);
    let spec = CrewSpec::from_toml_str(&text).unwrap();
    let invoker = empty_invoker();
    let crew = spec.into_builder().build(Arc::new(MockLlmClient), &invoker).unwrap();
    let (engine, _graph) = crew.into_engine(invoker, cfg.engine_settings()).unwrap();

    assert_eq!(engine.settings().process, ProcessModel::Sequential);
    assert_eq!(engine.settings().manager.as_deref(), Some("lead"));
}

#[test]
fn test_configured_manager_is_checked_against_crew() {
    let dir = tempfile::tempdir().unwrap();
    for manager in ["ghost", "helper"] {
        let cfg = hierarchical_config(dir.path(), manager);
        let invoker = empty_invoker();
        let crew = CrewSpec::from_toml_str(LEAD_CREW)
            .unwrap()
            .into_builder()
            .build(Arc::new(MockLlmClient), &invoker)
            .unwrap();
        let err = crew.into_engine(invoker, cfg.engine_settings()).err().unwrap();
        assert!(matches!(err, CrewError::Config(ref m) if m.contains(manager)));
    }
}

fn repeating_answers() -> HashMap<&'static str, Arc<ScriptedLlmClient>> {
    REVIEWERS
        .iter()
        .map(|name| {
            let client = ScriptedLlmClient::new(Vec::<String>::new())
                .with_fallback(format!("Final Answer: {name} findings"));
            (*name, Arc::new(client))
        })
        .collect()
}

#[tokio::test]
async fn test_evaluate_runs_scores_every_task_per_run() {
    let clients = repeating_answers();
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &clients)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();

    let judge = Arc::new(
        ScriptedLlmClient::new(["I cannot grade this"])
            .with_fallback(r#"{"score": 8, "feedback": "Cite file paths."}"#),
    );
    let evaluator = Evaluator::new(judge.clone());
    let report = evaluate_runs(&engine, &graph, &evaluator, 2).await;

    assert_eq!(report.iterations.len(), 2);
    assert!(report.all_succeeded());
    assert_eq!(report.tasks[0], "code_review");
    assert_eq!(judge.call_count(), 10);
    assert!(task_prompt(&judge.calls()[0]).contains("code_reviewer findings"));

    assert_eq!(report.score_of(1, "code_review"), None);
    assert!(report.iterations[0].unscored["code_review"].contains("no score"));
    assert_eq!(report.score_of(2, "code_review"), Some(8.0));
    assert_eq!(report.averages()["code_review"], 8.0);
    assert_eq!(report.averages().len(), 5);
    assert_eq!(clients["code_reviewer"].call_count(), 2);
}

#[tokio::test]
async fn test_evaluate_runs_leaves_failed_tasks_unscored() {
    let mut clients = repeating_answers();
    clients.insert(
        "security_analyst",
        Arc::new(ScriptedLlmClient::failing(LlmError::ApiError("down".into()))),
    );
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &clients)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let settings = EngineSettings {
        max_retries: 0,
        ..fast_settings()
    };
    let (engine, graph) = crew.into_engine(invoker, settings).unwrap();

    let judge = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()).with_fallback(r#"{"score": 4}"#));
    let report = evaluate_runs(&engine, &graph, &Evaluator::new(judge.clone()), 1).await;

    assert!(!report.all_succeeded());
    assert_eq!(judge.call_count(), 1);
    assert_eq!(report.score_of(1, "code_review"), Some(4.0));
    let unscored = &report.iterations[0].unscored;
    assert_eq!(unscored.len(), 4);
    assert!(unscored["architecture"].contains("Dependency"));
    assert!(unscored["performance_review"].contains("run halted"));
}

#[tokio::test]
async fn test_train_collects_suggestions_and_feeds_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("training.json");

    let clients = repeating_answers();
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &clients)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();

    let judge = Arc::new(
        ScriptedLlmClient::new([r#"{"score": 5, "feedback": "List concrete file paths."}"#])
            .with_fallback(r#"{"score": 7, "feedback": "Keep findings short."}"#),
    );
    let data = train(&engine, &graph, "review", &Evaluator::new(judge), 2, 5).await;
    data.save(&path).unwrap();

    assert_eq!(data.iterations.len(), 2);
    assert!(data.all_succeeded());
    assert_eq!(data.iterations[0].feedback.len(), 5);
    assert_eq!(
        data.suggestions_for("code_reviewer"),
        ["Keep findings short.", "List concrete file paths."]
    );
    assert_eq!(data.suggestions_for("refactoring_editor"), ["Keep findings short."]);

    let loaded = TrainingData::load(&path).unwrap();
    let next = repeating_answers();
    let invoker = empty_invoker();
    let crew = with_clients(review_builder(), &next)
        .training(&loaded)
        .build(Arc::new(MockLlmClient), &invoker)
        .unwrap();
    let (engine, graph) = crew.into_engine(invoker, fast_settings()).unwrap();
    assert!(engine.run(graph).await.succeeded());

    let system = &next["code_reviewer"].calls()[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("Suggestions from previous runs:\n- Keep findings short.\n- List concrete file paths."));
}
