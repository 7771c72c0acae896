//! crew 命令行入口
//!
//! 子命令：run（按 crew 定义执行）、replay（从快照的某个任务重新执行）、trigger（以 JSON 负载作为输入执行）、
//! test（运行 N 次并由评估模型逐任务打分）、train（运行 N 次收集改进建议并写入训练文件）。
//! 退出码：0 成功；2 配置错误；3 执行失败（stderr 打印失败任务）；1 其他启动错误。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crew::config::{load_config, AppConfig};
use crew::core::{CrewError, RunSupervisor};
use crew::observability;
use crew::runtime::{create_artifact_writer, create_eval_llm, create_invoker, create_llm_from_config};
use crew::workflow::{
    evaluate_runs, train, ConsoleFeedback, CrewSpec, EvaluationReport, Evaluator, ExecutionEngine,
    FeedbackSource, RunReport, TaskGraph, TrainingData, EXIT_CONFIG, EXIT_EXECUTION, EXIT_SUCCESS,
};

#[derive(Parser, Debug)]
#[command(name = "crew", version, about = "Run a crew of workers over a task dependency graph")]
struct Cli {
    /// 额外的配置文件（叠加在 config/default.toml 之上）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 执行 crew 定义文件
    Run {
        crew: PathBuf,
        /// 运行输入，形如 key=value，可重复
        #[arg(short = 'i', long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// 运行结束后把 RunReport 写为 JSON 快照
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// crew train 生成的训练文件，建议附加到各 Worker
        #[arg(long)]
        trained: Option<PathBuf>,
    },
    /// 从快照重放：--from 指定的任务及其下游重新执行
    Replay {
        crew: PathBuf,
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long = "from")]
        from_task: String,
        #[arg(short = 'i', long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// 以 JSON 对象负载作为输入执行
    Trigger {
        crew: PathBuf,
        payload: String,
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// 运行 N 次，由评估模型给每个任务打分
    Test {
        crew: PathBuf,
        #[arg(short = 'n', long = "iterations", default_value_t = 3)]
        iterations: usize,
        /// 评估模型（缺省取 [evaluation] model）
        #[arg(long)]
        eval_model: Option<String>,
        #[arg(short = 'i', long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// 评估结果另存为 JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// 运行 N 次，收集每个任务的改进建议并写入训练文件
    Train {
        crew: PathBuf,
        #[arg(short = 'n', long = "iterations", default_value_t = 3)]
        iterations: usize,
        /// 训练文件（JSON）
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
        /// 从 stdin 逐任务读取人工建议，而不是由评估模型给出
        #[arg(long)]
        interactive: bool,
        #[arg(long)]
        eval_model: Option<String>,
        #[arg(short = 'i', long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
}

/// 各子命令的结果
enum Outcome {
    Run(RunReport),
    Evaluated(EvaluationReport),
    Trained(TrainingData),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    observability::init(cli.verbose);

    match execute(cli).await {
        Ok(Outcome::Run(report)) => report_outcome(&report),
        Ok(Outcome::Evaluated(report)) => evaluation_outcome(&report),
        Ok(Outcome::Trained(data)) => training_outcome(&data),
        Err(err) => {
            let code = exit_code_for(&err);
            tracing::error!(code, "{:#}", err);
            eprintln!("error: {:#}", err);
            ExitCode::from(code)
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<Outcome> {
    let cfg = load_config(cli.config).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            crew,
            inputs,
            snapshot,
            trained,
        } => {
            let inputs = parse_inputs(&inputs)?;
            let training = trained
                .map(|path| {
                    TrainingData::load(&path)
                        .map_err(|e| CrewError::config(format!("cannot load training file {}: {e}", path.display())))
                })
                .transpose()?;
            let (engine, graph, _) = prepare(&cfg, &crew, inputs, training.as_ref())?;
            let report = run_cancellable(&engine, engine.run(graph)).await;
            save_snapshot(&cfg, snapshot, &report)?;
            Ok(Outcome::Run(report))
        }
        Command::Replay {
            crew,
            snapshot,
            from_task,
            inputs,
        } => {
            let previous = RunReport::load_snapshot(&snapshot)
                .map_err(|e| CrewError::config(format!("cannot load snapshot: {e}")))?;
            let inputs = parse_inputs(&inputs)?;
            let (engine, graph, _) = prepare(&cfg, &crew, inputs, None)?;
            let report = run_cancellable(&engine, engine.replay(graph, &previous, &from_task)).await?;
            Ok(Outcome::Run(report))
        }
        Command::Trigger {
            crew,
            payload,
            snapshot,
        } => {
            let inputs = trigger_inputs(&payload)?;
            let (engine, graph, _) = prepare(&cfg, &crew, inputs, None)?;
            let report = run_cancellable(&engine, engine.run(graph)).await;
            save_snapshot(&cfg, snapshot, &report)?;
            Ok(Outcome::Run(report))
        }
        Command::Test {
            crew,
            iterations,
            eval_model,
            inputs,
            output,
        } => {
            let inputs = parse_inputs(&inputs)?;
            let (engine, graph, _) = prepare(&cfg, &crew, inputs, None)?;
            let evaluator = Evaluator::new(create_eval_llm(&cfg, eval_model.as_deref()))
                .with_timeout(cfg.evaluation_timeout());
            let report = run_cancellable(&engine, evaluate_runs(&engine, &graph, &evaluator, iterations)).await;
            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report).context("Failed to encode evaluation")?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write evaluation {}", path.display()))?;
            }
            Ok(Outcome::Evaluated(report))
        }
        Command::Train {
            crew,
            iterations,
            filename,
            interactive,
            eval_model,
            inputs,
        } => {
            let inputs = parse_inputs(&inputs)?;
            let (engine, graph, name) = prepare(&cfg, &crew, inputs, None)?;
            let source: Box<dyn FeedbackSource> = if interactive {
                Box::new(ConsoleFeedback::new())
            } else {
                Box::new(
                    Evaluator::new(create_eval_llm(&cfg, eval_model.as_deref()))
                        .with_timeout(cfg.evaluation_timeout()),
                )
            };
            let data = run_cancellable(
                &engine,
                train(
                    &engine,
                    &graph,
                    &name,
                    source.as_ref(),
                    iterations,
                    cfg.evaluation.max_suggestions,
                ),
            )
            .await;
            data.save(&filename)
                .with_context(|| format!("Failed to write training file {}", filename.display()))?;
            Ok(Outcome::Trained(data))
        }
    }
}

/// 读取 crew 定义、合并输入并构建引擎；返回引擎、任务图与 crew 名
fn prepare(
    cfg: &AppConfig,
    path: &Path,
    inputs: BTreeMap<String, String>,
    training: Option<&TrainingData>,
) -> anyhow::Result<(ExecutionEngine, TaskGraph, String)> {
    let spec = CrewSpec::from_file(path)?;
    let invoker = create_invoker(cfg).context("Failed to prepare tool sandbox")?;
    let writer = create_artifact_writer(cfg).context("Failed to prepare artifacts directory")?;
    let llm = create_llm_from_config(cfg);

    let mut builder = spec
        .into_builder()
        .inputs(inputs)
        .worker_settings(cfg.worker_settings());
    if let Some(data) = training {
        builder = builder.training(data);
    }
    let crew = builder.build(llm, &invoker)?;
    tracing::info!(crew = %crew.name, path = %path.display(), "crew loaded");

    let name = crew.name.clone();
    let (engine, graph) = crew.into_engine(invoker, cfg.engine_settings())?;
    Ok((engine.with_artifacts(writer), graph, name))
}

/// 运行期间监听 Ctrl+C，收到后取消运行（当前任务以 Cancelled 结束）
async fn run_cancellable<F: std::future::Future>(engine: &ExecutionEngine, run: F) -> F::Output {
    let supervisor: RunSupervisor = engine.supervisor().clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            supervisor.cancel();
        }
    });
    let output = run.await;
    watcher.abort();
    output
}

fn save_snapshot(cfg: &AppConfig, explicit: Option<PathBuf>, report: &RunReport) -> anyhow::Result<()> {
    if let Some(path) = explicit.or_else(|| cfg.artifacts.snapshot.clone()) {
        report
            .save_snapshot(&path)
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
    }
    Ok(())
}

fn parse_inputs(raw: &[String]) -> Result<BTreeMap<String, String>, CrewError> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(k, _)| !k.trim().is_empty())
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| CrewError::config(format!("input '{pair}' is not KEY=VALUE")))
        })
        .collect()
}

/// 字符串值原样作为输入，其余值 JSON 编码；整个负载另存为 trigger_payload
fn trigger_inputs(payload: &str) -> Result<BTreeMap<String, String>, CrewError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| CrewError::config(format!("trigger payload is not valid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| CrewError::config("trigger payload must be a JSON object"))?;

    let mut inputs: BTreeMap<String, String> = object
        .iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect();
    inputs.insert("trigger_payload".to_string(), value.to_string());
    Ok(inputs)
}

fn report_outcome(report: &RunReport) -> ExitCode {
    tracing::info!(
        run_id = %report.run_id,
        status = %report.status,
        duration_ms = report.duration_ms(),
        "run finished"
    );
    if report.succeeded() {
        if let Some(output) = report.final_output() {
            println!("{output}");
        }
    } else if let Some(failure) = &report.failure {
        eprintln!("task '{}' failed ({:?}): {}", failure.task, failure.kind, failure.message);
    }
    ExitCode::from(report.exit_code())
}

fn evaluation_outcome(report: &EvaluationReport) -> ExitCode {
    println!("{}", report.render_table());
    for it in &report.iterations {
        for (task, reason) in &it.unscored {
            eprintln!("run {}: '{}' not scored: {}", it.iteration, task, reason);
        }
    }
    ExitCode::from(if report.all_succeeded() { EXIT_SUCCESS } else { EXIT_EXECUTION })
}

fn training_outcome(data: &TrainingData) -> ExitCode {
    for (worker, suggestions) in &data.suggestions {
        println!("{worker}:");
        for s in suggestions {
            println!("  - {s}");
        }
    }
    tracing::info!(crew = %data.crew, iterations = data.iterations.len(), "training finished");
    ExitCode::from(if data.all_succeeded() { EXIT_SUCCESS } else { EXIT_EXECUTION })
}

/// 配置类错误（配置文件、crew 定义、输入、快照种子）为 2，其余为 1
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let is_config = err.chain().any(|cause| {
        matches!(cause.downcast_ref::<CrewError>(), Some(CrewError::Config(_)))
            || cause.downcast_ref::<config::ConfigError>().is_some()
    });
    if is_config {
        EXIT_CONFIG
    } else {
        1
    }
}
