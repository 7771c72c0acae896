//! Crew 构建器
//!
//! 提供流畅的 API（或从 TOML 的 CrewSpec）声明 Worker 与 Task，
//! 在校验之前对指令文本做一次 `{name}` 模板替换，然后解析引用、校验工具与产物目标，最终构建 TaskGraph。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::CrewError;
use crate::llm::LlmClient;
use crate::tools::ToolInvoker;
use crate::worker::{Worker, WorkerSet, WorkerSettings};
use crate::workflow::engine::{EngineSettings, ExecutionEngine};
use crate::workflow::graph::TaskGraph;
use crate::workflow::training::TrainingData;
use crate::workflow::types::{ExpectedOutput, ProcessModel, TaskDefinition, WorkerDefinition, WorkerId};

const PLACEHOLDER: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// crew 定义文件（TOML）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrewSpec {
    #[serde(default)]
    pub name: String,
    /// 缺省时沿用 [engine] process
    #[serde(default)]
    pub process: Option<ProcessModel>,
    /// 缺省时沿用 [engine] manager
    #[serde(default)]
    pub manager: Option<WorkerId>,
    /// 默认运行输入，可被命令行覆盖
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl CrewSpec {
    pub fn from_toml_str(text: &str) -> Result<Self, CrewError> {
        toml::from_str(text).map_err(|e| CrewError::config(format!("invalid crew definition: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CrewError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CrewError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn into_builder(self) -> CrewBuilder {
        let mut builder = CrewBuilder::new(self.name).inputs(self.inputs);
        if let Some(p) = self.process {
            builder = builder.process(p);
        }
        if let Some(m) = self.manager {
            builder = builder.manager(m);
        }
        for w in self.workers {
            builder = builder.worker(w);
        }
        for t in self.tasks {
            builder = builder.task(t);
        }
        builder
    }
}

/// 将 `{name}` 替换为 inputs 中的值；出现没有对应输入的占位符时返回 ConfigError
pub fn interpolate(text: &str, inputs: &BTreeMap<String, String>) -> Result<String, CrewError> {
    let re = Regex::new(PLACEHOLDER).map_err(|e| CrewError::config(e.to_string()))?;
    if let Some(missing) = re
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|name| !inputs.contains_key(*name))
    {
        return Err(CrewError::config(format!("no input provided for placeholder '{{{missing}}}'")));
    }
    Ok(re
        .replace_all(text, |caps: &regex::Captures| {
            inputs.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// manager 必须是已声明且允许委派的 Worker
fn check_manager(workers: &WorkerSet, manager: &str) -> Result<(), CrewError> {
    let worker = workers
        .get(manager)
        .ok_or_else(|| CrewError::config(format!("manager '{manager}' is not a declared worker")))?;
    if !worker.can_delegate() {
        return Err(CrewError::config(format!(
            "manager '{manager}' must have allow_delegation = true"
        )));
    }
    Ok(())
}

fn with_suggestions(backstory: &str, lessons: &[String]) -> String {
    let mut out = backstory.trim_end().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("Suggestions from previous runs:");
    for l in lessons {
        out.push_str(&format!("\n- {}", l.trim()));
    }
    out
}

/// 构建完成、可执行的 crew
pub struct Crew {
    pub name: String,
    /// None 表示沿用引擎配置
    pub process: Option<ProcessModel>,
    pub manager: Option<WorkerId>,
    pub workers: WorkerSet,
    pub graph: TaskGraph,
}

impl Crew {
    /// crew 声明了执行模型或 manager 时覆盖 settings 中的对应项，再校验最终生效的 manager
    pub fn into_engine(
        self,
        invoker: ToolInvoker,
        mut settings: EngineSettings,
    ) -> Result<(ExecutionEngine, TaskGraph), CrewError> {
        if let Some(process) = self.process {
            settings.process = process;
        }
        if self.manager.is_some() {
            settings.manager = self.manager;
        }
        if let Some(manager) = &settings.manager {
            check_manager(&self.workers, manager)?;
        }
        tracing::debug!(
            crew = %self.name,
            process = %settings.process,
            manager = ?settings.manager,
            "engine settings resolved"
        );
        Ok((ExecutionEngine::new(self.workers, invoker, settings), self.graph))
    }
}

/// Crew 构建器
pub struct CrewBuilder {
    name: String,
    process: Option<ProcessModel>,
    manager: Option<WorkerId>,
    inputs: BTreeMap<String, String>,
    workers: Vec<WorkerDefinition>,
    tasks: Vec<TaskDefinition>,
    llm_overrides: HashMap<WorkerId, Arc<dyn LlmClient>>,
    worker_settings: WorkerSettings,
    /// 训练得到的建议，构建时附加到 Worker 背景描述
    suggestions: BTreeMap<WorkerId, Vec<String>>,
}

impl CrewBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            process: None,
            manager: None,
            inputs: BTreeMap::new(),
            workers: Vec::new(),
            tasks: Vec::new(),
            llm_overrides: HashMap::new(),
            worker_settings: WorkerSettings::default(),
            suggestions: BTreeMap::new(),
        }
    }

    pub fn worker(mut self, def: WorkerDefinition) -> Self {
        self.workers.push(def);
        self
    }

    pub fn task(mut self, def: TaskDefinition) -> Self {
        self.tasks.push(def);
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// 合并输入，同名覆盖已有值
    pub fn inputs(mut self, inputs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn process(mut self, process: ProcessModel) -> Self {
        self.process = Some(process);
        self
    }

    pub fn manager(mut self, worker: impl Into<String>) -> Self {
        self.manager = Some(worker.into());
        self
    }

    /// 为某个 Worker 指定独立的补全客户端
    pub fn llm_for(mut self, worker: impl Into<String>, llm: Arc<dyn LlmClient>) -> Self {
        self.llm_overrides.insert(worker.into(), llm);
        self
    }

    pub fn worker_settings(mut self, settings: WorkerSettings) -> Self {
        self.worker_settings = settings;
        self
    }

    /// 使用训练数据中的建议
    pub fn training(mut self, data: &TrainingData) -> Self {
        self.suggestions = data.suggestions.clone();
        self
    }

    pub fn build(self, default_llm: Arc<dyn LlmClient>, invoker: &ToolInvoker) -> Result<Crew, CrewError> {
        let inputs = &self.inputs;

        let mut worker_defs = Vec::with_capacity(self.workers.len());
        for mut w in self.workers {
            if w.name.trim().is_empty() {
                return Err(CrewError::config("worker with an empty name"));
            }
            w.role = interpolate(&w.role, inputs)?;
            w.goal = interpolate(&w.goal, inputs)?;
            w.backstory = interpolate(&w.backstory, inputs)?;
            if let Some(lessons) = self.suggestions.get(&w.name).filter(|l| !l.is_empty()) {
                w.backstory = with_suggestions(&w.backstory, lessons);
            }
            invoker.ensure_registered(&w.name, &w.tools)?;
            worker_defs.push(w);
        }

        let mut task_defs = Vec::with_capacity(self.tasks.len());
        for mut t in self.tasks {
            t.description = interpolate(&t.description, inputs)?;
            t.expected_output = match t.expected_output {
                ExpectedOutput::Description(d) => ExpectedOutput::Description(interpolate(&d, inputs)?),
                ExpectedOutput::Schema(mut s) => {
                    s.description = interpolate(&s.description, inputs)?;
                    ExpectedOutput::Schema(s)
                }
            };
            if let Some(dest) = t.output_file.take() {
                t.output_file = Some(interpolate(&dest, inputs)?);
            }
            task_defs.push(t);
        }

        for name in self.suggestions.keys() {
            if !worker_defs.iter().any(|w| &w.name == name) {
                tracing::warn!(worker = %name, "training suggestions for unknown worker ignored");
            }
        }

        let mut workers = WorkerSet::new();
        let mut overrides = self.llm_overrides;
        for def in worker_defs {
            let name = def.name.clone();
            let llm = overrides.remove(&name).unwrap_or_else(|| default_llm.clone());
            if !workers.insert(Worker::new(def, llm, self.worker_settings.clone())) {
                return Err(CrewError::config(format!("duplicate worker '{name}'")));
            }
        }
        if let Some(unused) = overrides.keys().next() {
            return Err(CrewError::config(format!("completion client given for unknown worker '{unused}'")));
        }

        for t in &task_defs {
            if !workers.contains(&t.worker) {
                return Err(CrewError::config(format!(
                    "task '{}' references unknown worker '{}'",
                    t.name, t.worker
                )));
            }
        }

        if let Some(manager) = &self.manager {
            check_manager(&workers, manager)?;
        }

        let mut destinations = HashSet::new();
        for t in &task_defs {
            if let Some(dest) = &t.output_file {
                if !destinations.insert(dest.trim_start_matches("./").to_string()) {
                    return Err(CrewError::config(format!(
                        "output file '{dest}' is declared by more than one task"
                    )));
                }
            }
        }

        let graph = TaskGraph::build(task_defs)?;
        tracing::info!(
            crew = %self.name,
            workers = workers.len(),
            tasks = graph.len(),
            process = ?self.process,
            "crew built"
        );
        Ok(Crew {
            name: self.name,
            process: self.process,
            manager: self.manager,
            workers,
            graph,
        })
    }
}
