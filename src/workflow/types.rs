//! 工作流类型定义
//!
//! Worker / Task 的声明式定义、执行模型、任务与运行状态。
//! role / goal / backstory / description 都是不透明的指令文本，核心只读取结构字段。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::CrewError;

pub type TaskId = String;
pub type WorkerId = String;

/// 执行模型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessModel {
    /// 严格按声明顺序逐个执行
    #[default]
    Sequential,
    /// 就绪前沿并发分派，屏障汇合；允许委派
    Hierarchical,
}

impl fmt::Display for ProcessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessModel::Sequential => write!(f, "sequential"),
            ProcessModel::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

impl FromStr for ProcessModel {
    type Err = CrewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(ProcessModel::Sequential),
            "hierarchical" => Ok(ProcessModel::Hierarchical),
            other => Err(CrewError::config(format!("unknown process model '{other}'"))),
        }
    }
}

/// 运行状态：Idle -> Running -> {Succeeded, Failed}，终态不可再迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 等待依赖满足
    Waiting,
    /// 正在执行
    Running,
    /// 已完成（输出已通过校验并写入 ContextStore）
    Completed,
    /// 永久失败
    Failed,
    /// 运行因其他任务失败或取消而终止，未被执行
    Skipped,
}

/// Worker 定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub name: WorkerId,
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    /// 允许使用的工具名（有序）
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub allow_delegation: bool,
    /// 覆盖全局的最大推理轮数
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

impl WorkerDefinition {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            goal: String::new(),
            backstory: String::new(),
            tools: Vec::new(),
            allow_delegation: false,
            max_iterations: None,
        }
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }
}

/// 结构化输出中字段的 JSON 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => matches!(value, Value::Object(_)),
        }
    }
}

/// 结构化期望输出：JSON 对象，必需键与字段类型
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, FieldKind>,
}

/// 期望输出描述：自由文本（仅提示）或结构化 schema（强制校验）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedOutput {
    Description(String),
    Schema(OutputSchema),
}

impl Default for ExpectedOutput {
    fn default() -> Self {
        ExpectedOutput::Description(String::new())
    }
}

impl ExpectedOutput {
    /// 写入 prompt 的说明文字
    pub fn describe(&self) -> String {
        match self {
            ExpectedOutput::Description(d) => d.clone(),
            ExpectedOutput::Schema(schema) => {
                let mut out = String::new();
                if !schema.description.is_empty() {
                    out.push_str(&schema.description);
                    out.push('\n');
                }
                out.push_str("Respond with a single JSON object");
                if !schema.required.is_empty() {
                    out.push_str(&format!(" with keys: {}", schema.required.join(", ")));
                }
                out.push('.');
                for (key, kind) in &schema.properties {
                    out.push_str(&format!("\n- {key}: {kind:?}"));
                }
                out
            }
        }
    }
}

/// Task 定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: TaskId,
    pub description: String,
    #[serde(default)]
    pub expected_output: ExpectedOutput,
    /// 负责执行的 Worker 名
    pub worker: WorkerId,
    /// 依赖任务（声明顺序即上下文拼接顺序）
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// 产物相对路径（相对 artifacts 根目录）
    #[serde(default)]
    pub output_file: Option<String>,
}

impl TaskDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            expected_output: ExpectedOutput::default(),
            worker: worker.into(),
            depends_on: Vec::new(),
            output_file: None,
        }
    }

    pub fn expect(mut self, description: impl Into<String>) -> Self {
        self.expected_output = ExpectedOutput::Description(description.into());
        self
    }

    pub fn expect_schema(mut self, schema: OutputSchema) -> Self {
        self.expected_output = ExpectedOutput::Schema(schema);
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }
}
