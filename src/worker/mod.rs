//! Worker：角色、许可工具与补全服务绑定在一起的执行单元
//!
//! 运行开始后不可变；推理循环见 loop_.rs。

pub mod delegation;
pub mod loop_;
pub mod planner;
pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::LlmClient;
use crate::workflow::types::WorkerDefinition;

pub use delegation::{Aggregation, Coworker, DelegationHandler, DelegationRequest, SubTaskOutcome};
pub use loop_::WorkerSession;
pub use planner::{parse_step, Step, ToolCall};

/// Worker 运行参数（来自 [worker] 配置）
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// 单个任务内最多推理轮数
    pub max_iterations: usize,
    /// 单次补全调用超时
    pub completion_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            completion_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Worker {
    definition: WorkerDefinition,
    llm: Arc<dyn LlmClient>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(definition: WorkerDefinition, llm: Arc<dyn LlmClient>, settings: WorkerSettings) -> Self {
        Self {
            definition,
            llm,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkerDefinition {
        &self.definition
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// 定义中的覆盖值优先，至少为 1
    pub fn max_iterations(&self) -> usize {
        self.definition
            .max_iterations
            .unwrap_or(self.settings.max_iterations)
            .max(1)
    }

    pub fn permits_tool(&self, tool: &str) -> bool {
        self.definition.tools.iter().any(|t| t == tool)
    }

    pub fn can_delegate(&self) -> bool {
        self.definition.allow_delegation
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.definition.name)
            .field("tools", &self.definition.tools)
            .field("allow_delegation", &self.definition.allow_delegation)
            .finish()
    }
}

/// 一次运行中的全部 Worker，按声明顺序
#[derive(Debug, Clone, Default)]
pub struct WorkerSet {
    workers: Vec<Arc<Worker>>,
    index: HashMap<String, usize>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名时返回 false 且不插入
    pub fn insert(&mut self, worker: Worker) -> bool {
        if self.index.contains_key(worker.name()) {
            return false;
        }
        self.index.insert(worker.name().to_string(), self.workers.len());
        self.workers.push(Arc::new(worker));
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Worker>> {
        self.index.get(name).map(|&i| self.workers[i].clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.iter()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// 除 name 自身以外的所有 Worker
    pub fn coworkers_of(&self, name: &str) -> Vec<Coworker> {
        self.workers
            .iter()
            .filter(|w| w.name() != name)
            .map(|w| Coworker {
                name: w.name().to_string(),
                role: w.definition().role.clone(),
            })
            .collect()
    }
}
