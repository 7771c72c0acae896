//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CREW__*` 覆盖（双下划线表示嵌套，如 `CREW__ENGINE__MAX_RETRIES=5`）。
//! 缺少的段与键一律取与 config/default.toml 相同的默认值。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::BackoffPolicy;
use crate::worker::WorkerSettings;
use crate::workflow::{EngineSettings, ProcessModel};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub worker: WorkerSection,
    pub tools: ToolsSection,
    pub artifacts: ArtifactsSection,
    pub evaluation: EvaluationSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具沙箱与产物的默认根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 120 }
    }
}

/// [engine] 段：执行模型、重试与退避、并发与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// crew 文件未指定时使用的执行模型
    pub process: ProcessModel,
    /// crew 文件未指定 manager 时使用
    pub manager: Option<String>,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub max_fanout: usize,
    /// 0 表示不限
    pub task_timeout_secs: u64,
    pub delegation_timeout_secs: u64,
    pub max_delegations: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            process: ProcessModel::Sequential,
            manager: None,
            max_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
            backoff_multiplier: 2.0,
            max_fanout: 4,
            task_timeout_secs: 0,
            delegation_timeout_secs: 300,
            max_delegations: 5,
        }
    }
}

/// [worker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub max_iterations: usize,
    /// 缺省时沿用 [llm.timeouts] request
    pub completion_timeout_secs: Option<u64>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            completion_timeout_secs: None,
        }
    }
}

/// [tools] 段：文件系统根、工具超时、Shell 白名单、Fetch 域名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub filesystem_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub shell: ShellSection,
    pub fetch: FetchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            filesystem_root: None,
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
            fetch: FetchSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "grep", "cat", "head", "tail", "wc", "find", "git", "cargo"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// [tools.fetch] 段：请求超时、最大字符数、允许的域名（含子域）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_result_chars: 8000,
            allowed_domains: [
                "docs.rs",
                "crates.io",
                "doc.rust-lang.org",
                "github.com",
                "raw.githubusercontent.com",
                "stackoverflow.com",
                "developer.mozilla.org",
                "owasp.org",
                "cwe.mitre.org",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// [artifacts] 段：产物根目录与默认快照路径
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub root: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
}

/// [evaluation] 段：`crew test` / `crew train` 使用的评估模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    /// 评估模型，缺省与 [llm] model 相同
    pub model: Option<String>,
    /// 单次评估调用超时（秒）
    pub timeout_secs: u64,
    /// 训练数据中每个 Worker 保留的建议条数
    pub max_suggestions: usize,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            model: None,
            timeout_secs: 60,
            max_suggestions: 5,
        }
    }
}

impl AppConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }

    pub fn filesystem_root(&self) -> PathBuf {
        self.tools
            .filesystem_root
            .clone()
            .unwrap_or_else(|| self.workspace_root())
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.artifacts
            .root
            .clone()
            .unwrap_or_else(|| self.workspace_root())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.tool_timeout_secs.max(1))
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let secs = self
            .worker
            .completion_timeout_secs
            .unwrap_or(self.llm.timeouts.request)
            .max(1);
        WorkerSettings {
            max_iterations: self.worker.max_iterations.max(1),
            completion_timeout: Duration::from_secs(secs),
        }
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation.timeout_secs.max(1))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let e = &self.engine;
        EngineSettings {
            process: e.process,
            manager: e.manager.clone(),
            max_retries: e.max_retries,
            backoff: BackoffPolicy::new(
                Duration::from_millis(e.backoff_initial_ms),
                Duration::from_millis(e.backoff_max_ms),
                e.backoff_multiplier,
            ),
            max_fanout: e.max_fanout.max(1),
            task_timeout: (e.task_timeout_secs > 0).then(|| Duration::from_secs(e.task_timeout_secs)),
            delegation_timeout: Duration::from_secs(e.delegation_timeout_secs.max(1)),
            max_delegations: e.max_delegations.max(1),
            tool_timeout: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 CREW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 CREW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    if let Some(name) = default_names
        .into_iter()
        .find(|name| std::path::Path::new(&format!("{}.toml", name)).exists())
    {
        builder = builder.add_source(config::File::with_name(name).required(false));
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CREW")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
