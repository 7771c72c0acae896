//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、git）；禁止 rm -rf、wget、chmod 777 等子串；
//! 工作目录固定为工作区根目录，执行通过 sh -c / cmd /C。
//! 超时由 ToolInvoker 统一控制，这里只负责进程本身。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::Tool;

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 输出超过此长度时截断
const MAX_OUTPUT_CHARS: usize = 16_000;

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: BTreeSet<String>,
    workdir: PathBuf,
    description: String,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, workdir: impl AsRef<Path>) -> Self {
        let allowed_commands: BTreeSet<String> = allowed_commands
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let description = format!(
            "Run a whitelisted shell command in the workspace. Allowed commands: {}. Args: {{\"command\": \"...\"}}",
            allowed_commands.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        Self {
            allowed_commands,
            workdir: workdir.as_ref().to_path_buf(),
            description,
        }
    }

    /// 只取第一个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {}", forbidden));
        }
        let name = Self::command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{}' not in allowlist", name))
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        // 调用方超时后 future 被 drop，子进程随之终止
        cmd.current_dir(&self.workdir).kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr.trim()));
        }
        let combined = if stderr.trim().is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        };
        if combined.chars().count() > MAX_OUTPUT_CHARS {
            Ok(combined.chars().take(MAX_OUTPUT_CHARS).collect::<String>() + "\n...[truncated]")
        } else {
            Ok(combined)
        }
    }
}
