//! 工具调用器
//!
//! 持有只读的 ToolRegistry 与默认超时，invoke(tool_name, args) 在超时内调用工具，
//! 超时或失败时转为 CrewError::ToolExecution；不做任何重试（重试属于 Worker 循环）。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::{CrewError, ToolErrorKind};
use crate::tools::{Tool, ToolRegistry};

/// 工具调用器：可廉价克隆，供并行子任务共享
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// 使用默认超时执行
    pub async fn invoke(&self, tool_name: &str, args: serde_json::Value) -> Result<String, CrewError> {
        self.invoke_with_timeout(tool_name, args, self.timeout).await
    }

    /// 使用调用方给定的超时执行；超时返回 ToolErrorKind::Timeout，工具返回 Err 则为 Failed
    pub async fn invoke_with_timeout(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        limit: Duration,
    ) -> Result<String, CrewError> {
        let tool = self.registry.get(tool_name).ok_or_else(|| CrewError::ToolExecution {
            tool: tool_name.to_string(),
            kind: ToolErrorKind::Unknown,
        })?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(limit, tool.execute(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(CrewError::ToolExecution {
                tool: tool_name.to_string(),
                kind: ToolErrorKind::Failed(e),
            }),
            Err(_) => Err(CrewError::ToolExecution {
                tool: tool_name.to_string(),
                kind: ToolErrorKind::Timeout(limit),
            }),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 启动期校验：所有名称都必须已注册，否则为配置错误
    pub fn ensure_registered(&self, owner: &str, names: &[String]) -> Result<(), CrewError> {
        match names.iter().find(|n| !self.registry.contains(n)) {
            Some(missing) => Err(CrewError::config(format!(
                "worker '{owner}' references unknown tool '{missing}' (registered: {})",
                self.registry.tool_names().join(", ")
            ))),
            None => Ok(()),
        }
    }

    /// 返回指定工具的 (name, 描述 + 参数 schema)，保持传入顺序；未注册的名称被忽略
    pub fn describe(&self, names: &[String]) -> Vec<(String, String)> {
        names
            .iter()
            .filter_map(|n| {
                self.registry.get(n).map(|t| {
                    let params = t.parameters_schema();
                    (n.clone(), format!("{} Parameters: {}", t.description(), params))
                })
            })
            .collect()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
