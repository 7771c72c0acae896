//! Worker 步骤 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」与「委派请求」的 JSON 结构注入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用格式：与 planner 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是 Worker 被授权的工具之一
    pub tool: String,
    /// 工具参数，依工具不同而不同（path、command、url、text 等）
    pub args: Value,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct DelegationEntry {
    /// 协作者名称
    pub worker: String,
    /// 交给协作者的子任务说明
    pub instruction: String,
    /// 可选的补充上下文
    pub context: Option<String>,
}

/// 委派格式：`{"delegate": [{"worker": "...", "instruction": "..."}]}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct DelegationFormat {
    pub delegate: Vec<DelegationEntry>,
}

/// 工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 委派请求的 JSON Schema 字符串
pub fn delegation_schema_json() -> String {
    let schema = schema_for!(DelegationFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
