//! Planner：解析 Worker 每一步的输出
//!
//! `Final Answer:` 标记后的文本为最终答案；含 `tool` 的 JSON 为工具调用；
//! 含 `delegate` 的 JSON 为委派请求；其余文本整体视为最终答案。
//! 看起来在调用工具但 JSON 不合法时返回 JsonParse，由循环作为纠正性 Observation 反馈。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CrewError;
use crate::worker::delegation::DelegationRequest;

const FINAL_ANSWER_MARKER: &str = "Final Answer:";

/// Worker 输出的工具调用（`{"tool": "read_file", "args": {"path": "..."}}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

/// 单步解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    FinalAnswer(String),
    ToolCall(ToolCall),
    Delegate(Vec<DelegationRequest>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DelegatePayload {
    Many(Vec<DelegationRequest>),
    One(DelegationRequest),
}

/// 取出 JSON 候选片段：```json 代码块优先，其次首尾大括号之间
fn json_candidate(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(s), Some(e)) if s < e => Some(&text[s..=e]),
        _ => None,
    }
}

pub fn parse_step(output: &str) -> Result<Step, CrewError> {
    let trimmed = output.trim();

    if let Some(idx) = trimmed.find(FINAL_ANSWER_MARKER) {
        let answer = trimmed[idx + FINAL_ANSWER_MARKER.len()..].trim();
        return Ok(Step::FinalAnswer(answer.to_string()));
    }

    let Some(candidate) = json_candidate(trimmed) else {
        return Ok(Step::FinalAnswer(trimmed.to_string()));
    };
    let attempts_action = candidate.contains("\"tool\"") || candidate.contains("\"delegate\"");

    let value: Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        Err(e) if attempts_action => {
            return Err(CrewError::JsonParse(format!("{}: {}", e, candidate)));
        }
        Err(_) => return Ok(Step::FinalAnswer(trimmed.to_string())),
    };

    let Value::Object(obj) = &value else {
        return Ok(Step::FinalAnswer(trimmed.to_string()));
    };

    if let Some(tool) = obj.get("tool") {
        let call: ToolCall = serde_json::from_value(value.clone())
            .map_err(|e| CrewError::JsonParse(format!("{}: {}", e, candidate)))?;
        if call.tool.trim().is_empty() || !tool.is_string() {
            return Err(CrewError::JsonParse(format!("empty tool name: {}", candidate)));
        }
        return Ok(Step::ToolCall(call));
    }

    if let Some(payload) = obj.get("delegate") {
        let requests = match serde_json::from_value::<DelegatePayload>(payload.clone()) {
            Ok(DelegatePayload::Many(v)) => v,
            Ok(DelegatePayload::One(r)) => vec![r],
            Err(e) => return Err(CrewError::JsonParse(format!("{}: {}", e, candidate))),
        };
        if requests.is_empty() {
            return Err(CrewError::JsonParse("delegate list is empty".to_string()));
        }
        return Ok(Step::Delegate(requests));
    }

    Ok(Step::FinalAnswer(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_final_answer_marker() {
        let step = parse_step("Thought: done\nFinal Answer: all good\n").unwrap();
        assert_eq!(step, Step::FinalAnswer("all good".into()));
    }

    #[test]
    fn test_tool_call_fenced() {
        let step = parse_step(
            "I need the file.\n```json\n{\"tool\": \"read_file\", \"args\": {\"path\": \"src/lib.rs\"}}\n```",
        )
        .unwrap();
        assert_eq!(
            step,
            Step::ToolCall(ToolCall {
                tool: "read_file".into(),
                args: json!({"path": "src/lib.rs"}),
            })
        );
    }

    #[test]
    fn test_tool_call_without_args() {
        match parse_step(r#"{"tool": "list_dir"}"#).unwrap() {
            Step::ToolCall(tc) => assert_eq!(tc.args, json!({})),
            other => panic!("Expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_delegate_single_and_many() {
        let one = parse_step(r#"{"delegate": {"worker": "security", "instruction": "scan"}}"#).unwrap();
        assert!(matches!(one, Step::Delegate(ref v) if v.len() == 1 && v[0].worker == "security"));

        let many = parse_step(
            r#"{"delegate": [{"worker": "a", "instruction": "x"}, {"worker": "b", "instruction": "y", "context": "z"}]}"#,
        )
        .unwrap();
        match many {
            Step::Delegate(v) => {
                assert_eq!(v.len(), 2);
                assert_eq!(v[1].context.as_deref(), Some("z"));
            }
            other => panic!("Expected delegation, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_tool_json_is_error() {
        let err = parse_step(r#"{"tool": "read_file", "args": {"path": }"#).unwrap_err();
        assert!(matches!(err, CrewError::JsonParse(_)));
    }

    #[test]
    fn test_plain_text_and_plain_json_are_answers() {
        assert_eq!(
            parse_step("Looks fine to me.").unwrap(),
            Step::FinalAnswer("Looks fine to me.".into())
        );
        let out = r#"{"summary": "ok", "score": 3}"#;
        assert_eq!(parse_step(out).unwrap(), Step::FinalAnswer(out.into()));
        assert_eq!(
            parse_step("uses {braces} loosely").unwrap(),
            Step::FinalAnswer("uses {braces} loosely".into())
        );
    }
}
