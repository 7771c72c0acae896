//! 输出校验
//!
//! 空输出一律失败；声明了 schema 时做结构校验（JSON 对象、必需键、字段类型），
//! 自由文本描述仅作为提示，不据此判定失败。

use serde_json::{Map, Value};

use crate::workflow::types::{ExpectedOutput, OutputSchema};

/// 校验候选输出，失败时返回原因（会原样反馈给 Worker）
pub fn validate_output(expected: &ExpectedOutput, output: &str) -> Result<(), String> {
    if output.trim().is_empty() {
        return Err("the final answer is empty".to_string());
    }
    match expected {
        ExpectedOutput::Description(_) => Ok(()),
        ExpectedOutput::Schema(schema) => validate_schema(schema, output),
    }
}

fn validate_schema(schema: &OutputSchema, output: &str) -> Result<(), String> {
    let obj = extract_json_object(output)
        .ok_or_else(|| "expected a single JSON object in the final answer".to_string())?;

    let missing: Vec<&str> = schema
        .required
        .iter()
        .filter(|k| !obj.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required keys: {}", missing.join(", ")));
    }

    for (key, kind) in &schema.properties {
        if let Some(value) = obj.get(key) {
            if !kind.matches(value) {
                return Err(format!(
                    "key '{}' should be {:?} but was {}",
                    key,
                    kind,
                    type_name(value)
                ));
            }
        }
    }
    Ok(())
}

/// 从输出中取出 JSON 对象：整体、```json 代码块或首尾大括号之间
pub fn extract_json_object(output: &str) -> Option<Map<String, Value>> {
    let trimmed = output.trim();
    let candidates = [
        Some(trimmed),
        trimmed.find("```json").map(|start| {
            let rest = &trimmed[start + 7..];
            rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
        }),
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(s), Some(e)) if s < e => Some(&trimmed[s..=e]),
            _ => None,
        },
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|c| match serde_json::from_str::<Value>(c) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::FieldKind;

    fn schema() -> ExpectedOutput {
        let mut s = OutputSchema {
            required: vec!["summary".into(), "score".into()],
            ..Default::default()
        };
        s.properties.insert("score".into(), FieldKind::Integer);
        ExpectedOutput::Schema(s)
    }

    #[test]
    fn test_description_is_advisory() {
        let expected = ExpectedOutput::Description("A markdown table".into());
        assert!(validate_output(&expected, "plain prose").is_ok());
        assert!(validate_output(&expected, "   \n").is_err());
    }

    #[test]
    fn test_schema_pass_with_fence() {
        let out = "Here you go:\n```json\n{\"summary\": \"ok\", \"score\": 7}\n```";
        assert!(validate_output(&schema(), out).is_ok());
    }

    #[test]
    fn test_schema_failures() {
        assert!(validate_output(&schema(), "no json here")
            .unwrap_err()
            .contains("JSON object"));
        assert!(validate_output(&schema(), r#"{"summary": "x"}"#)
            .unwrap_err()
            .contains("score"));
        assert!(validate_output(&schema(), r#"{"summary": "x", "score": "high"}"#)
            .unwrap_err()
            .contains("Integer"));
    }
}
