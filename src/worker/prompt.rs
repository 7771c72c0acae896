//! Worker 提示词拼装
//!
//! system：角色、背景、目标、可用工具与调用格式、可委派的协作者；
//! user：以 `Current Task:` 开头，附期望输出、上游上下文与可选的纠正反馈。

use crate::tools::{delegation_schema_json, tool_call_schema_json};
use crate::worker::delegation::Coworker;
use crate::workflow::types::{TaskDefinition, WorkerDefinition};

pub fn system_prompt(
    worker: &WorkerDefinition,
    tools: &[(String, String)],
    coworkers: &[Coworker],
) -> String {
    let mut out = format!("You are {}.", worker.role.trim());
    if !worker.backstory.trim().is_empty() {
        out.push_str(&format!("\n{}", worker.backstory.trim()));
    }
    if !worker.goal.trim().is_empty() {
        out.push_str(&format!("\n\nYour personal goal is: {}", worker.goal.trim()));
    }

    if tools.is_empty() {
        out.push_str("\n\nYou have no tools. Answer from your own knowledge and the provided context.");
    } else {
        out.push_str("\n\nYou can use these tools:");
        for (name, desc) in tools {
            out.push_str(&format!("\n- {name}: {desc}"));
        }
        out.push_str(
            "\n\nTo use a tool, reply with ONLY a JSON object matching this schema and wait for the Observation:\n",
        );
        out.push_str(&tool_call_schema_json());
    }

    if !coworkers.is_empty() {
        out.push_str("\n\nYou can delegate sub-tasks to these coworkers:");
        for c in coworkers {
            out.push_str(&format!("\n- {}: {}", c.name, c.role.trim()));
        }
        out.push_str(
            "\n\nTo delegate, reply with ONLY a JSON object matching this schema. All delegated work runs in parallel and you receive every result (including failures) as one Observation:\n",
        );
        out.push_str(&delegation_schema_json());
    }

    out.push_str(
        "\n\nWhen you have the complete result, reply with:\nFinal Answer: <your complete answer>",
    );
    out
}

pub fn task_prompt(task: &TaskDefinition, context: &str, feedback: Option<&str>) -> String {
    let mut out = format!("Current Task: {}", task.description.trim());
    let expected = task.expected_output.describe();
    if !expected.trim().is_empty() {
        out.push_str(&format!(
            "\n\nThis is the expected criteria for your final answer: {}",
            expected.trim()
        ));
    }
    if !context.trim().is_empty() {
        out.push_str(&format!(
            "\n\nThis is the context you're working with:\n{}",
            context.trim_end()
        ));
    }
    if let Some(fb) = feedback {
        out.push_str(&format!("\n\n{}", fb.trim()));
    }
    out.push_str("\n\nBegin!");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_sections() {
        let worker = WorkerDefinition::new("reviewer", "Senior Code Reviewer")
            .goal("Find defects")
            .backstory("Ten years of Rust.");
        let tools = vec![("read_file".to_string(), "Read file contents".to_string())];
        let coworkers = vec![Coworker {
            name: "security".into(),
            role: "Security Analyst".into(),
        }];

        let prompt = system_prompt(&worker, &tools, &coworkers);
        assert!(prompt.starts_with("You are Senior Code Reviewer."));
        assert!(prompt.contains("Your personal goal is: Find defects"));
        assert!(prompt.contains("- read_file: Read file contents"));
        assert!(prompt.contains("- security: Security Analyst"));
        assert!(prompt.contains("Final Answer:"));

        let bare = system_prompt(&worker, &[], &[]);
        assert!(bare.contains("You have no tools"));
        assert!(!bare.contains("delegate"));
    }

    #[test]
    fn test_task_prompt_starts_with_current_task() {
        let task = TaskDefinition::new("review", "Review the diff", "reviewer").expect("A list of issues");
        let prompt = task_prompt(&task, "## Output of plan\nsteps", Some("Fix the format."));
        assert!(prompt.starts_with("Current Task: Review the diff\n"));
        assert!(prompt.contains("expected criteria for your final answer: A list of issues"));
        assert!(prompt.contains("## Output of plan\nsteps"));
        assert!(prompt.contains("Fix the format."));
        assert!(prompt.ends_with("Begin!"));
    }
}
