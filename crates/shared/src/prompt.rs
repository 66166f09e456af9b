use std::fmt::Write as _;

use serde_json::Value;

use crate::institutions::Institution;
use crate::models::PersonalInfo;
use crate::retrieval::RetrievedContext;

pub const NO_PERSONAL_INFO: &str = "No personal information provided.";
pub const NO_RETRIEVED_CONTENT: &str = "No relevant content found in knowledge base.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Pure: identical inputs always produce byte-identical prompts.
pub fn build_prompt(
    query: &str,
    memory_context: &str,
    personal_info: Option<&PersonalInfo>,
    context: &RetrievedContext,
    institution: &Institution,
) -> AssembledPrompt {
    let mut user_prompt = String::new();

    user_prompt.push_str("Student profile:\n");
    match personal_info.filter(|info| !info.is_empty()) {
        Some(info) => {
            for (key, value) in info {
                let _ = writeln!(user_prompt, "- {key}: {}", render_value(value));
            }
        }
        None => {
            user_prompt.push_str(NO_PERSONAL_INFO);
            user_prompt.push('\n');
        }
    }
    user_prompt.push('\n');

    let memory_context = memory_context.trim_end();
    if !memory_context.is_empty() {
        user_prompt.push_str(memory_context);
        user_prompt.push_str("\n\n");
    }

    user_prompt.push_str("Retrieved information:\n");
    if context.passages.is_empty() {
        user_prompt.push_str(NO_RETRIEVED_CONTENT);
        user_prompt.push('\n');
    } else {
        for (index, passage) in context.passages.iter().enumerate() {
            let _ = writeln!(user_prompt, "SOURCE {}:\n{passage}", index + 1);
        }
    }
    user_prompt.push('\n');

    let _ = write!(user_prompt, "Please answer: \"{query}\"");

    AssembledPrompt {
        system_prompt: institution.system_prompt(),
        user_prompt,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
