//! Prompt text for the operation-generating agent.

/// Instructs the agent to answer with a bare JSON operation array.
pub const SYSTEM_PROMPT: &str = r#"You are a coding assistant that generates JSON operations to modify a Vite + React + TypeScript workspace.

IMPORTANT: You must respond ONLY with valid JSON in this exact format:
[
  {"type": "create", "path": "relative/path", "content": "file content"},
  {"type": "update", "path": "relative/path", "content": "full file content"},
  {"type": "delete", "path": "relative/path"},
  {"type": "rename", "oldPath": "old/path", "newPath": "new/path"}
]

Rules:
1. All paths are relative to workspace root
2. For updates, provide the COMPLETE file content
3. Use proper React + TypeScript syntax
4. Follow modern React patterns (hooks, functional components)
5. Include proper imports and exports
6. Respond ONLY with the JSON array, no explanations or markdown"#;

/// Inputs for [`build_user_prompt`].
#[derive(Debug, Default)]
pub struct PromptParts<'a> {
    /// Session instructions, oldest first, ending with the current one.
    /// Only the tail is quoted.
    pub recent: &'a [String],
    pub recent_limit: usize,
    pub instruction: &'a str,
    /// Staged context chunks, in arrival order.
    pub context: &'a [String],
    /// Output of `Workspace::build_file_context`.
    pub file_context: &'a str,
}

pub fn build_user_prompt(parts: &PromptParts<'_>) -> String {
    let skip = parts.recent.len().saturating_sub(parts.recent_limit);
    let recent = parts.recent[skip..].join(", ");

    let mut prompt = format!(
        "Recent instructions: {recent}\n\nCurrent instruction: {}\n\n",
        parts.instruction
    );
    if !parts.context.is_empty() {
        prompt.push_str("Additional context:\n");
        prompt.push_str(&parts.context.join("\n\n"));
        prompt.push_str("\n\n");
    }
    if !parts.file_context.is_empty() {
        prompt.push_str("File context:");
        prompt.push_str(parts.file_context);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Generate JSON operations to fulfill this instruction.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_the_most_recent_instructions() {
        let recent: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let prompt = build_user_prompt(&PromptParts {
            recent: &recent,
            recent_limit: 3,
            instruction: "e",
            ..Default::default()
        });
        assert!(prompt.starts_with("Recent instructions: b, c, d\n\nCurrent instruction: e\n\n"));
        assert!(!prompt.contains("File context"));
        assert!(prompt.ends_with("Generate JSON operations to fulfill this instruction."));
    }

    #[test]
    fn context_chunks_are_blank_line_joined() {
        let context = vec!["first".to_string(), "second".to_string()];
        let prompt = build_user_prompt(&PromptParts {
            recent_limit: 3,
            instruction: "go",
            context: &context,
            file_context: "\n\n=== a.ts ===\nx",
            ..Default::default()
        });
        assert!(prompt.contains("Additional context:\nfirst\n\nsecond\n\n"));
        assert!(prompt.contains("File context:\n\n=== a.ts ===\nx\n\n"));
    }
}
