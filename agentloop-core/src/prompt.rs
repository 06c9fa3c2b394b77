//! Prompt construction for the Code Agent and the Reviewer Agent.

/// System prompt for the Code Agent.
pub fn code_agent_system_prompt() -> String {
    include_str!("../prompts/code_agent.txt").to_string()
}

/// System prompt for the Reviewer Agent.
pub fn reviewer_system_prompt() -> String {
    include_str!("../prompts/reviewer.txt").to_string()
}

/// A tool as advertised to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolDescription {
    pub name: &'static str,
    pub usage: &'static str,
}

fn push_tool_list(prompt: &mut String, tools: &[ToolDescription]) {
    prompt.push_str("\nAvailable tools:\n");
    for tool in tools {
        prompt.push_str(&format!("- {} {}\n", tool.name, tool.usage));
    }
}

/// User prompt for a Code Agent run.
///
/// `review_feedback` is set for fix iterations and carries the Reviewer's
/// comment on the previous attempt.
pub fn create_code_agent_prompt(
    issue_title: &str,
    issue_body: &str,
    review_feedback: Option<&str>,
    tools: &[ToolDescription],
) -> String {
    let mut prompt = format!("Task: {}\n\n{}\n", issue_title, issue_body);

    if let Some(feedback) = review_feedback {
        prompt.push_str("\nA reviewer requested changes to the current branch:\n");
        prompt.push_str(feedback);
        prompt.push('\n');
        prompt.push_str("Address every finding. The branch already contains the earlier attempt.\n");
    }

    push_tool_list(&mut prompt, tools);
    prompt
}

/// User prompt for a Reviewer Agent run.
pub fn create_reviewer_prompt(
    pr_label: &str,
    head_sha: &str,
    issue_title: &str,
    issue_body: &str,
    ci_summary: &str,
    tools: &[ToolDescription],
) -> String {
    let mut prompt = format!(
        "PR: {}\nHead SHA: {}\n\nIssue title: {}\n\nIssue body:\n{}\n\nCI for the head commit:\n{}\n",
        pr_label, head_sha, issue_title, issue_body, ci_summary
    );
    push_tool_list(&mut prompt, tools);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOLS: &[ToolDescription] = &[ToolDescription {
        name: "read_file",
        usage: "{path, start?, end?} - read a file range",
    }];

    #[test]
    fn test_system_prompts_describe_protocol() {
        assert!(code_agent_system_prompt().contains("\"type\":\"final\""));
        assert!(reviewer_system_prompt().contains("\"decision\":\"ok|fix\""));
    }

    #[test]
    fn test_code_prompt_without_feedback() {
        let prompt = create_code_agent_prompt("Add greeting", "Print hello", None, TOOLS);
        assert!(prompt.starts_with("Task: Add greeting"));
        assert!(!prompt.contains("reviewer requested"));
        assert!(prompt.contains("- read_file {path, start?, end?}"));
    }

    #[test]
    fn test_code_prompt_with_feedback() {
        let prompt =
            create_code_agent_prompt("Add greeting", "Print hello", Some("missing test"), TOOLS);
        assert!(prompt.contains("A reviewer requested changes"));
        assert!(prompt.contains("missing test"));
    }

    #[test]
    fn test_reviewer_prompt_includes_ci_summary() {
        let prompt = create_reviewer_prompt(
            "octo/widgets#7",
            "abc123",
            "Add greeting",
            "Print hello",
            "build: success",
            TOOLS,
        );
        assert!(prompt.contains("PR: octo/widgets#7"));
        assert!(prompt.contains("build: success"));
    }
}
