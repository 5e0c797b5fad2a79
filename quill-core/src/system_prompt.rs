//! System Prompts
//!
//! Builds the initial system prompt for a session from the agent
//! type's base prompt, a project-level override file, and any extra
//! text from the agent profile.

use std::path::Path;

use tracing::info;

use crate::types::{AgentProfile, AgentType};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Quill, a coding assistant running in a \
terminal. Help the user with software engineering tasks: read and modify code, run \
commands, and answer questions. Prefer concise answers. Use the available tools rather \
than guessing about file contents.";

const EXPLORE_PROMPT: &str = "You are a read-only exploration agent. Investigate the \
codebase using the read, glob, and grep tools and report your findings. Do not attempt \
to modify anything.";

const PLAN_PROMPT: &str = "You are a planning agent. Study the problem using read-only \
tools and produce a concrete step-by-step plan. Do not make any changes.";

const COMPACTION_PROMPT: &str = "Summarize the conversation so far into a compact form \
that preserves all decisions, open questions, and file references. Output only the \
summary.";

/// Relative path of the project-level override, from the working dir.
const PROJECT_OVERRIDE: &str = ".quill/system_prompt.md";

fn base_prompt(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::Build | AgentType::General => DEFAULT_SYSTEM_PROMPT,
        AgentType::Explore => EXPLORE_PROMPT,
        AgentType::Plan => PLAN_PROMPT,
        AgentType::Compaction => COMPACTION_PROMPT,
    }
}

/// Resolve the system prompt for a session.
///
/// Priority: project override file, else the agent-type base prompt.
/// The profile's extra prompt text is appended in both cases.
pub fn build_system_prompt(profile: &AgentProfile, working_dir: &Path) -> String {
    let override_path = working_dir.join(PROJECT_OVERRIDE);
    let mut prompt = match std::fs::read_to_string(&override_path) {
        Ok(content) if !content.trim().is_empty() => {
            info!(path = %override_path.display(), "using project system prompt");
            content.trim().to_string()
        }
        _ => base_prompt(profile.agent_type).to_string(),
    };

    if let Some(ref extra) = profile.system_prompt {
        if !extra.trim().is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(extra.trim());
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn agent_types_get_distinct_prompts() {
        let dir = PathBuf::from("/nonexistent");
        let build = build_system_prompt(&AgentProfile::for_type(AgentType::Build), &dir);
        let explore = build_system_prompt(&AgentProfile::for_type(AgentType::Explore), &dir);
        let plan = build_system_prompt(&AgentProfile::for_type(AgentType::Plan), &dir);

        assert!(build.contains("Quill"));
        assert!(explore.contains("read-only"));
        assert!(plan.contains("plan"));
    }

    #[test]
    fn profile_extra_text_appended() {
        let mut profile = AgentProfile::for_type(AgentType::Build);
        profile.system_prompt = Some("Always answer in French.".into());
        let prompt = build_system_prompt(&profile, &PathBuf::from("/nonexistent"));
        assert!(prompt.ends_with("Always answer in French."));
    }

    #[test]
    fn project_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".quill")).unwrap();
        std::fs::write(
            dir.path().join(".quill/system_prompt.md"),
            "Project-specific instructions.",
        )
        .unwrap();

        let prompt =
            build_system_prompt(&AgentProfile::for_type(AgentType::Build), dir.path());
        assert_eq!(prompt, "Project-specific instructions.");
    }
}
