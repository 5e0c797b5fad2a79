//! Builtin Tools
//!
//! The local toolset: file access (read, write, edit), search (glob,
//! grep), shell (bash), user interaction (question), and child-agent
//! delegation (task).

mod bash;
mod edit;
mod glob;
mod grep;
mod question;
mod read;
mod task;
mod write;

pub use bash::BashTool;
pub use edit::EditTool;
pub use glob::{expand_braces, glob_match, GlobTool};
pub use grep::GrepTool;
pub use question::QuestionTool;
pub use read::ReadTool;
pub use task::TaskTool;
pub use write::WriteTool;

use std::sync::Arc;

use crate::tool::ToolRegistry;

/// Register every builtin tool.
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register(Arc::new(ReadTool));
    registry.register(Arc::new(WriteTool));
    registry.register(Arc::new(EditTool));
    registry.register(Arc::new(GlobTool));
    registry.register(Arc::new(GrepTool));
    registry.register(Arc::new(BashTool));
    registry.register(Arc::new(QuestionTool));
    registry.register(Arc::new(TaskTool));
}

/// A fresh registry holding the builtin toolset.
pub fn builtin_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    register_builtins(&registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_registered() {
        let registry = builtin_registry();
        for id in ["read", "write", "edit", "glob", "grep", "bash", "question", "task"] {
            assert!(registry.get(id).is_some(), "missing builtin: {id}");
        }
        assert_eq!(registry.len(), 8);
    }
}
