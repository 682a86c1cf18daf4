//! Change summaries and the confirmation collaborator.

use std::fmt::Write as _;

use anyhow::Context;

use crate::models::Change;

/// A tracked root and the changes found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootChanges {
    pub root: String,
    pub changes: Vec<Change>,
}

impl RootChanges {
    pub fn new(root: impl Into<String>, changes: Vec<Change>) -> Self {
        Self {
            root: root.into(),
            changes,
        }
    }
}

/// Render the summary shown before confirmation: one block per root with a
/// header and change count, one `Operation  path` row per change.
pub fn render_summary(roots: &[RootChanges]) -> String {
    let mut out = String::new();
    for group in roots.iter().filter(|g| !g.changes.is_empty()) {
        let _ = writeln!(out, "Changes in {} ({}):", group.root, group.changes.len());
        for change in &group.changes {
            let _ = writeln!(out, "  {:<7} {}", change.kind.operation(), change.path);
        }
    }
    if out.is_empty() {
        out.push_str("No changes.\n");
    }
    out
}

/// Asks the user to approve a destructive step.
pub trait Confirm: Send + Sync {
    fn confirm(&self, message: &str) -> anyhow::Result<bool>;
}

/// Interactive terminal prompt.
pub struct DialoguerConfirm;

impl Confirm for DialoguerConfirm {
    fn confirm(&self, message: &str) -> anyhow::Result<bool> {
        dialoguer::Confirm::new()
            .with_prompt(message)
            .default(false)
            .interact()
            .context("Failed to get user input")
    }
}

/// Fixed answer, for non-interactive runs and tests.
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, message: &str) -> anyhow::Result<bool> {
        tracing::debug!(message, answer = self.0, "auto-confirm");
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_root_with_counts() {
        let summary = render_summary(&[
            RootChanges::new(
                "prompts",
                vec![
                    Change::modified("a/prompt.md"),
                    Change::added("b/metadata.yml"),
                    Change::deleted("c"),
                ],
            ),
            RootChanges::new("fragments", vec![]),
        ]);
        assert_eq!(
            summary,
            "Changes in prompts (3):\n  Modify  a/prompt.md\n  Add     b/metadata.yml\n  Delete  c\n"
        );
    }

    #[test]
    fn empty_summary() {
        assert_eq!(render_summary(&[]), "No changes.\n");
    }

    #[test]
    fn auto_confirm_returns_fixed_answer() {
        assert!(AutoConfirm(true).confirm("go?").unwrap());
        assert!(!AutoConfirm(false).confirm("go?").unwrap());
    }
}
