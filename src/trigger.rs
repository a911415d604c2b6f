//! Events that start a matrix run.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum TriggerKind {
    PullRequestOpened,
    PullRequestUpdated,
    Push,
    #[default]
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::PullRequestOpened => "pull_request_opened",
            TriggerKind::PullRequestUpdated => "pull_request_updated",
            TriggerKind::Push => "push",
            TriggerKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A trigger event with the repository it refers to.
///
/// Event files are JSON:
///
/// ```json
/// { "kind": "pull_request_opened", "repository": "acme/pipeline", "ref": "refs/pull/7/head" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,

    /// Repository reference, e.g. `owner/name` or a clone URL.
    #[serde(default)]
    pub repository: String,

    /// Git ref under test, if known.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, repository: impl Into<String>, git_ref: Option<String>) -> Self {
        Self {
            kind,
            repository: repository.into(),
            git_ref,
        }
    }

    /// A manual run with no repository information.
    pub fn manual() -> Self {
        Self::new(TriggerKind::Manual, "", None)
    }

    /// Loads an event from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse event file: {}", path.display()))
    }

    /// Variables describing the trigger to the test command.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("JOBMATRIX_TRIGGER".to_string(), self.kind.to_string()),
            ("JOBMATRIX_REPOSITORY".to_string(), self.repository.clone()),
        ];
        if let Some(git_ref) = &self.git_ref {
            vars.push(("JOBMATRIX_REF".to_string(), git_ref.clone()));
        }
        vars
    }
}

impl Default for TriggerEvent {
    fn default() -> Self {
        Self::manual()
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.repository.is_empty() {
            write!(f, " on {}", self.repository)?;
        }
        if let Some(git_ref) = &self.git_ref {
            write!(f, " @ {}", git_ref)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_event_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(
            &path,
            r#"{"kind": "pull_request_updated", "repository": "acme/pipeline", "ref": "refs/pull/7/head"}"#,
        )
        .unwrap();

        let event = TriggerEvent::load(&path).unwrap();
        assert_eq!(event.kind, TriggerKind::PullRequestUpdated);
        assert_eq!(event.git_ref.as_deref(), Some("refs/pull/7/head"));
        assert_eq!(
            event.to_string(),
            "pull_request_updated on acme/pipeline @ refs/pull/7/head"
        );
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"kind": "release"}"#).unwrap();
        assert!(TriggerEvent::load(&path).is_err());
    }

    #[test]
    fn test_env_vars() {
        let event = TriggerEvent::new(TriggerKind::Push, "acme/pipeline", None);
        assert_eq!(
            event.env_vars(),
            vec![
                ("JOBMATRIX_TRIGGER".to_string(), "push".to_string()),
                ("JOBMATRIX_REPOSITORY".to_string(), "acme/pipeline".to_string()),
            ]
        );
    }
}
