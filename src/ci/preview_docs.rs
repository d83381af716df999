//! Preview documentation cleanup.
//!
//! Each pull request publishes its docs under the version `pr-<number>`.
//! When the pull request closes, that version is deleted and the deletion
//! pushed to the docs branch.

use crate::models::{PipelineError, Result};
use tokio::process::Command;
use tracing::info;

/// Documentation version name for a pull request.
pub fn preview_version(pr_number: u64) -> String {
    format!("pr-{pr_number}")
}

/// Wrapper around the documentation versioning tool.
#[derive(Debug, Clone)]
pub struct PreviewDocs {
    program: String,
    remote: Option<String>,
    branch: Option<String>,
}

impl Default for PreviewDocs {
    fn default() -> Self {
        Self {
            program: "mike".to_string(),
            remote: None,
            branch: None,
        }
    }
}

impl PreviewDocs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Arguments for deleting a pull request's docs.
    pub fn delete_args(&self, pr_number: u64) -> Vec<String> {
        let mut args = vec!["delete".to_string(), "--push".to_string()];
        if let Some(remote) = &self.remote {
            args.extend(["--remote".to_string(), remote.clone()]);
        }
        if let Some(branch) = &self.branch {
            args.extend(["--branch".to_string(), branch.clone()]);
        }
        args.push(preview_version(pr_number));
        args
    }

    /// Delete and push the removal of `pr-<number>`.
    pub async fn delete(&self, pr_number: u64) -> Result<()> {
        let args = self.delete_args(pr_number);
        info!(program = %self.program, args = ?args, "Deleting preview docs");

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| PipelineError::io(format!("running {}", self.program), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::External(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        info!(version = %preview_version(pr_number), "Preview docs deleted");
        Ok(())
    }
}
