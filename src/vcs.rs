//! Version-control inspector
//!
//! The correlator needs exactly one thing from version control: the set of
//! files and a summary for the change between two revisions. The trait keeps
//! that seam mockable; the default implementation shells out to git.

use crate::error::{AnamnesisError, Result};
use crate::types::CodeChangeRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Inspector over a version-control repository
#[async_trait]
pub trait VcsInspector: Send + Sync {
    /// Diff between two revisions, optionally restricted to `paths`
    async fn diff(
        &self,
        from_ref: &str,
        to_ref: &str,
        paths: Option<&[String]>,
    ) -> Result<CodeChangeRef>;
}

/// Git-backed inspector shelling out to the `git` binary
pub struct GitInspector {
    repo_root: PathBuf,
}

impl GitInspector {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "Running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| AnamnesisError::Vcs(format!("failed to spawn git: {}", e)))?;

        if !output.status.success() {
            return Err(AnamnesisError::Vcs(format!(
                "git {:?} exited with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VcsInspector for GitInspector {
    async fn diff(
        &self,
        from_ref: &str,
        to_ref: &str,
        paths: Option<&[String]>,
    ) -> Result<CodeChangeRef> {
        let range = format!("{}..{}", from_ref, to_ref);

        let mut name_args = vec!["diff", "--name-only", &range];
        if let Some(paths) = paths {
            name_args.push("--");
            name_args.extend(paths.iter().map(|p| p.as_str()));
        }
        let files: BTreeSet<String> = self
            .git(&name_args)
            .await?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let diff_summary = self
            .git(&["diff", "--shortstat", &range])
            .await?
            .trim()
            .to_string();

        // Author and commit time of the target revision
        let meta = self
            .git(&["log", "-1", "--format=%an%x09%cI", to_ref])
            .await?;
        let mut parts = meta.trim().splitn(2, '\t');
        let author = parts.next().unwrap_or_default().to_string();
        let timestamp = parts
            .next()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(CodeChangeRef {
            commit_ref: to_ref.to_string(),
            files,
            diff_summary,
            author,
            timestamp,
        })
    }
}
