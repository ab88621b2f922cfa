//! Pipeline configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `ANAMNESIS_*` environment variable overrides. All knobs that the
//! pipeline's contracts call "configurable" live here.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the learning validation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root directory for workflow records and report snapshots
    pub data_dir: PathBuf,

    /// Path to the document-store database file (":memory:" for tests)
    pub database_path: String,

    /// Minimum validation score required for promotion
    pub promotion_threshold: f64,

    /// Hours a workflow may wait for its after-report before expiring
    pub expiry_hours: i64,

    /// Half-width of the chat correlation window, in minutes
    pub correlation_window_minutes: i64,

    /// How long to wait for a workflow's advisory lock before aborting
    pub lock_timeout_ms: u64,

    /// Attempts for document-store writes before surfacing the error
    pub store_retry_attempts: u32,

    /// Base backoff between store write retries, in milliseconds
    pub store_retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".anamnesis"),
            database_path: ".anamnesis/store.db".to_string(),
            promotion_threshold: 0.5,
            expiry_hours: 24,
            correlation_window_minutes: 120,
            lock_timeout_ms: 2000,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 250,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from defaults, an optional file, and environment
    ///
    /// Environment overrides use the `ANAMNESIS_` prefix, e.g.
    /// `ANAMNESIS_PROMOTION_THRESHOLD=0.7`.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = PipelineConfig::default();

        let mut builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("database_path", defaults.database_path.clone())?
            .set_default("promotion_threshold", defaults.promotion_threshold)?
            .set_default("expiry_hours", defaults.expiry_hours)?
            .set_default(
                "correlation_window_minutes",
                defaults.correlation_window_minutes,
            )?
            .set_default("lock_timeout_ms", defaults.lock_timeout_ms as i64)?
            .set_default("store_retry_attempts", defaults.store_retry_attempts as i64)?
            .set_default(
                "store_retry_backoff_ms",
                defaults.store_retry_backoff_ms as i64,
            )?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            // Conventional project-local config, ignored when absent
            builder = builder.add_source(
                config::File::with_name(".anamnesis/config").required(false),
            );
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("ANAMNESIS"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Directory holding one JSON record per open workflow
    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }

    /// Directory holding raw report snapshots
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    /// Duration form of the chat correlation half-window
    pub fn correlation_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.correlation_window_minutes)
    }

    /// Duration form of the workflow expiry timeout
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.promotion_threshold, 0.5);
        assert_eq!(cfg.expiry_hours, 24);
        assert_eq!(cfg.correlation_window_minutes, 120);
        assert_eq!(cfg.store_retry_attempts, 3);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = PipelineConfig::load(None).expect("defaults should load");
        assert_eq!(cfg.promotion_threshold, 0.5);
        assert_eq!(cfg.workflows_dir(), PathBuf::from(".anamnesis/workflows"));
        assert_eq!(cfg.reports_dir(), PathBuf::from(".anamnesis/reports"));
    }

    #[test]
    fn test_durations() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.correlation_window(), chrono::Duration::hours(2));
        assert_eq!(cfg.expiry(), chrono::Duration::hours(24));
    }
}
