//! Environment toggles.
//!
//! Deliberately small: the environment only selects implementations, it
//! never carries tuning values beyond the partial-load count.

use std::path::PathBuf;

/// Row-log encoding, selected once at startup via `STORAGE_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// SQLite row table.
    RowLog,
    /// JSON-lines rows next to the summary document.
    Document,
}

impl StorageFormat {
    pub fn from_env() -> StorageFormat {
        match std::env::var("STORAGE_FORMAT").ok().as_deref() {
            Some("rowlog") => StorageFormat::RowLog,
            Some("document") | None => StorageFormat::Document,
            Some(other) => {
                tracing::warn!("unknown STORAGE_FORMAT '{other}', using document");
                StorageFormat::Document
            }
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// All environment-driven settings in one struct, read once.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub storage_format: StorageFormat,
    pub use_partial_loading: bool,
    /// Instances to keep per task type when partial loading is on.
    pub task_load_count: usize,
    /// Serve only pregenerated workflows; never load a generator model.
    pub skip_model_loading: bool,
    pub log_dir: PathBuf,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            storage_format: StorageFormat::Document,
            use_partial_loading: false,
            task_load_count: 20,
            skip_model_loading: false,
            log_dir: PathBuf::from("test_logs"),
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> EnvConfig {
        EnvConfig {
            storage_format: StorageFormat::from_env(),
            use_partial_loading: env_flag("USE_PARTIAL_LOADING"),
            task_load_count: std::env::var("TASK_LOAD_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            skip_model_loading: env_flag("SKIP_MODEL_LOADING"),
            log_dir: PathBuf::from("test_logs"),
        }
    }

    /// Per-type cap for the task library, when enabled.
    pub fn partial_load_limit(&self) -> Option<usize> {
        self.use_partial_loading.then_some(self.task_load_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn storage_format_defaults_to_document() {
        std::env::remove_var("STORAGE_FORMAT");
        assert_eq!(StorageFormat::from_env(), StorageFormat::Document);
        std::env::set_var("STORAGE_FORMAT", "rowlog");
        assert_eq!(StorageFormat::from_env(), StorageFormat::RowLog);
        std::env::set_var("STORAGE_FORMAT", "garbage");
        assert_eq!(StorageFormat::from_env(), StorageFormat::Document);
        std::env::remove_var("STORAGE_FORMAT");
    }

    #[test]
    #[serial]
    fn partial_loading_reads_count() {
        std::env::set_var("USE_PARTIAL_LOADING", "true");
        std::env::set_var("TASK_LOAD_COUNT", "7");
        let cfg = EnvConfig::from_env();
        assert_eq!(cfg.partial_load_limit(), Some(7));
        std::env::remove_var("USE_PARTIAL_LOADING");
        std::env::remove_var("TASK_LOAD_COUNT");
        let cfg = EnvConfig::from_env();
        assert_eq!(cfg.partial_load_limit(), None);
    }
}
