//! Atomic persistence for the summary document.
//!
//! Flush writes `path.tmp`, fsyncs, then renames into place while holding
//! an OS advisory lock, so a reader sees either the previous document or
//! the new one, never a truncated file. Load adopts a stranded `.tmp`
//! when the final rename of a previous run never happened.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::summary::SummaryTree;

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

/// Write the document atomically: tmp + fsync + rename under the lock.
pub fn save_atomic(path: &Path, tree: &SummaryTree) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    let payload = serde_json::to_vec_pretty(tree)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    lock_file.lock_exclusive()?;
    let renamed = std::fs::rename(&tmp, path);
    let _ = lock_file.unlock();
    renamed?;

    // Make the rename itself durable.
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}

/// Load the document if present. A `.tmp` without a final document means
/// the previous writer died between fsync and rename; its content is
/// complete, so adopt it.
pub fn load(path: &Path) -> anyhow::Result<Option<SummaryTree>> {
    let tmp = tmp_path(path);
    if !path.exists() && tmp.exists() {
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), "adopted stranded checkpoint");
    }
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorCategory;
    use crate::model::{PromptType, SuccessLevel, TaskType, TestRecord, TestResult, TestTask};
    use crate::transcript::Transcript;

    fn tree_with_records(n: usize) -> SummaryTree {
        let mut tree = SummaryTree::default();
        for _ in 0..n {
            let task = TestTask::new("m", TaskType::SimpleTask, PromptType::Baseline);
            let result = TestResult {
                success: false,
                success_level: SuccessLevel::Failure,
                execution_time_seconds: 1.0,
                turns: 1,
                tool_calls: vec![],
                executed_tools: vec![],
                workflow_score: 0.0,
                phase2_score: 0.0,
                quality_score: 0.0,
                final_score: 0.0,
                tool_coverage_rate: 0.0,
                format_error_count: 0,
                assisted: false,
                error_message: None,
                error_kind: None,
                transcript: Transcript::default(),
            };
            let mut r = TestRecord::from_parts(&task, &result);
            r.ai_error_category = Some(ErrorCategory::OtherErrors);
            tree.observe(&r);
        }
        tree
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let tree = tree_with_records(3);
        save_atomic(&path, &tree).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.total_records, 3);
        assert_eq!(loaded.models["m"].overall.total_tests, 3);
    }

    #[test]
    fn overwrite_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        save_atomic(&path, &tree_with_records(2)).unwrap();
        save_atomic(&path, &tree_with_records(5)).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.total_records, 5);
    }

    #[test]
    fn stranded_tmp_is_adopted_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        // Simulate a crash between fsync and rename: full content in .tmp,
        // no final document.
        let tree = tree_with_records(4);
        std::fs::write(
            tmp_path(&path),
            serde_json::to_vec_pretty(&tree).unwrap(),
        )
        .unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.total_records, 4);
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn missing_document_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).unwrap().is_none());
    }
}
