//! Append-only row backends.
//!
//! Schema is the `TestRecord` product type, nullable where the type is
//! optional. Two encodings exist behind one trait: a SQLite table (the
//! queryable row format) and a JSON-lines file (the document-oriented
//! format). Sequence numbers are monotone per log and drive crash
//! recovery: replaying everything past the document's high-water mark
//! reproduces the live summary.

use rusqlite::{params, Connection};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::classifier::ErrorCategory;
use crate::errors::ErrorKind;
use crate::model::{Difficulty, FlawType, PromptType, SuccessLevel, TaskType, TestRecord};

pub trait RowLog: Send + Sync {
    /// Append records in one atomic batch; returns the new high-water
    /// sequence number.
    fn append_batch(&self, records: &[TestRecord]) -> anyhow::Result<u64>;
    /// Records with sequence numbers strictly above `after`, in append
    /// order.
    fn replay_since(&self, after: u64) -> anyhow::Result<Vec<TestRecord>>;
    fn count(&self) -> anyhow::Result<u64>;
    /// Drop rows for one model, or everything.
    fn clear(&self, model: Option<&str>) -> anyhow::Result<()>;
}

// ── SQLite backend ──────────────────────────────────────────────────────

pub struct SqliteRowLog {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS test_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    model TEXT NOT NULL,
    deployment TEXT,
    task_type TEXT NOT NULL,
    prompt_type TEXT NOT NULL,
    difficulty TEXT NOT NULL,
    is_flawed INTEGER NOT NULL,
    flaw_type TEXT,
    tool_success_rate REAL NOT NULL,
    success INTEGER NOT NULL,
    success_level TEXT NOT NULL,
    execution_time REAL NOT NULL,
    turns INTEGER NOT NULL,
    tool_calls TEXT NOT NULL,
    executed_tools TEXT NOT NULL,
    workflow_score REAL NOT NULL,
    phase2_score REAL NOT NULL,
    quality_score REAL NOT NULL,
    final_score REAL NOT NULL,
    tool_coverage_rate REAL NOT NULL,
    format_error_count INTEGER NOT NULL,
    assisted INTEGER NOT NULL,
    error_message TEXT,
    error_kind TEXT,
    ai_error_category TEXT,
    ai_error_reason TEXT,
    ai_confidence REAL,
    timestamp TEXT NOT NULL
)";

impl SqliteRowLog {
    pub fn open(path: &Path) -> anyhow::Result<SqliteRowLog> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(SCHEMA, [])?;
        Ok(SqliteRowLog { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> anyhow::Result<SqliteRowLog> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(SqliteRowLog { conn: Mutex::new(conn) })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestRecord> {
    let parse_list = |raw: String| -> Vec<String> {
        serde_json::from_str(&raw).unwrap_or_default()
    };
    let task_type: String = row.get("task_type")?;
    let prompt_type: String = row.get("prompt_type")?;
    let difficulty: String = row.get("difficulty")?;
    let success_level: String = row.get("success_level")?;
    let flaw_type: Option<String> = row.get("flaw_type")?;
    let error_kind: Option<String> = row.get("error_kind")?;
    let ai_error_category: Option<String> = row.get("ai_error_category")?;
    Ok(TestRecord {
        model: row.get("model")?,
        deployment: row.get("deployment")?,
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::SimpleTask),
        prompt_type: PromptType::parse(&prompt_type).unwrap_or(PromptType::Baseline),
        difficulty: Difficulty::parse(&difficulty).unwrap_or(Difficulty::Easy),
        is_flawed: row.get::<_, i64>("is_flawed")? != 0,
        flaw_type: flaw_type.as_deref().and_then(FlawType::parse),
        tool_success_rate: row.get("tool_success_rate")?,
        success: row.get::<_, i64>("success")? != 0,
        success_level: match success_level.as_str() {
            "full_success" => SuccessLevel::FullSuccess,
            "partial_success" => SuccessLevel::PartialSuccess,
            _ => SuccessLevel::Failure,
        },
        execution_time_seconds: row.get("execution_time")?,
        turns: row.get::<_, i64>("turns")? as u32,
        tool_calls: parse_list(row.get("tool_calls")?),
        executed_tools: parse_list(row.get("executed_tools")?),
        workflow_score: row.get("workflow_score")?,
        phase2_score: row.get("phase2_score")?,
        quality_score: row.get("quality_score")?,
        final_score: row.get("final_score")?,
        tool_coverage_rate: row.get("tool_coverage_rate")?,
        format_error_count: row.get::<_, i64>("format_error_count")? as u32,
        assisted: row.get::<_, i64>("assisted")? != 0,
        error_message: row.get("error_message")?,
        error_kind: match error_kind.as_deref() {
            Some("throttle") => Some(ErrorKind::Throttle),
            Some("timeout") => Some(ErrorKind::Timeout),
            Some("transport") => Some(ErrorKind::Transport),
            Some("no_workflow") => Some(ErrorKind::NoWorkflow),
            Some(_) => Some(ErrorKind::Other),
            None => None,
        },
        ai_error_category: ai_error_category.as_deref().and_then(ErrorCategory::parse),
        ai_error_reason: row.get("ai_error_reason")?,
        ai_confidence: row.get("ai_confidence")?,
        timestamp: row.get("timestamp")?,
    })
}

impl RowLog for SqliteRowLog {
    fn append_batch(&self, records: &[TestRecord]) -> anyhow::Result<u64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO test_records (
                    model, deployment, task_type, prompt_type, difficulty,
                    is_flawed, flaw_type, tool_success_rate, success,
                    success_level, execution_time, turns, tool_calls,
                    executed_tools, workflow_score, phase2_score,
                    quality_score, final_score, tool_coverage_rate,
                    format_error_count, assisted, error_message, error_kind,
                    ai_error_category, ai_error_reason, ai_confidence, timestamp
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,
                          ?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.model,
                    r.deployment,
                    r.task_type.as_str(),
                    r.prompt_type.to_string(),
                    r.difficulty.as_str(),
                    r.is_flawed as i64,
                    r.flaw_type.map(|f| f.as_str()),
                    r.tool_success_rate,
                    r.success as i64,
                    r.success_level.as_str(),
                    r.execution_time_seconds,
                    r.turns as i64,
                    serde_json::to_string(&r.tool_calls)?,
                    serde_json::to_string(&r.executed_tools)?,
                    r.workflow_score,
                    r.phase2_score,
                    r.quality_score,
                    r.final_score,
                    r.tool_coverage_rate,
                    r.format_error_count as i64,
                    r.assisted as i64,
                    r.error_message,
                    r.error_kind.map(|k| k.as_str()),
                    r.ai_error_category.map(|c| c.as_str()),
                    r.ai_error_reason,
                    r.ai_confidence,
                    r.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        let high: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM test_records",
            [],
            |row| row.get(0),
        )?;
        Ok(high as u64)
    }

    fn replay_since(&self, after: u64) -> anyhow::Result<Vec<TestRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM test_records WHERE seq > ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map([after as i64], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn count(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM test_records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn clear(&self, model: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        match model {
            Some(m) => {
                conn.execute("DELETE FROM test_records WHERE model = ?1", [m])?;
            }
            None => {
                conn.execute("DELETE FROM test_records", [])?;
            }
        }
        Ok(())
    }
}

// ── JSON-lines backend ──────────────────────────────────────────────────

/// One serialized record per line. The sequence number is the line count.
pub struct JsonlRowLog {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonlRowLog {
    pub fn open(path: &Path) -> anyhow::Result<JsonlRowLog> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(JsonlRowLog { path: path.to_path_buf(), guard: Mutex::new(()) })
    }

    fn read_all(&self) -> anyhow::Result<Vec<TestRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => out.push(record),
                // A torn final line means the process died mid-append;
                // everything before it is intact.
                Err(e) => {
                    tracing::warn!("skipping unparseable row-log line: {e}");
                }
            }
        }
        Ok(out)
    }
}

impl RowLog for JsonlRowLog {
    fn append_batch(&self, records: &[TestRecord]) -> anyhow::Result<u64> {
        let _guard = self.guard.lock().unwrap();
        let mut payload = String::new();
        for r in records {
            payload.push_str(&serde_json::to_string(r)?);
            payload.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        drop(file);
        Ok(self.read_all()?.len() as u64)
    }

    fn replay_since(&self, after: u64) -> anyhow::Result<Vec<TestRecord>> {
        let _guard = self.guard.lock().unwrap();
        Ok(self.read_all()?.into_iter().skip(after as usize).collect())
    }

    fn count(&self) -> anyhow::Result<u64> {
        let _guard = self.guard.lock().unwrap();
        Ok(self.read_all()?.len() as u64)
    }

    fn clear(&self, model: Option<&str>) -> anyhow::Result<()> {
        let _guard = self.guard.lock().unwrap();
        match model {
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path)?;
                }
            }
            Some(m) => {
                let kept: Vec<TestRecord> = self
                    .read_all()?
                    .into_iter()
                    .filter(|r| r.model != m)
                    .collect();
                let mut payload = String::new();
                for r in &kept {
                    payload.push_str(&serde_json::to_string(r)?);
                    payload.push('\n');
                }
                std::fs::write(&self.path, payload)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TestResult, TestTask};
    use crate::transcript::Transcript;

    fn record(model: &str, level: SuccessLevel) -> TestRecord {
        let task = TestTask::new(model, TaskType::DataPipeline, PromptType::Optimal);
        let result = TestResult {
            success: level != SuccessLevel::Failure,
            success_level: level,
            execution_time_seconds: 1.5,
            turns: 2,
            tool_calls: vec!["data_reader".into()],
            executed_tools: vec!["data_reader".into()],
            workflow_score: 1.0,
            phase2_score: 1.0,
            quality_score: 1.0,
            final_score: 1.0,
            tool_coverage_rate: 1.0,
            format_error_count: 0,
            assisted: false,
            error_message: None,
            error_kind: None,
            transcript: Transcript::default(),
        };
        TestRecord::from_parts(&task, &result)
    }

    fn exercise(log: &dyn RowLog) {
        let hw = log
            .append_batch(&[
                record("m1", SuccessLevel::FullSuccess),
                record("m2", SuccessLevel::Failure),
            ])
            .unwrap();
        assert_eq!(hw, 2);
        assert_eq!(log.count().unwrap(), 2);

        let hw2 = log.append_batch(&[record("m1", SuccessLevel::PartialSuccess)]).unwrap();
        assert_eq!(hw2, 3);

        let tail = log.replay_since(hw).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].success_level, SuccessLevel::PartialSuccess);

        let all = log.replay_since(0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].model, "m1");
        assert_eq!(all[0].tool_calls, vec!["data_reader"]);

        log.clear(Some("m1")).unwrap();
        assert_eq!(log.count().unwrap(), 1);
        log.clear(None).unwrap();
        assert_eq!(log.count().unwrap(), 0);
    }

    #[test]
    fn sqlite_backend_round_trips() {
        let log = SqliteRowLog::open_in_memory().unwrap();
        exercise(&log);
    }

    #[test]
    fn jsonl_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlRowLog::open(&dir.path().join("records.jsonl")).unwrap();
        exercise(&log);
    }

    #[test]
    fn sqlite_preserves_optional_fields() {
        let log = SqliteRowLog::open_in_memory().unwrap();
        let mut r = record("m", SuccessLevel::Failure);
        r.error_message = Some("boom".into());
        r.error_kind = Some(ErrorKind::Transport);
        r.ai_error_category = Some(ErrorCategory::DependencyErrors);
        r.ai_error_reason = Some("prereq missing".into());
        r.ai_confidence = Some(0.7);
        log.append_batch(std::slice::from_ref(&r)).unwrap();
        let loaded = &log.replay_since(0).unwrap()[0];
        assert_eq!(loaded.error_kind, Some(ErrorKind::Transport));
        assert_eq!(loaded.ai_error_category, Some(ErrorCategory::DependencyErrors));
        assert_eq!(loaded.ai_confidence, Some(0.7));
    }

    #[test]
    fn jsonl_clear_after_sqlite_style_sequence_survives_model_filter() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlRowLog::open(&dir.path().join("records.jsonl")).unwrap();
        log.append_batch(&[record("keep", SuccessLevel::FullSuccess)]).unwrap();
        log.append_batch(&[record("drop", SuccessLevel::FullSuccess)]).unwrap();
        log.clear(Some("drop")).unwrap();
        let rows = log.replay_since(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "keep");
    }
}
