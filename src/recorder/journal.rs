use std::{
    collections::VecDeque,
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const JOURNAL_FILE: &str = "run_journal.jsonl";

/// Durable lifecycle log of a recorder, stored as JSON-L lines.
#[derive(Debug, Clone)]
pub struct RunJournal {
    log_path: PathBuf,
}

impl RunJournal {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(JOURNAL_FILE))
    }

    /// Replace the log with exactly `events`.
    pub fn rewrite(&self, events: &[RunEvent]) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Unable to create journal directory {}", parent.display()))?;
        }

        let mut file = fs::File::create(&self.log_path)
            .with_context(|| format!("Failed to rewrite run journal {}", self.log_path.display()))?;
        for event in events {
            writeln!(file, "{}", serde_json::to_string(event)?)?;
        }
        Ok(())
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Read the most recent `limit` events from the JSON-L log.
    pub fn read_events(&self, limit: usize) -> Result<Vec<RunEvent>> {
        if limit == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.log_path)
            .with_context(|| format!("Failed to open run journal {}", self.log_path.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<RunEvent> = VecDeque::with_capacity(limit);
        for line in reader.lines() {
            let line = line?;
            let event: RunEvent = serde_json::from_str(&line)?;
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }

        Ok(buffer.into_iter().collect())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Start,
    Finish,
    Close,
}

/// One recorder lifecycle event.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub phase: RunPhase,
    pub recorder_id: Uuid,
    pub run: Option<usize>,
    pub metrics: Vec<String>,
    pub success: Option<bool>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl RunEvent {
    pub fn start(recorder_id: Uuid, run: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: RunPhase::Start,
            recorder_id,
            run: Some(run),
            metrics: Vec::new(),
            success: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn finish(
        recorder_id: Uuid,
        run: usize,
        collected: Vec<String>,
        duration_ms: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: RunPhase::Finish,
            recorder_id,
            run: Some(run),
            metrics: collected,
            success: Some(error.is_none()),
            duration_ms: Some(duration_ms),
            error,
        }
    }

    pub fn close(recorder_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: RunPhase::Close,
            recorder_id,
            run: None,
            metrics: Vec::new(),
            success: None,
            duration_ms: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn finish_event_records_outcome() {
        let ok = RunEvent::finish(Uuid::nil(), 2, vec!["A.X".into()], 1200, None);
        assert_eq!(ok.phase, RunPhase::Finish);
        assert_eq!(ok.success, Some(true));
        assert_eq!(ok.run, Some(2));

        let failed = RunEvent::finish(Uuid::nil(), 3, vec![], 10, Some("boom".into()));
        assert_eq!(failed.success, Some(false));
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn read_events_returns_recent_entries() {
        let temp = tempdir().unwrap();
        let journal = RunJournal::in_dir(&temp.path().join("out"));

        let events: Vec<RunEvent> = (0..5).map(|run| RunEvent::start(Uuid::nil(), run)).collect();
        journal.rewrite(&events).unwrap();

        let events = journal.read_events(3).unwrap();
        assert_eq!(
            events.iter().map(|event| event.run).collect::<Vec<_>>(),
            vec![Some(2), Some(3), Some(4)]
        );
        assert_eq!(journal.read_events(10).unwrap().len(), 5);
        assert!(journal.read_events(0).unwrap().is_empty());

        fs::remove_file(journal.log_path()).unwrap();
        assert!(journal.read_events(5).unwrap().is_empty());
    }

    #[test]
    fn rewrite_replaces_earlier_entries() {
        let temp = tempdir().unwrap();
        let journal = RunJournal::in_dir(temp.path());
        let first: Vec<RunEvent> = (0..3).map(|run| RunEvent::start(Uuid::nil(), run)).collect();
        journal.rewrite(&first).unwrap();

        let events = [RunEvent::start(Uuid::nil(), 7), RunEvent::close(Uuid::nil())];
        journal.rewrite(&events).unwrap();

        let read = journal.read_events(10).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].run, Some(7));
        assert_eq!(read[1].phase, RunPhase::Close);
    }
}
