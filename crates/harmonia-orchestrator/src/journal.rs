use crate::types::{EvolutionRecord, EvolutionTrigger, HarmonySnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A structured record written to the journal sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    Evolution(EvolutionRecord),
    Harmony(HarmonySnapshot),
    TriggerDropped {
        trigger: EvolutionTrigger,
        capacity: usize,
        dropped_at: DateTime<Utc>,
    },
}

/// Destination for evolution records, harmony snapshots and dropped triggers.
///
/// `write` is called from synchronous sections and must not block.
pub trait JournalSink: Send + Sync {
    fn write(&self, entry: JournalEntry);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullJournal;

impl JournalSink for NullJournal {
    fn write(&self, _entry: JournalEntry) {}
}

/// Bounded in-process journal, newest entries kept.
pub struct MemoryJournal {
    limit: usize,
    entries: Mutex<VecDeque<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl JournalSink for MemoryJournal {
    fn write(&self, entry: JournalEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Append-only JSON-lines journal.
///
/// Entries go through an unbounded channel to a background task that owns
/// the file, so `write` never blocks the caller. Must be created inside a
/// tokio runtime.
pub struct FileJournal {
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<JournalEntry>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();
        let file_path = path.clone();

        let writer = tokio::spawn(async move {
            if let Some(parent) = file_path.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        warn!(path = %parent.display(), error = %e, "Cannot create journal directory");
                    }
                }
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "Cannot open journal file");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let line = match serde_json::to_string(&entry) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Journal entry not serializable");
                        continue;
                    }
                };
                if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                    warn!(error = %e, "Journal write failed");
                }
            }
            if let Err(e) = file.flush().await {
                warn!(error = %e, "Journal flush failed");
            }
            debug!(path = %file_path.display(), "Journal writer stopped");
        });

        Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting entries and wait until everything queued is on disk.
    pub async fn close(&self) {
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Journal writer task failed");
            }
        }
    }
}

impl JournalSink for FileJournal {
    fn write(&self, entry: JournalEntry) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(entry).is_err() {
                warn!("Journal writer gone, entry discarded");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{HarmonyStatus, Subsystem};

    fn snapshot(overall: f64) -> HarmonySnapshot {
        HarmonySnapshot {
            pattern_score: overall,
            task_score: overall,
            agent_score: overall,
            overall,
            status: HarmonyStatus::Balanced,
            weakest: Subsystem::Patterns,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_memory_journal_bounded() {
        let journal = MemoryJournal::new(2);
        for i in 0..3 {
            journal.write(JournalEntry::Harmony(snapshot(i as f64 / 10.0)));
        }
        let entries = journal.entries();
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            JournalEntry::Harmony(s) => assert!((s.overall - 0.1).abs() < 1e-9),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_journal_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");
        let journal = FileJournal::new(&path);
        journal.write(JournalEntry::Harmony(snapshot(0.9)));
        journal.write(JournalEntry::Harmony(snapshot(0.4)));
        journal.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: JournalEntry = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(first, JournalEntry::Harmony(_)));
        assert!(lines[1].contains("\"entry\":\"harmony\""));
    }

    #[tokio::test]
    async fn test_file_journal_write_after_close_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(dir.path().join("j.jsonl"));
        journal.close().await;
        journal.write(JournalEntry::Harmony(snapshot(0.5)));
        assert_eq!(journal.path().file_name().unwrap(), "j.jsonl");
    }
}
