//! JSONL transcript logs
//!
//! One file per run: a metadata line, then one line per appended or upgraded
//! transcript entry. Replaying applies upgrades by entry id.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use weft_engine::TranscriptEntry;

/// Log line types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// Log metadata
    Metadata {
        id: String,
        created_at: i64,
        base_url: String,
    },
    /// An entry was appended
    Entry {
        entry: TranscriptEntry,
        timestamp: i64,
    },
    /// An entry was upgraded in place
    Update {
        entry: TranscriptEntry,
        timestamp: i64,
    },
}

/// Writer for one run's transcript log
pub struct TranscriptLog {
    id: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TranscriptLog {
    /// Get the transcript log directory
    pub fn logs_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weft")
            .join("transcripts")
    }

    /// Create a new log in the default directory
    pub fn create(base_url: &str) -> std::io::Result<Self> {
        Self::create_in(&Self::logs_dir(), base_url)
    }

    pub fn create_in(dir: &Path, base_url: &str) -> std::io::Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(dir)?;

        let path = dir.join(format!("{}.jsonl", id));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let metadata = LogEntry::Metadata {
            id: id.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
            base_url: base_url.to_string(),
        };
        writeln!(writer, "{}", serde_json::to_string(&metadata)?)?;
        writer.flush()?;

        Ok(Self { id, path, writer })
    }

    /// Get log ID
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an appended entry
    pub fn append(&mut self, entry: &TranscriptEntry) -> std::io::Result<()> {
        self.write(LogEntry::Entry {
            entry: entry.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Record an in-place upgrade
    pub fn update(&mut self, entry: &TranscriptEntry) -> std::io::Result<()> {
        self.write(LogEntry::Update {
            entry: entry.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn write(&mut self, line: LogEntry) -> std::io::Result<()> {
        writeln!(self.writer, "{}", serde_json::to_string(&line)?)?;
        self.writer.flush()
    }

    /// Resolve a log's final transcript, upgrades applied
    pub fn replay(path: &Path) -> std::io::Result<Vec<TranscriptEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries: Vec<TranscriptEntry> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(LogEntry::Entry { entry, .. }) => entries.push(entry),
                Ok(LogEntry::Update { entry, .. }) => {
                    match entries.iter_mut().find(|e| e.id() == entry.id()) {
                        Some(existing) => *existing = entry,
                        None => entries.push(entry),
                    }
                }
                Ok(LogEntry::Metadata { .. }) => {}
                Err(e) => tracing::warn!("Skipping unreadable log line: {}", e),
            }
        }
        Ok(entries)
    }

    /// Path of a log by id in the default directory. Ids are uuids; anything
    /// else is rejected.
    pub fn path_for(id: &str) -> Option<PathBuf> {
        let id = uuid::Uuid::parse_str(id.trim()).ok()?;
        Some(Self::logs_dir().join(format!("{}.jsonl", id)))
    }

    /// List logs in the default directory
    pub fn list() -> std::io::Result<Vec<LogInfo>> {
        Self::list_in(&Self::logs_dir())
    }

    pub fn list_in(dir: &Path) -> std::io::Result<Vec<LogInfo>> {
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut logs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("jsonl") {
                if let Some(info) = Self::read_info(&path) {
                    logs.push(info);
                }
            }
        }

        // Newest first
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(logs)
    }

    fn read_info(path: &Path) -> Option<LogInfo> {
        let file = File::open(path).ok()?;
        let mut lines = BufReader::new(file).lines().map_while(Result::ok);

        let LogEntry::Metadata {
            id,
            created_at,
            base_url,
        } = serde_json::from_str::<LogEntry>(&lines.next()?).ok()?
        else {
            return None;
        };

        let mut first_query = None;
        let mut entry_count = 0;
        for line in lines {
            if let Ok(LogEntry::Entry { entry, .. }) = serde_json::from_str::<LogEntry>(&line) {
                entry_count += 1;
                if first_query.is_none() {
                    if let TranscriptEntry::User { content, .. } = entry {
                        first_query = Some(content);
                    }
                }
            }
        }

        Some(LogInfo {
            id,
            created_at,
            base_url,
            entry_count,
            first_query,
        })
    }
}

/// Information about a saved log
#[derive(Debug, Clone)]
pub struct LogInfo {
    pub id: String,
    pub created_at: i64,
    pub base_url: String,
    pub entry_count: usize,
    pub first_query: Option<String>,
}

impl LogInfo {
    /// Format the created_at timestamp for display
    pub fn created_at_display(&self) -> String {
        use chrono::{TimeZone, Utc};
        Utc.timestamp_millis_opt(self.created_at)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("weft-log-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_write_and_replay() {
        let dir = scratch_dir();
        let mut log = TranscriptLog::create_in(&dir, "http://localhost:8000/api").unwrap();

        let user = TranscriptEntry::user("c1", "what is new?");
        let answer = TranscriptEntry::assistant_final("c1", "draft");
        log.append(&user).unwrap();
        log.append(&answer).unwrap();

        let mut revised = answer.clone();
        if let TranscriptEntry::AssistantFinal { content, .. } = &mut revised {
            *content = "final".to_string();
        }
        log.update(&revised).unwrap();

        let entries = TranscriptLog::replay(log.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], user);
        assert_eq!(entries[1].content(), "final");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_list_logs() {
        let dir = scratch_dir();
        let mut log = TranscriptLog::create_in(&dir, "http://backend").unwrap();
        log.append(&TranscriptEntry::user("c1", "first query")).unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let logs = TranscriptLog::list_in(&dir).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, log.id());
        assert_eq!(logs[0].base_url, "http://backend");
        assert_eq!(logs[0].entry_count, 1);
        assert_eq!(logs[0].first_query.as_deref(), Some("first query"));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_path_for_accepts_only_uuids() {
        let id = uuid::Uuid::new_v4().to_string();
        let path = TranscriptLog::path_for(&id).unwrap();
        assert_eq!(path.parent(), Some(TranscriptLog::logs_dir().as_path()));
        assert_eq!(path.file_name().unwrap().to_string_lossy(), format!("{}.jsonl", id));

        assert!(TranscriptLog::path_for("../../etc/passwd").is_none());
        assert!(TranscriptLog::path_for("notes").is_none());
        assert!(TranscriptLog::path_for("").is_none());
    }

    #[test]
    fn test_list_missing_dir() {
        assert!(TranscriptLog::list_in(&scratch_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_created_at_display() {
        let info = LogInfo {
            id: "x".into(),
            created_at: 0,
            base_url: String::new(),
            entry_count: 0,
            first_query: None,
        };
        assert_eq!(info.created_at_display(), "1970-01-01 00:00");
    }
}
