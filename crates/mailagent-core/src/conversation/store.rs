//! Append-only conversation store with optional JSON lines persistence

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::{Turn, TurnRecord};
use crate::error::{Error, Result};

#[derive(Default)]
struct StoreState {
    records: Vec<TurnRecord>,
    /// Calls awaiting a result, in proposal order
    open_calls: Vec<String>,
    seen_call_ids: HashSet<String>,
}

impl StoreState {
    fn last_seq(&self) -> u64 {
        self.records.last().map(|r| r.seq).unwrap_or(0)
    }

    /// Check that `turn` may follow the current log
    fn check(&self, turn: &Turn) -> Result<()> {
        match turn {
            Turn::User { .. } | Turn::Assistant { .. } if !self.open_calls.is_empty() => {
                Err(Error::Conversation(format!(
                    "{} turn while calls are open: {}",
                    turn.kind(),
                    self.open_calls.join(", ")
                )))
            }
            Turn::ToolCall { call_id, .. } if call_id.is_empty() => {
                Err(Error::Conversation("tool call without call id".to_string()))
            }
            Turn::ToolCall { call_id, .. } if self.seen_call_ids.contains(call_id) => Err(
                Error::Conversation(format!("call id {} reused", call_id)),
            ),
            Turn::ToolResult { call_id, .. } if !self.open_calls.contains(call_id) => Err(
                Error::Conversation(format!("result for call {} which is not open", call_id)),
            ),
            _ => Ok(()),
        }
    }

    fn commit(&mut self, record: TurnRecord) {
        match &record.turn {
            Turn::ToolCall { call_id, .. } => {
                self.seen_call_ids.insert(call_id.clone());
                self.open_calls.push(call_id.clone());
            }
            Turn::ToolResult { call_id, .. } => {
                self.open_calls.retain(|id| id != call_id);
            }
            _ => {}
        }
        self.records.push(record);
    }
}

/// Where appended records go
enum LogWriter {
    Memory,
    File(File),
    /// Loaded for inspection; appends are refused
    ReadOnly,
    /// A failed write could not be rolled back; appends are refused
    Failed,
}

/// Ordered log of turns for one session.
///
/// No record is ever mutated or removed. Every tool call gets exactly one
/// result before the next user or assistant turn.
pub struct ConversationStore {
    session_id: String,
    state: RwLock<StoreState>,
    /// Serializes appenders; holds the log file when persistence is on
    writer: tokio::sync::Mutex<LogWriter>,
    path: Option<PathBuf>,
    #[cfg(test)]
    short_write: std::sync::atomic::AtomicBool,
}

impl ConversationStore {
    /// Store kept only in memory
    pub fn in_memory(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: RwLock::new(StoreState::default()),
            writer: tokio::sync::Mutex::new(LogWriter::Memory),
            path: None,
            #[cfg(test)]
            short_write: Default::default(),
        }
    }

    /// Open the log at `path`, replaying existing records
    pub async fn open(session_id: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let session_id = session_id.into();
        let path = path.into();
        let (state, truncated) = replay(&path).await?;
        if !state.records.is_empty() {
            info!(
                "Loaded {} turns for session {} from {:?}",
                state.records.len(),
                session_id,
                path
            );
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if truncated {
            // Terminate the partial line so the next record starts cleanly
            file.write_all(b"\n").await?;
        }

        Ok(Self {
            session_id,
            state: RwLock::new(state),
            writer: tokio::sync::Mutex::new(LogWriter::File(file)),
            path: Some(path),
            #[cfg(test)]
            short_write: Default::default(),
        })
    }

    /// Replay the log at `path` without opening it for writing. The file is
    /// left untouched and appends are refused.
    pub async fn load(session_id: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (state, _) = replay(&path).await?;
        Ok(Self {
            session_id: session_id.into(),
            state: RwLock::new(state),
            writer: tokio::sync::Mutex::new(LogWriter::ReadOnly),
            path: Some(path),
            #[cfg(test)]
            short_write: Default::default(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Log file, when persistence is on
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a turn and return its record
    pub async fn append(&self, turn: Turn) -> Result<TurnRecord> {
        let mut writer = self.writer.lock().await;

        // Appenders are serialized by `writer`, so the state cannot change
        // between this check and the commit below
        let record = {
            let state = self.state.read();
            state.check(&turn)?;
            TurnRecord {
                seq: state.last_seq() + 1,
                at: Utc::now(),
                turn,
            }
        };

        match &mut *writer {
            LogWriter::Memory => {}
            LogWriter::ReadOnly => {
                return Err(Error::Conversation(format!(
                    "log of session {} is open read-only",
                    self.session_id
                )))
            }
            LogWriter::Failed => {
                return Err(Error::Conversation(format!(
                    "log of session {} is unusable after a failed write",
                    self.session_id
                )))
            }
            LogWriter::File(file) => {
                let mut line = serde_json::to_string(&record)?;
                line.push('\n');

                // A failed write must not leave a partial line for the next
                // record to land behind
                let len = file.metadata().await?.len();
                if let Err(e) = self.write_line(file, line.as_bytes()).await {
                    match file.set_len(len).await {
                        Ok(()) => warn!(
                            "Session {} append failed, log rolled back: {}",
                            self.session_id, e
                        ),
                        Err(rollback) => {
                            error!(
                                "Session {} append failed and rollback failed: {} / {}",
                                self.session_id, e, rollback
                            );
                            *writer = LogWriter::Failed;
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        debug!(
            "Session {} appended {} turn #{}",
            self.session_id,
            record.turn.kind(),
            record.seq
        );
        self.state.write().commit(record.clone());
        Ok(record)
    }

    async fn write_line(&self, file: &mut File, line: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if self.short_write.swap(false, std::sync::atomic::Ordering::SeqCst) {
            file.write_all(&line[..line.len() / 2]).await?;
            file.flush().await?;
            return Err(std::io::Error::other("disk full"));
        }

        file.write_all(line).await?;
        file.flush().await
    }

    /// Records appended after `marker`, in order
    pub fn turns_since(&self, marker: u64) -> Vec<TurnRecord> {
        let state = self.state.read();
        // seq is dense and starts at 1
        let start = (marker as usize).min(state.records.len());
        state.records[start..].to_vec()
    }

    /// Every record, in order
    pub fn snapshot(&self) -> Vec<TurnRecord> {
        self.state.read().records.clone()
    }

    /// Marker of the last record (0 when empty)
    pub fn last_marker(&self) -> u64 {
        self.state.read().last_seq()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// At most `window` most recent records, without tool results whose call
    /// fell outside the window
    pub fn recent(&self, window: usize) -> Vec<TurnRecord> {
        let state = self.state.read();
        let start = state.records.len().saturating_sub(window);
        let slice = &state.records[start..];

        let calls_in_window: HashSet<&str> = slice
            .iter()
            .filter_map(|r| match &r.turn {
                Turn::ToolCall { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        slice
            .iter()
            .filter(|r| match &r.turn {
                Turn::ToolResult { call_id, .. } => calls_in_window.contains(call_id.as_str()),
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Call ids still waiting for a result, in proposal order
    pub fn open_calls(&self) -> Vec<String> {
        self.state.read().open_calls.clone()
    }

    /// Capability name of an open call
    pub fn open_call_capability(&self, call_id: &str) -> Option<String> {
        let state = self.state.read();
        if !state.open_calls.iter().any(|id| id == call_id) {
            return None;
        }
        state.records.iter().rev().find_map(|r| match &r.turn {
            Turn::ToolCall {
                call_id: id,
                capability,
                ..
            } if id == call_id => Some(capability.clone()),
            _ => None,
        })
    }

    /// Every call id recorded in this session
    pub fn call_ids(&self) -> Vec<String> {
        self.state.read().seen_call_ids.iter().cloned().collect()
    }
}

/// Rebuild state from a log file through the same checks as `append`.
/// Also reports whether the file ends in an unterminated line.
async fn replay(path: &Path) -> Result<(StoreState, bool)> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((StoreState::default(), false))
        }
        Err(e) => return Err(e.into()),
    };
    let truncated = !contents.is_empty() && !contents.ends_with('\n');

    let mut state = StoreState::default();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let record: TurnRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                // A crash mid-write leaves a truncated last line
                warn!("Skipping unreadable line {} of {:?}: {}", line_no + 1, path, e);
                continue;
            }
        };

        state.check(&record.turn).map_err(|e| {
            Error::Conversation(format!("{:?} line {}: {}", path, line_no + 1, e))
        })?;
        if record.seq != state.last_seq() + 1 {
            return Err(Error::Conversation(format!(
                "{:?} line {}: expected marker {}, found {}",
                path,
                line_no + 1,
                state.last_seq() + 1,
                record.seq
            )));
        }
        state.commit(record);
    }

    Ok((state, truncated))
}
