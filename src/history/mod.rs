//! Replay history persistence
//!
//! JSON-file implementation of the replay history collaborator. The
//! supervisor pushes state changes in; nothing here is ever read back
//! by the core.

use crate::replay::{HistorySink, HistoryUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Entries kept before the oldest are dropped
const MAX_ENTRIES: usize = 100;

/// One persisted replay record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub replay_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub packets_sent: Option<u64>,
    pub error_message: Option<String>,
}

/// Replay history persisted as a JSON file, newest entries first
pub struct JsonHistory {
    path: PathBuf,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl JsonHistory {
    /// Open a history file, loading any existing entries
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path: PathBuf = path.as_ref().to_path_buf();
        let entries: Vec<HistoryEntry> = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<HistoryEntry>>(&content) {
                Ok(entries) => {
                    info!("loaded {} replay history entries", entries.len());
                    entries
                }
                Err(e) => {
                    error!("error loading history: {}", e);
                    Vec::new()
                }
            },
            Err(_) => {
                info!("no history file found, starting with empty history");
                Vec::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, entries: &[HistoryEntry]) {
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    error!("error saving history: {}", e);
                } else {
                    debug!("saved {} replay history entries", entries.len());
                }
            }
            Err(e) => error!("error serializing history: {}", e),
        }
    }
}

impl HistorySink for JsonHistory {
    fn on_state_change(&self, update: &HistoryUpdate) {
        let mut entries = self.entries.lock().unwrap();
        let now: DateTime<Utc> = Utc::now();
        let replay_id: String = update.replay_id.to_string();

        match entries.iter_mut().find(|e: &&mut HistoryEntry| e.replay_id == replay_id) {
            Some(entry) => {
                entry.status = update.status.to_string();
                entry.updated_at = now;
                if update.packets_sent.is_some() {
                    entry.packets_sent = update.packets_sent;
                }
                if update.error_message.is_some() {
                    entry.error_message = update.error_message.clone();
                }
            }
            None => {
                entries.insert(
                    0,
                    HistoryEntry {
                        replay_id,
                        status: update.status.to_string(),
                        started_at: now,
                        updated_at: now,
                        packets_sent: update.packets_sent,
                        error_message: update.error_message.clone(),
                    },
                );
                entries.truncate(MAX_ENTRIES);
            }
        }

        self.save(&entries);
    }
}
