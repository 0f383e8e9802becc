//! Replay module for caprel
//!
//! This module drives the external tcpreplay utility: the session
//! model, invocation building, progress output parsing, and the
//! process supervisor that owns the single active replay.

pub mod command;
pub mod manager;
pub mod parser;

pub use manager::ReplayManager;

use crate::capture::CaptureError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("a replay is already in progress")]
    AlreadyRunning,

    #[error("invalid replay configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn {utility}: {source}")]
    ProcessSpawnFailure {
        utility: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Lifecycle states of a replay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    /// Invocation built, child process being launched
    Starting,
    /// Child process alive and sending packets
    Running,
    /// Child exited zero in non-continuous mode
    Completed,
    /// Stopped on operator request
    Stopped,
    /// Child exited non-zero
    Failed,
    /// Supervisor-side failure while monitoring
    Error,
}

impl ReplayStatus {
    /// True for states no further transition leaves
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplayStatus::Starting | ReplayStatus::Running)
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayStatus::Starting => write!(f, "starting"),
            ReplayStatus::Running => write!(f, "running"),
            ReplayStatus::Completed => write!(f, "completed"),
            ReplayStatus::Stopped => write!(f, "stopped"),
            ReplayStatus::Failed => write!(f, "failed"),
            ReplayStatus::Error => write!(f, "error"),
        }
    }
}

/// How the replay speed value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedUnit {
    /// Multiplier over the capture's original timing
    Multiplier,
    /// Fixed packets-per-second rate
    Pps,
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedUnit::Multiplier => write!(f, "multiplier"),
            SpeedUnit::Pps => write!(f, "pps"),
        }
    }
}

impl TryFrom<&str> for SpeedUnit {
    type Error = ReplayError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "multiplier" => Ok(SpeedUnit::Multiplier),
            "pps" => Ok(SpeedUnit::Pps),
            _ => Err(ReplayError::InvalidConfig(format!(
                "invalid speed unit: {} (must be 'multiplier' or 'pps')",
                s
            ))),
        }
    }
}

/// Parameters for one replay
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub file: PathBuf,
    pub interface: String,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    /// Restart the utility on successful completion until stopped
    pub continuous: bool,
}

/// The single live (or most recently finished) replay.
///
/// Mutated only by the supervisor under its exclusion lock; `status()`
/// hands out clones taken under that same lock.
#[derive(Debug, Clone)]
pub struct ReplaySession {
    pub id: Uuid,
    pub file: PathBuf,
    pub interface: String,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    pub continuous: bool,
    pub status: ReplayStatus,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_per_second: f64,
    pub progress_percent: f64,
    pub elapsed_secs: f64,
    pub loop_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ReplaySession {
    /// Create a fresh session entering the `starting` state
    pub fn new(id: Uuid, request: &ReplayRequest) -> Self {
        Self {
            id,
            file: request.file.clone(),
            interface: request.interface.clone(),
            speed: request.speed,
            speed_unit: request.speed_unit,
            continuous: request.continuous,
            status: ReplayStatus::Starting,
            packets_sent: 0,
            bytes_sent: 0,
            packets_per_second: 0.0,
            progress_percent: 0.0,
            elapsed_secs: 0.0,
            loop_count: 0,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }
}

/// Throttled progress notification pushed to subscribers
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub replay_id: Uuid,
    pub progress_percent: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub elapsed_secs: f64,
    pub loop_count: u64,
    pub continuous: bool,
}

/// Receives throttled progress updates and terminal status snapshots.
///
/// Transport-agnostic: the supervisor never knows where updates go.
pub trait ProgressSubscriber: Send + Sync {
    /// Called at most once per throttle window while a replay runs
    fn on_progress(&self, update: &ProgressUpdate);

    /// Called on session state changes with a full snapshot
    fn on_status(&self, session: &ReplaySession);
}

/// State-change notification handed to the history collaborator
#[derive(Debug, Clone)]
pub struct HistoryUpdate {
    pub replay_id: Uuid,
    pub status: ReplayStatus,
    pub packets_sent: Option<u64>,
    pub error_message: Option<String>,
}

/// Owns replay history persistence; never read back by the supervisor.
pub trait HistorySink: Send + Sync {
    fn on_state_change(&self, update: &HistoryUpdate);
}
