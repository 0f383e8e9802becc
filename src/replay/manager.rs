//! Replay process supervisor
//!
//! Owns the single active replay: spawns the external utility, follows
//! its output from a background task, enforces start/stop semantics,
//! and restarts the utility in continuous mode. All session state is
//! guarded by one exclusion lock held only for read-modify-write
//! sections, never across child-process I/O.

use crate::replay::command::{self, ReplayLimits};
use crate::replay::parser::{estimate_progress, OutputParser, ProgressSample};
use crate::replay::{
    HistorySink, HistoryUpdate, ProgressSubscriber, ProgressUpdate, ReplayError, ReplayRequest,
    ReplaySession, ReplayStatus,
};
use chrono::Utc;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Grace period between the termination signal and a forced kill
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Minimum interval between progress pushes to subscribers
const PROGRESS_THROTTLE: Duration = Duration::from_secs(2);
/// Pause between continuous-mode loops
const LOOP_RESTART_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SupervisorState {
    /// The live or most recently finished session
    session: Option<ReplaySession>,
    /// Single-flight flag; covers both `starting` and `running`
    running: bool,
    stop_requested: bool,
    child_pid: Option<u32>,
}

struct Inner {
    utility: String,
    limits: ReplayLimits,
    state: Mutex<SupervisorState>,
    subscribers: Mutex<Vec<Arc<dyn ProgressSubscriber>>>,
    history: Mutex<Vec<Arc<dyn HistorySink>>>,
}

/// Supervisor for the external replay utility.
///
/// Cheap to clone via its internal `Arc`; all methods take `&self`.
pub struct ReplayManager {
    inner: Arc<Inner>,
}

impl ReplayManager {
    /// Create a supervisor driving the given utility binary
    pub fn new(utility: impl Into<String>, limits: ReplayLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                utility: utility.into(),
                limits,
                state: Mutex::new(SupervisorState::default()),
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a progress subscriber
    pub fn add_subscriber(&self, subscriber: Arc<dyn ProgressSubscriber>) {
        self.inner.subscribers.lock().unwrap().push(subscriber);
    }

    /// Register a history collaborator
    pub fn add_history_sink(&self, sink: Arc<dyn HistorySink>) {
        self.inner.history.lock().unwrap().push(sink);
    }

    /// Start a replay.
    ///
    /// Fails with [`ReplayError::AlreadyRunning`] while a session is in
    /// a non-terminal state. Returns as soon as the child process is
    /// spawned; monitoring continues on a background task.
    pub async fn start(&self, request: ReplayRequest) -> Result<Uuid, ReplayError> {
        command::validate_request(&request, &self.inner.limits)?;
        for warning in crate::capture::validate_for_replay(&request.file)? {
            warn!("{}", warning);
        }

        let args: Vec<String> = command::build_args(&request);
        let id: Uuid = {
            // The running check and the first spawn share one critical
            // section so two concurrent starts cannot both pass.
            let mut state = self.inner.state.lock().unwrap();
            if state.running {
                return Err(ReplayError::AlreadyRunning);
            }

            let child: Child = spawn_child(&self.inner.utility, &args)?;
            let id: Uuid = Uuid::new_v4();
            state.running = true;
            state.stop_requested = false;
            state.child_pid = child.id();
            state.session = Some(ReplaySession::new(id, &request));

            let inner: Arc<Inner> = Arc::clone(&self.inner);
            let monitor_request: ReplayRequest = request.clone();
            tokio::spawn(async move {
                monitor(inner, monitor_request, id, child).await;
            });
            id
        };

        info!(
            "REPLAY_COMMAND: {} {}",
            self.inner.utility,
            args.join(" ")
        );
        info!(
            "started replay {} on {} at {} {}",
            id, request.interface, request.speed, request.speed_unit
        );
        Ok(id)
    }

    /// Stop the active replay.
    ///
    /// Returns `false` when nothing is running. Otherwise requests a
    /// cooperative stop, sends the child a termination signal, and
    /// escalates to a forced kill after the grace period.
    pub async fn stop(&self) -> bool {
        let pid: Option<u32> = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.running {
                return false;
            }
            state.stop_requested = true;
            state.child_pid
        };

        info!("STOP_COMMAND: terminating replay process");
        if let Some(pid) = pid {
            send_signal(pid, TermSignal::Term);
        }

        let deadline: Instant = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if !self.is_running() {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }

        // Re-read the pid: continuous mode may have respawned since the
        // signal went out.
        let survivor: Option<u32> = {
            let state = self.inner.state.lock().unwrap();
            if state.running {
                state.child_pid
            } else {
                None
            }
        };
        if let Some(pid) = survivor {
            warn!("replay process did not exit within grace period, forcing kill");
            send_signal(pid, TermSignal::Kill);
        }
        while self.is_running() {
            sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Whether a session is currently in a non-terminal state
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().running
    }

    /// Identifier of the live or most recent session
    pub fn current_replay_id(&self) -> Option<Uuid> {
        self.inner
            .state
            .lock()
            .unwrap()
            .session
            .as_ref()
            .map(|s: &ReplaySession| s.id)
    }

    /// Consistent point-in-time snapshot of the session
    pub fn status(&self) -> Option<ReplaySession> {
        self.inner.state.lock().unwrap().session.clone()
    }
}

impl Clone for ReplayManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn spawn_child(utility: &str, args: &[String]) -> Result<Child, ReplayError> {
    Command::new(utility)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e: std::io::Error| ReplayError::ProcessSpawnFailure {
            utility: utility.to_string(),
            source: e,
        })
}

enum TermSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TermSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal: Signal = match signal {
        TermSignal::Term => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!("signal delivery to {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: TermSignal) {}

/// Follows one session from first spawn to its terminal state.
async fn monitor(inner: Arc<Inner>, request: ReplayRequest, id: Uuid, mut child: Child) {
    let parser: OutputParser = OutputParser::new();
    let mut terminal_override: Option<ReplayStatus> = None;

    {
        let mut state = inner.state.lock().unwrap();
        if let Some(session) = state.session.as_mut() {
            session.status = ReplayStatus::Running;
        }
    }
    if let Some(snapshot) = snapshot_session(&inner) {
        notify_status(&inner, &snapshot);
    }
    if request.continuous {
        info!("starting continuous replay mode for {}", id);
    }

    loop {
        let loop_count: u64 = {
            let mut state = inner.state.lock().unwrap();
            match state.session.as_mut() {
                Some(session) => {
                    session.loop_count += 1;
                    session.loop_count
                }
                None => 0,
            }
        };
        if request.continuous && loop_count > 1 {
            info!("starting loop #{} for continuous replay {}", loop_count, id);
        }

        let iteration_start: Instant = Instant::now();
        let mut last_emit: Option<Instant> = None;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text: String = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stop_requested(&inner) {
                    break;
                }
                let line: &str = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.contains("Actual:") || line.contains("Error") || line.contains("Failed") {
                    info!("replay output: {}", line);
                } else {
                    debug!("replay output: {}", line);
                }

                let sample: Option<ProgressSample> = parser.parse_line(line);
                let elapsed: f64 = iteration_start.elapsed().as_secs_f64();
                let update: Option<ProgressUpdate> = {
                    let mut state = inner.state.lock().unwrap();
                    match state.session.as_mut() {
                        Some(session) => {
                            apply_output(session, sample, elapsed);
                            let due: bool = last_emit
                                .map_or(true, |t: Instant| t.elapsed() >= PROGRESS_THROTTLE);
                            if due {
                                Some(progress_update(session))
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };
                if let Some(update) = update {
                    last_emit = Some(Instant::now());
                    notify_progress(&inner, &update);
                }
            }
        }

        // stop() guarantees the child terminates, so this wait cannot
        // hang on a stop request observed mid-stream.
        let exit = child.wait().await;
        let stderr_text: String = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match exit {
            Err(e) => {
                error!("failed waiting for replay process: {}", e);
                set_session_error(&inner, format!("failed waiting for replay process: {}", e));
                terminal_override = Some(ReplayStatus::Error);
                break;
            }
            Ok(status) => {
                if !status.success() {
                    if stop_requested(&inner) {
                        // The operator stopped the replay; a
                        // signal-induced exit code is expected here.
                        break;
                    }
                    let mut message: String = match status.code() {
                        Some(code) => format!("{} exited with code {}", inner.utility, code),
                        None => format!("{} terminated by signal", inner.utility),
                    };
                    let stderr_text: &str = stderr_text.trim();
                    if !stderr_text.is_empty() {
                        message.push_str(": ");
                        message.push_str(stderr_text);
                    }
                    error!("replay utility error: {}", message);
                    set_session_error(&inner, message);
                    break;
                }

                if !request.continuous || stop_requested(&inner) {
                    break;
                }

                // Zero exit in continuous mode: reset progress and
                // re-enter the starting state for another invocation.
                {
                    let mut state = inner.state.lock().unwrap();
                    if let Some(session) = state.session.as_mut() {
                        session.progress_percent = 0.0;
                        session.status = ReplayStatus::Starting;
                    }
                }
                sleep(LOOP_RESTART_DELAY).await;
                if stop_requested(&inner) {
                    break;
                }

                let args: Vec<String> = command::build_args(&request);
                match spawn_child(&inner.utility, &args) {
                    Ok(next) => {
                        let mut state = inner.state.lock().unwrap();
                        state.child_pid = next.id();
                        if let Some(session) = state.session.as_mut() {
                            session.status = ReplayStatus::Running;
                        }
                        child = next;
                    }
                    Err(e) => {
                        error!("failed to restart replay utility: {}", e);
                        set_session_error(&inner, e.to_string());
                        terminal_override = Some(ReplayStatus::Error);
                        break;
                    }
                }
            }
        }
    }

    finalize(&inner, id, request.continuous, terminal_override);
}

fn finalize(
    inner: &Arc<Inner>,
    id: Uuid,
    continuous: bool,
    terminal_override: Option<ReplayStatus>,
) {
    let snapshot: Option<ReplaySession> = {
        let mut state = inner.state.lock().unwrap();
        let stop_requested: bool = state.stop_requested;
        let snapshot: Option<ReplaySession> = state.session.as_mut().map(|session| {
            let status: ReplayStatus = if stop_requested {
                ReplayStatus::Stopped
            } else if let Some(status) = terminal_override {
                status
            } else if session.error.is_some() {
                ReplayStatus::Failed
            } else {
                session.progress_percent = 100.0;
                ReplayStatus::Completed
            };
            session.status = status;
            session.end_time = Some(Utc::now());
            session.clone()
        });
        state.running = false;
        state.child_pid = None;
        snapshot
    };

    if let Some(session) = snapshot {
        if continuous {
            info!(
                "continuous replay {} finished as {} after {} loops",
                id, session.status, session.loop_count
            );
        } else {
            info!("replay {} finished as {}", id, session.status);
        }
        notify_status(inner, &session);
    }
}

fn stop_requested(inner: &Arc<Inner>) -> bool {
    inner.state.lock().unwrap().stop_requested
}

fn snapshot_session(inner: &Arc<Inner>) -> Option<ReplaySession> {
    inner.state.lock().unwrap().session.clone()
}

fn set_session_error(inner: &Arc<Inner>, message: String) {
    let mut state = inner.state.lock().unwrap();
    if let Some(session) = state.session.as_mut() {
        session.error = Some(message);
    }
}

/// Fold one parsed output line into the session. All figures from a
/// summary line land in the same critical section.
fn apply_output(session: &mut ReplaySession, sample: Option<ProgressSample>, elapsed: f64) {
    session.elapsed_secs = elapsed;
    if let Some(sample) = sample {
        if sample.is_summary {
            if let Some(packets) = sample.packets_sent {
                session.packets_sent = packets;
            }
            if let Some(bytes) = sample.bytes_sent {
                session.bytes_sent = bytes;
            }
            if let Some(secs) = sample.elapsed_secs {
                session.elapsed_secs = secs;
            }
            session.progress_percent = 100.0;
        } else if let Some(pps) = sample.packets_per_second {
            session.packets_per_second = pps;
        }
    }
    if session.packets_sent == 0 {
        // No summary yet: wall-clock estimate, capped below complete.
        session.progress_percent = estimate_progress(elapsed);
    }
}

fn progress_update(session: &ReplaySession) -> ProgressUpdate {
    ProgressUpdate {
        replay_id: session.id,
        progress_percent: session.progress_percent,
        packets_sent: session.packets_sent,
        bytes_sent: session.bytes_sent,
        elapsed_secs: session.elapsed_secs,
        loop_count: session.loop_count,
        continuous: session.continuous,
    }
}

fn notify_progress(inner: &Arc<Inner>, update: &ProgressUpdate) {
    let subscribers: Vec<Arc<dyn ProgressSubscriber>> =
        inner.subscribers.lock().unwrap().clone();
    for subscriber in subscribers {
        subscriber.on_progress(update);
    }
}

fn notify_status(inner: &Arc<Inner>, session: &ReplaySession) {
    let subscribers: Vec<Arc<dyn ProgressSubscriber>> =
        inner.subscribers.lock().unwrap().clone();
    for subscriber in subscribers {
        subscriber.on_status(session);
    }

    let update = HistoryUpdate {
        replay_id: session.id,
        status: session.status,
        packets_sent: if session.packets_sent > 0 {
            Some(session.packets_sent)
        } else {
            None
        },
        error_message: session.error.clone(),
    };
    let sinks: Vec<Arc<dyn HistorySink>> = inner.history.lock().unwrap().clone();
    for sink in sinks {
        sink.on_state_change(&update);
    }
}
