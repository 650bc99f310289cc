//! Simulation process lifecycle manager.
//!
//! State machine: `Idle -> start -> Running -> exit | spawn failure -> Idle`.
//! The session slot is only written here; `start` while running is a
//! conflict and never spawns a second process.
//!
//! The exit monitor task owns the `Child`. Signals are requested through
//! the session's control channel, so a pid is only ever signalled before
//! the monitor has reaped it.

use std::collections::BTreeMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use simrelay_core::config::EngineConfig;
use simrelay_core::{Channel, Event, LineDecoder};

use super::command;
use super::types::{Ack, ActiveSession, Control, SupervisorError};

/// How long the exit monitor waits for output readers after the process
/// has exited. Readers can outlive the child when a grandchild inherited
/// its pipes.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shutdown grace period used when stop escalation is disabled.
const SHUTDOWN_GRACE_FALLBACK: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8 * 1024;

type SessionSlot = Arc<RwLock<Option<ActiveSession>>>;

/// Supervisor owning the single simulation session.
pub struct Supervisor {
    engine: EngineConfig,
    events: mpsc::Sender<Event>,
    session: SessionSlot,
    /// Token of the running session, `0` while idle. Readers drop output
    /// that is not tagged with it.
    active_token: Arc<AtomicU64>,
    next_token: AtomicU64,
    /// `true` while the session slot is occupied.
    running: Arc<watch::Sender<bool>>,
}

impl Supervisor {
    /// Create a supervisor publishing into `events` (usually the hub's
    /// event forwarder).
    pub fn new(engine: EngineConfig, events: mpsc::Sender<Event>) -> Self {
        Self {
            engine,
            events,
            session: Arc::new(RwLock::new(None)),
            active_token: Arc::new(AtomicU64::new(0)),
            next_token: AtomicU64::new(1),
            running: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Whether a session is currently running.
    pub async fn is_running(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Target identifier of the running session.
    pub async fn current_target(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.target.clone())
    }

    /// Start a session for `target`.
    ///
    /// A spawn failure does not fail this call: it is reported as a
    /// `SystemError` event and the supervisor stays idle.
    pub async fn start(
        &self,
        target: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<Ack, SupervisorError> {
        command::validate(target, &parameters)?;

        let mut slot = self.session.write().await;
        if let Some(active) = slot.as_ref() {
            warn!(
                running = %active.target,
                requested = target,
                "Start rejected, a run is already in progress"
            );
            return Err(SupervisorError::Conflict {
                target: active.target.clone(),
            });
        }

        let mut merged = self.engine.default_parameters.clone();
        merged.extend(parameters);

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        info!(
            token,
            bearing = target,
            program = %self.engine.program.display(),
            args = ?command::invocation_args(&self.engine, target, &merged),
            "Spawning simulation process"
        );

        let ack = Ack::new(format!("Simulation for {target} started."));

        let mut child = match command::build_command(&self.engine, target, &merged).spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(slot);
                error!(token, bearing = target, error = %e, "Failed to spawn simulation process");
                self.emit(Event::system_error(format!(
                    "Failed to start {}: {e}",
                    self.engine.program.display()
                )))
                .await;
                return Ok(ack);
            }
        };
        debug!(token, pid = ?child.id(), "Simulation process spawned");

        self.active_token.store(token, Ordering::SeqCst);

        let readers = [
            child.stdout.take().map(|stdout| {
                self.spawn_reader(stdout, Channel::Stdout, token)
            }),
            child.stderr.take().map(|stderr| {
                self.spawn_reader(stderr, Channel::Stderr, token)
            }),
        ];

        let (control, control_rx) = mpsc::unbounded_channel();
        *slot = Some(ActiveSession {
            token,
            target: target.to_string(),
            started_at: Instant::now(),
            control,
            stop_requested: false,
            exited: false,
        });
        self.running.send_replace(true);
        drop(slot);

        tokio::spawn(monitor_exit(ExitMonitor {
            child,
            token,
            target: target.to_string(),
            readers,
            control_rx,
            session: Arc::clone(&self.session),
            active_token: Arc::clone(&self.active_token),
            running: Arc::clone(&self.running),
            events: self.events.clone(),
        }));

        Ok(ack)
    }

    /// Ask the running process to terminate.
    ///
    /// Returns immediately; the exit is reported later as a `SessionEnd`
    /// event. If the process is still running after the configured grace
    /// period it is killed.
    pub async fn stop(&self) -> Ack {
        let mut slot = self.session.write().await;
        let Some(active) = slot.as_mut() else {
            info!("Stop requested while idle");
            return Ack::new("No simulation in progress to stop.");
        };

        if active.exited {
            info!(token = active.token, bearing = %active.target, "Stop requested after exit, output still draining");
            return Ack::new("Simulation already exited, finishing.");
        }

        info!(token = active.token, bearing = %active.target, "Requesting simulation process interrupt");
        if active.control.send(Control::Interrupt).is_err() {
            warn!(token = active.token, "Exit monitor is gone, interrupt not delivered");
        }

        let timeout = Duration::from_secs(self.engine.terminate_timeout_secs);
        if !active.stop_requested && !timeout.is_zero() {
            tokio::spawn(escalate_after(
                Arc::clone(&self.session),
                active.token,
                timeout,
            ));
        }
        active.stop_requested = true;

        Ack::new("Stop command sent.")
    }

    /// Stop the running session and wait until it has ended.
    ///
    /// The process gets the stop escalation period plus the output drain
    /// bound to finish; after that it is killed. Returns `false` if the
    /// session still had not ended.
    pub async fn shutdown(&self) -> bool {
        let mut running = self.running.subscribe();
        if !*running.borrow() {
            return true;
        }

        let ack = self.stop().await;
        info!(message = %ack.message, "Stopping simulation for shutdown");

        let escalation = match self.engine.terminate_timeout_secs {
            0 => SHUTDOWN_GRACE_FALLBACK,
            secs => Duration::from_secs(secs),
        };
        if tokio::time::timeout(escalation + OUTPUT_DRAIN_TIMEOUT, running.wait_for(|r| !*r))
            .await
            .is_ok()
        {
            return true;
        }

        warn!(?escalation, "Simulation still running at shutdown, killing");
        if let Some(active) = self.session.read().await.as_ref() {
            let _ = active.control.send(Control::Kill);
        }
        tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT * 2, running.wait_for(|r| !*r))
            .await
            .is_ok()
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            warn!("Event forwarder closed, dropping event");
        }
    }

    fn spawn_reader<R>(&self, reader: R, channel: Channel, token: u64) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let decoder = LineDecoder::with_max_line_bytes(channel, self.engine.max_line_bytes);
        tokio::spawn(pump_output(
            reader,
            decoder,
            token,
            Arc::clone(&self.active_token),
            self.events.clone(),
        ))
    }
}

/// Read one output stream to EOF, forwarding decoded events.
async fn pump_output<R>(
    mut reader: R,
    mut decoder: LineDecoder,
    token: u64,
    active_token: Arc<AtomicU64>,
    events: mpsc::Sender<Event>,
) where
    R: AsyncRead + Unpin,
{
    let channel = decoder.channel();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(token, %channel, error = %e, "Failed to read process output");
                break;
            }
        };
        for event in decoder.push(&buf[..n]) {
            if !forward(&events, &active_token, token, channel, event).await {
                return;
            }
        }
    }

    if let Some(event) = decoder.finish() {
        forward(&events, &active_token, token, channel, event).await;
    }
    debug!(token, %channel, "Output reader finished");
}

async fn forward(
    events: &mpsc::Sender<Event>,
    active_token: &AtomicU64,
    token: u64,
    channel: Channel,
    event: Event,
) -> bool {
    if active_token.load(Ordering::SeqCst) != token {
        debug!(token, %channel, "Dropping output from inactive session");
        return true;
    }
    if channel == Channel::Stderr
        && let Event::Log { message, .. } = &event
    {
        debug!(token, "stderr: {}", message);
    }
    if events.send(event).await.is_err() {
        warn!(token, %channel, "Event forwarder closed");
        return false;
    }
    true
}

struct ExitMonitor {
    child: Child,
    token: u64,
    target: String,
    readers: [Option<JoinHandle<()>>; 2],
    control_rx: mpsc::UnboundedReceiver<Control>,
    session: SessionSlot,
    active_token: Arc<AtomicU64>,
    running: Arc<watch::Sender<bool>>,
    events: mpsc::Sender<Event>,
}

/// Wait for the process to exit, then report `SessionEnd` and go idle.
async fn monitor_exit(monitor: ExitMonitor) {
    let ExitMonitor {
        mut child,
        token,
        target,
        readers,
        mut control_rx,
        session,
        active_token,
        running,
        events,
    } = monitor;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control_rx.recv() => match request {
                Control::Interrupt => {
                    if !send_interrupt(&child, token) {
                        break kill_and_wait(&mut child, token, &target).await;
                    }
                }
                Control::Kill => break kill_and_wait(&mut child, token, &target).await,
            },
        }
    };
    drop(control_rx);

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(token, error = %e, "Error waiting for simulation process");
            None
        }
    };

    {
        let mut slot = session.write().await;
        if let Some(active) = slot.as_mut()
            && active.token == token
        {
            active.exited = true;
        }
    }

    for reader in readers.into_iter().flatten() {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            warn!(token, "Output still open after exit, abandoning reader");
            abort.abort();
        }
    }

    // Emit and clear under one guard so a start issued after a client has
    // seen `SessionEnd` always finds the slot empty.
    let mut slot = session.write().await;
    match slot.as_ref() {
        Some(active) if active.token == token => {
            info!(
                token,
                bearing = %target,
                code = ?code,
                elapsed = ?active.started_at.elapsed(),
                "Simulation process exited"
            );
            if events.send(Event::session_end(&target, code)).await.is_err() {
                warn!(token, "Event forwarder closed, dropping session end");
            }
            *slot = None;
            active_token.store(0, Ordering::SeqCst);
            running.send_replace(false);
        }
        _ => warn!(token, "Ignoring exit of a session that is no longer active"),
    }
}

async fn kill_and_wait(child: &mut Child, token: u64, target: &str) -> std::io::Result<ExitStatus> {
    warn!(token, bearing = target, "Killing simulation process");
    if let Err(e) = child.kill().await {
        warn!(token, error = %e, "Failed to kill simulation process");
    }
    child.wait().await
}

/// Kill the session identified by `token` if it is still running once
/// `timeout` has elapsed.
async fn escalate_after(session: SessionSlot, token: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let slot = session.read().await;
    if let Some(active) = slot.as_ref()
        && active.token == token
        && !active.exited
    {
        warn!(token, ?timeout, "Timeout waiting for graceful shutdown, killing");
        let _ = active.control.send(Control::Kill);
    }
}

/// Send SIGINT to the child. Returns `false` if no graceful request could
/// be delivered.
#[cfg(unix)]
fn send_interrupt(child: &Child, token: u64) -> bool {
    // `id()` is `None` once the child has been reaped.
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: kill(2) reads no memory of ours. Only the exit monitor polls
    // `child`, and it has not reaped it, so the pid still names our child.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGINT) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(token, pid, error = %err, "Failed to send SIGINT");
        return false;
    }
    true
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child, _token: u64) -> bool {
    false
}
