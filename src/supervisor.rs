//! Supervision of the Tor proxy and full node pair
//!
//! A [`Supervisor`] is an actor task that owns every spawned child and the
//! lifecycle state. Hosts talk to it through a cloneable [`SupervisorHandle`];
//! exit-waiter and drain tasks report back over internal channels. All state
//! transitions happen on the actor task, one at a time, so a start request
//! racing a child's death can never produce two teardowns.
//!
//! Lifecycle:
//!
//! ```text
//! Idle --start--> Starting --both spawned--> Running --stop / child exit--> Stopping --> Idle
//!                    \--spawn or readiness failure (rollback)--> Idle
//! ```

use crate::config::{LaunchPlan, SupervisorConfig, SupervisorOptions};
use crate::drain::{self, DrainReport, StreamKind};
use crate::error::StartError;
use crate::notifier::{LifecycleEvent, LifecycleNotifier, StopReason};
use crate::process::{ChildName, ChildProcess, ChildSpec, ChildStatus};
use crate::readiness::ReadinessProbe;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the supervised pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Result of a start request that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The pair was already starting or running; nothing was done
    AlreadyActive,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Nothing was running; nothing was done
    AlreadyIdle,
}

/// A supervised child as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSnapshot {
    pub name: ChildName,
    pub pid: u32,
    pub status: ChildStatus,
}

/// Requests sent from handles to the supervisor task
enum Command {
    Start {
        plan: LaunchPlan,
        reply: oneshot::Sender<Result<StartOutcome, StartError>>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
    Children {
        reply: oneshot::Sender<Vec<ChildSnapshot>>,
    },
}

/// A child exited without being asked to
#[derive(Debug)]
struct ExitNotice {
    generation: u64,
    child: ChildName,
    code: Option<i32>,
}

/// Handle for communicating with the supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SupervisorState>,
}

impl SupervisorHandle {
    /// Spawn Tor, then the node, as described by `config`
    pub async fn start(&self, config: &SupervisorConfig) -> Result<StartOutcome, StartError> {
        self.start_plan(config.launch_plan()).await
    }

    /// Spawn the children of an explicit launch plan
    pub async fn start_plan(&self, plan: LaunchPlan) -> Result<StartOutcome, StartError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start { plan, reply })
            .map_err(|_| StartError::SupervisorGone)?;
        rx.await.map_err(|_| StartError::SupervisorGone)?
    }

    /// Terminate both children. Never fails; a gone supervisor has
    /// already stopped its children.
    pub async fn stop(&self) -> StopOutcome {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stop { reply }).is_err() {
            return StopOutcome::AlreadyIdle;
        }
        rx.await.unwrap_or(StopOutcome::AlreadyIdle)
    }

    /// Currently supervised children
    pub async fn children(&self) -> Vec<ChildSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Children { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn state_changes(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }
}

/// One spawned child and the tasks attached to it
struct SupervisedChild {
    name: ChildName,
    pid: u32,
    status: watch::Receiver<ChildStatus>,
    cancel: CancellationToken,
    waiter: JoinHandle<()>,
    drains: Vec<(StreamKind, JoinHandle<()>)>,
}

/// Supervisor that starts, watches and stops the Tor + node pair
pub struct Supervisor {
    notifier: Arc<dyn LifecycleNotifier>,
    options: SupervisorOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    exits_tx: mpsc::UnboundedSender<ExitNotice>,
    exits: mpsc::UnboundedReceiver<ExitNotice>,
    reports_tx: mpsc::UnboundedSender<DrainReport>,
    reports: mpsc::UnboundedReceiver<DrainReport>,
    state: watch::Sender<SupervisorState>,
    generation: u64,
    children: Vec<SupervisedChild>,
    /// Children that were signalled and are still being reaped
    reaping: JoinSet<()>,
    /// Stop requests that arrived while a start was in progress
    pending_stops: Vec<oneshot::Sender<StopOutcome>>,
    /// Snapshot requests that arrived while a start was in progress
    pending_queries: Vec<oneshot::Sender<Vec<ChildSnapshot>>>,
}

impl Supervisor {
    /// Create a new supervisor with default options
    pub fn new(notifier: Arc<dyn LifecycleNotifier>) -> (Self, SupervisorHandle) {
        Self::with_options(notifier, SupervisorOptions::default())
    }

    pub fn with_options(
        notifier: Arc<dyn LifecycleNotifier>,
        options: SupervisorOptions,
    ) -> (Self, SupervisorHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SupervisorState::Idle);

        let supervisor = Self {
            notifier,
            options,
            commands,
            exits_tx,
            exits,
            reports_tx,
            reports,
            state,
            generation: 0,
            children: Vec::new(),
            reaping: JoinSet::new(),
            pending_stops: Vec::new(),
            pending_queries: Vec::new(),
        };

        let handle = SupervisorHandle {
            tx,
            state: state_rx,
        };

        (supervisor, handle)
    }

    /// Create a supervisor and run it on the current runtime
    pub fn spawn(notifier: Arc<dyn LifecycleNotifier>, options: SupervisorOptions) -> SupervisorHandle {
        let (supervisor, handle) = Self::with_options(notifier, options);
        tokio::spawn(supervisor.run());
        handle
    }

    /// Run the supervisor event loop until every handle is dropped
    pub async fn run(mut self) {
        info!("Supervisor started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(notice) = self.exits.recv() => self.handle_exit(notice),
                Some(report) = self.reports.recv() => self.handle_report(report),
                Some(reaped) = self.reaping.join_next() => {
                    if let Err(e) = reaped {
                        error!("Reaper task failed: {}", e);
                    }
                }
            }
        }

        if self.current_state() != SupervisorState::Idle {
            self.stop(StopReason::HostShutdown);
        }

        // Children must not outlive the supervisor
        while let Some(reaped) = self.reaping.join_next().await {
            if let Err(e) = reaped {
                error!("Reaper task failed: {}", e);
            }
        }
        while let Ok(report) = self.reports.try_recv() {
            self.handle_report(report);
        }

        info!("Supervisor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { plan, reply } => {
                let result = self.start(plan).await;
                let _ = reply.send(result);

                for reply in self.pending_stops.drain(..) {
                    let _ = reply.send(StopOutcome::Stopped);
                }
                let snapshot = self.snapshot();
                for reply in self.pending_queries.drain(..) {
                    let _ = reply.send(snapshot.clone());
                }
            }
            Command::Stop { reply } => {
                let outcome = self.stop(StopReason::Requested);
                let _ = reply.send(outcome);
            }
            Command::Children { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn start(&mut self, plan: LaunchPlan) -> Result<StartOutcome, StartError> {
        if self.current_state() != SupervisorState::Idle {
            debug!("Ignoring start request: pair is {:?}", self.current_state());
            return Ok(StartOutcome::AlreadyActive);
        }

        self.generation += 1;
        self.set_state(SupervisorState::Starting);
        info!(
            "Starting {} then {} (generation {})",
            plan.proxy.name, plan.node.name, self.generation
        );

        match self.launch(&plan).await {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                info!("✓ {} and {} are running", plan.proxy.name, plan.node.name);
                self.notifier.notify(LifecycleEvent::Started {
                    version_label: plan.version_label,
                });
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                error!("✗ Start failed: {}", e);
                self.teardown();
                self.set_state(SupervisorState::Idle);

                if let Some(step) = e.step() {
                    self.notifier.notify(LifecycleEvent::StartFailed {
                        step,
                        cause: e.to_string(),
                    });
                }
                if !self.pending_stops.is_empty() {
                    self.notifier.notify(LifecycleEvent::Stopped {
                        reason: StopReason::Requested,
                    });
                }
                Err(e)
            }
        }
    }

    /// Spawn proxy, wait for it if a probe is configured, then spawn the node
    async fn launch(&mut self, plan: &LaunchPlan) -> Result<(), StartError> {
        let proxy_status = self.spawn_child(&plan.proxy)?;

        if let Some(probe) = &plan.readiness {
            self.await_ready(probe, plan.proxy.name, proxy_status).await?;
        }

        self.spawn_child(&plan.node)?;
        Ok(())
    }

    /// Spawn one child, attach its drains and its exit-waiter
    fn spawn_child(&mut self, spec: &ChildSpec) -> Result<watch::Receiver<ChildStatus>, StartError> {
        let mut process = ChildProcess::spawn(spec)?;
        let name = process.name();
        let pid = process.pid();

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = process.take_stdout() {
            let sink = drain::log_lines(name, StreamKind::Stdout);
            let task = drain::attach(stdout, name, StreamKind::Stdout, sink, Some(self.reports_tx.clone()));
            drains.push((StreamKind::Stdout, task));
        }
        if let Some(stderr) = process.take_stderr() {
            let sink = drain::log_lines(name, StreamKind::Stderr);
            let task = drain::attach(stderr, name, StreamKind::Stderr, sink, Some(self.reports_tx.clone()));
            drains.push((StreamKind::Stderr, task));
        }

        let cancel = CancellationToken::new();
        let (status_tx, status) = watch::channel(ChildStatus::Running);
        let waiter = tokio::spawn(watch_exit(
            process,
            self.generation,
            cancel.clone(),
            self.options.stop_grace,
            status_tx,
            self.exits_tx.clone(),
        ));

        self.children.push(SupervisedChild {
            name,
            pid,
            status: status.clone(),
            cancel,
            waiter,
            drains,
        });

        Ok(status)
    }

    /// Wait for the proxy to accept connections while still answering
    /// host requests
    async fn await_ready(
        &mut self,
        probe: &ReadinessProbe,
        step: ChildName,
        mut status: watch::Receiver<ChildStatus>,
    ) -> Result<(), StartError> {
        let ready = probe.wait_until_ready();
        tokio::pin!(ready);

        loop {
            tokio::select! {
                is_ready = &mut ready => {
                    return if is_ready {
                        Ok(())
                    } else {
                        Err(StartError::NotReady { step, timeout: probe.timeout })
                    };
                }
                changed = status.changed() => {
                    let current = *status.borrow();
                    match (changed, current) {
                        (_, ChildStatus::Exited(code)) => {
                            return Err(StartError::ExitedDuringStartup { step, code });
                        }
                        (Err(_), ChildStatus::Running) => {
                            return Err(StartError::ExitedDuringStartup { step, code: None });
                        }
                        (Ok(()), ChildStatus::Running) => {}
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Stop { reply }) => {
                        self.pending_stops.push(reply);
                        return Err(StartError::Aborted { step });
                    }
                    Some(Command::Start { reply, .. }) => {
                        debug!("Ignoring start request: pair is starting");
                        let _ = reply.send(Ok(StartOutcome::AlreadyActive));
                    }
                    Some(Command::Children { reply }) => {
                        self.pending_queries.push(reply);
                    }
                    None => return Err(StartError::Aborted { step }),
                },
            }
        }
    }

    fn stop(&mut self, reason: StopReason) -> StopOutcome {
        if self.current_state() == SupervisorState::Idle {
            debug!("Ignoring stop request: nothing is running");
            return StopOutcome::AlreadyIdle;
        }

        info!("Stopping children ({:?})...", reason);
        self.set_state(SupervisorState::Stopping);
        self.teardown();
        self.set_state(SupervisorState::Idle);
        info!("Children signalled, reaping in the background");

        self.notifier.notify(LifecycleEvent::Stopped { reason });
        StopOutcome::Stopped
    }

    /// Signal every child and hand its waiter and drains to the reaper set.
    /// Returns without waiting for any process to exit.
    fn teardown(&mut self) {
        for child in std::mem::take(&mut self.children) {
            debug!(child = %child.name, pid = child.pid, "Terminating child process");
            child.cancel.cancel();
            self.reaping.spawn(reap(
                child,
                self.options.drain_timeout,
                self.reports_tx.clone(),
            ));
        }
    }

    fn handle_exit(&mut self, notice: ExitNotice) {
        if notice.generation != self.generation || self.current_state() != SupervisorState::Running {
            debug!(child = %notice.child, "Ignoring exit of a child that is no longer supervised");
            return;
        }

        warn!(
            child = %notice.child,
            "Child exited unexpectedly (code {:?}), stopping the pair",
            notice.code
        );
        self.stop(StopReason::ChildExited {
            child: notice.child,
            code: notice.code,
        });
    }

    fn handle_report(&self, report: DrainReport) {
        debug!(
            child = %report.child,
            stream = %report.stream,
            lines_read = report.lines_read,
            "Output stream closed"
        );
        if let Some(cause) = &report.read_error {
            warn!(child = %report.child, stream = %report.stream, "Output not fully read: {}", cause);
        }
        if !report.lines.is_empty() {
            warn!(
                child = %report.child,
                stream = %report.stream,
                "Process output ended with:\n{}",
                report.lines.join("\n")
            );
        }

        self.notifier.notify(LifecycleEvent::ErrorDigest {
            child: report.child,
            stream: report.stream,
            lines: report.lines,
            read_error: report.read_error,
        });
    }

    fn snapshot(&self) -> Vec<ChildSnapshot> {
        self.children
            .iter()
            .map(|child| ChildSnapshot {
                name: child.name,
                pid: child.pid,
                status: *child.status.borrow(),
            })
            .collect()
    }

    fn current_state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        debug!("Supervisor state: {:?} -> {:?}", previous, state);
    }
}

/// Own `process` until it exits. A natural exit is reported to the
/// supervisor; a cancelled one is terminated, reaped, and not reported.
async fn watch_exit(
    mut process: ChildProcess,
    generation: u64,
    cancel: CancellationToken,
    grace: Duration,
    status: watch::Sender<ChildStatus>,
    exits: mpsc::UnboundedSender<ExitNotice>,
) {
    let name = process.name();
    let pid = process.pid();

    let natural = tokio::select! {
        result = process.wait_for_exit() => Some(result),
        _ = cancel.cancelled() => None,
    };

    let requested = natural.is_none();
    let result = match natural {
        Some(result) => result,
        None => terminate_and_reap(&mut process, grace).await,
    };

    let code = match result {
        Ok(exit) => {
            info!(child = %name, pid, "Child process finished - {}", exit);
            exit.code()
        }
        Err(e) => {
            error!(child = %name, pid, "Failed to wait for child process: {}", e);
            None
        }
    };

    status.send_replace(ChildStatus::Exited(code));

    if !requested {
        // Receiver gone means the supervisor itself is gone
        let _ = exits.send(ExitNotice {
            generation,
            child: name,
            code,
        });
    }
}

async fn terminate_and_reap(process: &mut ChildProcess, grace: Duration) -> io::Result<ExitStatus> {
    process.terminate();

    match timeout(grace, process.wait_for_exit()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                child = %process.name(),
                pid = process.pid(),
                "Child did not exit within {:?}, killing",
                grace
            );
            process.kill().await?;
            process.wait_for_exit().await
        }
    }
}

/// Wait for a signalled child to be reaped, then give its drains
/// `drain_timeout` to see end-of-stream. A drain still blocked after that
/// (a grandchild holding the pipe) is aborted and reported as abandoned.
async fn reap(child: SupervisedChild, drain_timeout: Duration, reports: mpsc::UnboundedSender<DrainReport>) {
    if let Err(e) = child.waiter.await {
        error!(child = %child.name, "Exit waiter failed: {}", e);
    }

    for (stream, mut drain) in child.drains {
        if timeout(drain_timeout, &mut drain).await.is_ok() {
            continue;
        }

        warn!(child = %child.name, %stream, "Output still open after exit, abandoning drain");
        drain.abort();
        // A drain that finished between the timeout and the abort already reported
        if let Err(e) = drain.await {
            if e.is_cancelled() {
                let _ = reports.send(DrainReport::abandoned(child.name, stream));
            }
        }
    }
}
