//! Worker supervision loop.
//!
//! The daemon keeps exactly one worker alive at a time. Worker exits and
//! termination signals both arrive as [`Event`]s on a single channel, so every
//! decision is taken by one thread and shutdown runs exactly once.
use std::{
    path::Path,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use signal_hook::{
    consts::{SIGCHLD, SIGINT, SIGTERM},
    iterator::{Handle, Signals},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{DEFAULT_POLL_INTERVAL, RestartPolicy},
    error::DaemonError,
    launcher::{LaunchDescriptor, Launched},
    pidfile::PidFile,
    reporter::{ExitOutcome, LifecycleEvent, Reporter},
    role::Role,
};

/// Countdown of restarts still allowed.
///
/// A limit of `N` permits exactly `N` restarts, so a worker that keeps failing
/// is launched `N + 1` times. A limit of zero never runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBudget {
    limit: Option<u32>,
    used: u32,
}

impl RestartBudget {
    /// Creates a budget of `max_restart` restarts, `0` meaning unlimited.
    pub fn new(max_restart: u32) -> Self {
        Self {
            limit: (max_restart > 0).then_some(max_restart),
            used: 0,
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Configured limit, `None` when unlimited.
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Restarts consumed so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Consumes one restart, returning its one-based number, or `None` once
    /// the budget is exhausted.
    pub fn try_consume(&mut self) -> Option<u32> {
        if let Some(limit) = self.limit
            && self.used >= limit
        {
            return None;
        }
        self.used = self.used.saturating_add(1);
        Some(self.used)
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A termination signal arrived.
    Signal(i32),
    /// The worker kept failing until the budget ran out; carries its last outcome.
    RestartLimitReached(ExitOutcome),
    /// The worker exited successfully under [`RestartPolicy::OnFailure`].
    WorkerFinished,
    /// A worker could not be started.
    SpawnFailed,
    /// The pid file could not be maintained.
    RuntimeError,
}

impl ExitReason {
    /// Process exit code the daemon should end with.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Signal(_) | ExitReason::WorkerFinished => 0,
            ExitReason::RestartLimitReached(outcome) => match outcome.code() {
                code @ 0..=255 => code,
                _ => 1,
            },
            ExitReason::SpawnFailed | ExitReason::RuntimeError => 1,
        }
    }
}

/// Summary returned once the supervisor has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOutcome {
    /// Why supervision ended.
    pub reason: ExitReason,
    /// Restarts performed.
    pub restarts: u32,
    /// Exit code for the daemon process.
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    /// Stop supervising; carries the signal number.
    Terminate(i32),
    /// A child changed state; poll the worker now instead of at the next tick.
    ChildExited,
}

/// Requests shutdown of a running [`Supervisor`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Sender<Event>,
}

impl ShutdownHandle {
    /// Asks the supervisor to stop as if `signal` had been delivered.
    ///
    /// Returns `false` when the supervisor has already shut down.
    pub fn shutdown(&self, signal: i32) -> bool {
        self.tx.send(Event::Terminate(signal)).is_ok()
    }
}

struct SignalForwarder {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalForwarder {
    fn close(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            warn!("Signal forwarding thread panicked");
        }
    }
}

enum State {
    Starting,
    Running(Launched),
    Restarting(ExitOutcome),
    ShuttingDown(ExitReason),
}

/// Supervises a single worker until shutdown.
pub struct Supervisor {
    descriptor: LaunchDescriptor,
    reporter: Reporter,
    pid_file: Option<PidFile>,
    record_worker_pid: bool,
    budget: RestartBudget,
    policy: RestartPolicy,
    restart_delay: Duration,
    poll_interval: Duration,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    signals: Option<SignalForwarder>,
}

impl Supervisor {
    /// Creates a supervisor that launches `descriptor` in the worker role.
    pub fn new(descriptor: LaunchDescriptor, reporter: Reporter) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            descriptor,
            reporter,
            pid_file: None,
            record_worker_pid: false,
            budget: RestartBudget::unlimited(),
            policy: RestartPolicy::default(),
            restart_delay: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            events_tx,
            events_rx,
            signals: None,
        }
    }

    /// Hands over the pid file guard; it is released during shutdown.
    pub fn pid_file(mut self, pid_file: PidFile) -> Self {
        self.pid_file = Some(pid_file);
        self
    }

    /// Records the current worker pid as the second line of the pid file.
    pub fn record_worker_pid(mut self, enabled: bool) -> Self {
        self.record_worker_pid = enabled;
        self
    }

    /// Number of restarts allowed, `0` for unlimited.
    pub fn max_restart(mut self, max_restart: u32) -> Self {
        self.budget = RestartBudget::new(max_restart);
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Upper bound on how long a worker exit can go unnoticed.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Location of the pid file handed over with [`Supervisor::pid_file`].
    pub fn pid_file_path(&self) -> Option<&Path> {
        self.pid_file.as_ref().map(PidFile::path)
    }

    /// Handle that stops the supervisor as if a signal had been received.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Routes SIGINT and SIGTERM into shutdown and SIGCHLD into prompt exit
    /// detection. Handlers stay installed until [`Supervisor::run`] returns.
    pub fn install_signal_handlers(&mut self) -> Result<(), DaemonError> {
        if self.signals.is_some() {
            return Ok(());
        }

        let mut signals =
            Signals::new([SIGINT, SIGTERM, SIGCHLD]).map_err(DaemonError::Signals)?;
        let handle = signals.handle();
        let tx = self.events_tx.clone();

        let thread = thread::Builder::new()
            .name("respawn-signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    let event = if signal == SIGCHLD {
                        Event::ChildExited
                    } else {
                        Event::Terminate(signal)
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(DaemonError::Signals)?;

        self.signals = Some(SignalForwarder { handle, thread });
        debug!("Installed handlers for SIGINT, SIGTERM and SIGCHLD");
        Ok(())
    }

    /// Supervises workers until a signal, the restart budget, or a fatal error
    /// ends it, then shuts down. Consuming `self` keeps shutdown to a single run.
    pub fn run(mut self) -> SupervisorOutcome {
        let mut state = State::Starting;
        let reason = loop {
            state = match state {
                State::Starting => self.start_worker(),
                State::Running(worker) => self.watch(worker),
                State::Restarting(outcome) => self.restart(outcome),
                State::ShuttingDown(reason) => break reason,
            };
        };
        self.shut_down(reason)
    }

    fn start_worker(&mut self) -> State {
        let launched = self.descriptor.launch(
            Role::Worker,
            self.reporter.stdout(),
            self.reporter.stderr(),
        );
        let worker = match launched {
            Ok(worker) => worker,
            Err(err) => {
                error!("Failed to start worker: {err}");
                self.reporter.report(&LifecycleEvent::Error {
                    message: format!("Failed to start worker: {err}"),
                });
                return State::ShuttingDown(ExitReason::SpawnFailed);
            }
        };

        let pid = worker.pid();
        info!("Started worker with pid {pid}");
        self.reporter
            .report(&LifecycleEvent::WorkerStarted { pid });

        if let Err(reason) = self.record_worker(Some(pid)) {
            self.stop_worker(worker);
            return State::ShuttingDown(reason);
        }
        State::Running(worker)
    }

    /// Waits on whichever comes first: the worker exiting or a termination event.
    fn watch(&mut self, mut worker: Launched) -> State {
        let pid = worker.pid();
        loop {
            match worker.try_wait() {
                Ok(Some(status)) => {
                    worker.join_forwarders();
                    return self.on_worker_exit(pid, status);
                }
                Ok(None) => {}
                Err(err) => {
                    error!("Failed to poll worker {pid}: {err}");
                    self.reporter.report(&LifecycleEvent::Error {
                        message: format!("Wait worker({pid}) error: {err}"),
                    });
                    self.stop_worker(worker);
                    return State::ShuttingDown(ExitReason::RuntimeError);
                }
            }

            match self.events_rx.recv_timeout(self.poll_interval) {
                Ok(Event::Terminate(signal)) => {
                    self.on_signal(signal);
                    self.stop_worker(worker);
                    return State::ShuttingDown(ExitReason::Signal(signal));
                }
                Ok(Event::ChildExited) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(self.poll_interval),
            }
        }
    }

    fn on_worker_exit(&mut self, pid: u32, status: std::process::ExitStatus) -> State {
        let outcome = ExitOutcome::from_status(status);
        if outcome.success() {
            info!("Worker {pid} finished: {outcome}");
        } else {
            warn!("Worker {pid} failed: {outcome}");
        }
        self.reporter
            .report(&LifecycleEvent::WorkerExited { pid, outcome });

        if let Err(reason) = self.record_worker(None) {
            return State::ShuttingDown(reason);
        }

        if outcome.success() && self.policy == RestartPolicy::OnFailure {
            debug!("Worker finished cleanly; not restarting");
            return State::ShuttingDown(ExitReason::WorkerFinished);
        }
        State::Restarting(outcome)
    }

    fn restart(&mut self, last: ExitOutcome) -> State {
        let limit = self.budget.limit();
        let Some(attempt) = self.budget.try_consume() else {
            let limit = limit.unwrap_or_default();
            warn!("Restart limit of {limit} reached");
            self.reporter
                .report(&LifecycleEvent::RestartLimitReached { limit });
            return State::ShuttingDown(ExitReason::RestartLimitReached(last));
        };

        self.reporter.report(&LifecycleEvent::Restarting {
            attempt,
            limit,
            delay: self.restart_delay,
        });

        match self.pause(self.restart_delay) {
            Some(signal) => {
                self.on_signal(signal);
                State::ShuttingDown(ExitReason::Signal(signal))
            }
            None => State::Starting,
        }
    }

    /// Sleeps for `delay` unless a termination event arrives first. Pending
    /// events are always drained, even for a zero delay.
    fn pause(&self, delay: Duration) -> Option<i32> {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = if remaining.is_zero() {
                match self.events_rx.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
                }
            } else {
                match self.events_rx.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => return None,
                    Err(RecvTimeoutError::Disconnected) => {
                        thread::sleep(remaining);
                        return None;
                    }
                }
            };
            if let Event::Terminate(signal) = event {
                return Some(signal);
            }
        }
    }

    fn on_signal(&self, signal: i32) {
        info!("Received signal {signal}; shutting down");
        self.reporter
            .report(&LifecycleEvent::SignalReceived { signal });
    }

    /// Ends the worker for good. A worker that already exited is reported as
    /// such and never signalled.
    fn stop_worker(&self, mut worker: Launched) {
        let pid = worker.pid();

        if let Ok(Some(status)) = worker.try_wait() {
            worker.join_forwarders();
            let outcome = ExitOutcome::from_status(status);
            debug!("Worker {pid} had already exited with {outcome}");
            self.reporter
                .report(&LifecycleEvent::WorkerExited { pid, outcome });
            return;
        }

        if let Err(err) = worker.kill() {
            error!("Failed to kill worker {pid}: {err}");
            self.reporter.report(&LifecycleEvent::KillFailed {
                pid,
                error: err.to_string(),
            });
            return;
        }

        match worker.wait() {
            Ok(status) => {
                let outcome = ExitOutcome::from_status(status);
                info!("Worker {pid} terminated: {outcome}");
                self.reporter
                    .report(&LifecycleEvent::WorkerKilled { pid, outcome });
            }
            Err(err) => {
                error!("Failed to reap worker {pid}: {err}");
                self.reporter.report(&LifecycleEvent::KillFailed {
                    pid,
                    error: err.to_string(),
                });
            }
        }
    }

    fn record_worker(&mut self, pid: Option<u32>) -> Result<(), ExitReason> {
        if !self.record_worker_pid {
            return Ok(());
        }
        let Some(pid_file) = self.pid_file.as_mut() else {
            return Ok(());
        };
        pid_file.record_worker(pid).map_err(|err| {
            error!("{err}");
            self.reporter.report(&LifecycleEvent::Error {
                message: err.to_string(),
            });
            ExitReason::RuntimeError
        })
    }

    fn shut_down(mut self, reason: ExitReason) -> SupervisorOutcome {
        if let Some(signals) = self.signals.take() {
            signals.close();
        }

        info!("Supervisor exiting: {reason:?}");
        self.reporter.report(&LifecycleEvent::DaemonExited);

        let mut exit_code = reason.exit_code();
        if let Some(mut pid_file) = self.pid_file.take()
            && let Err(err) = pid_file.release()
        {
            error!("{err}");
            self.reporter.report(&LifecycleEvent::Error {
                message: err.to_string(),
            });
            exit_code = 1;
        }

        SupervisorOutcome {
            reason,
            restarts: self.budget.used(),
            exit_code,
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(signals) = self.signals.take() {
            signals.close();
        }
    }
}
