// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServiceSpec;
use crate::env::service_overlay;
use crate::error::{Condition, Error, Result};
use crate::lines::LineBuffer;
use crate::lock;
use crate::logs::service_target;
use crate::state::{ServicePhase, ServiceState, epoch_millis};
use log::{Level, error, info, log, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::{Duration, sleep, timeout};

/// Pause after a successful spawn before `start` reports the pid.
pub const SETTLE_DELAY: Duration = Duration::from_millis(1500);
/// How long `stop` and `kill` wait for the child to go away.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyStarted,
    /// Disabled, or a stop was requested before the spawn happened.
    Skipped,
}

impl StartOutcome {
    pub fn pid(self) -> Option<u32> {
        match self {
            StartOutcome::Started { pid } => Some(pid),
            _ => None,
        }
    }
}

type StartLatch = Arc<OnceCell<Result<StartOutcome>>>;

struct Runtime {
    phase: ServicePhase,
    state: ServiceState,
}

impl Runtime {
    fn transition(&mut self, name: &str, next: ServicePhase) {
        if !self.phase.can_transition_to(next) {
            warn!("[{name}] unexpected transition {} -> {next}", self.phase);
        }
        self.phase = next;
    }
}

struct Inner {
    name: String,
    home: PathBuf,
    spec: Mutex<ServiceSpec>,
    runtime: Mutex<Runtime>,
    want_stop: AtomicBool,
    starting: Mutex<Option<StartLatch>>,
    settle: Duration,
}

/// Supervises one service: spawns it, watches its exit, restarts it per its
/// policy. Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct ServiceSupervisor {
    inner: Arc<Inner>,
}

impl ServiceSupervisor {
    /// `home` is the manager home directory, against which the service's paths resolve.
    pub fn new(home: &Path, spec: ServiceSpec) -> Self {
        Self::with_settle_delay(home, spec, SETTLE_DELAY)
    }

    pub(crate) fn with_settle_delay(home: &Path, spec: ServiceSpec, settle: Duration) -> Self {
        let state = ServiceState {
            disabled: spec.disabled,
            ..ServiceState::default()
        };
        Self {
            inner: Arc::new(Inner {
                name: spec.name.clone(),
                home: home.to_path_buf(),
                spec: Mutex::new(spec),
                runtime: Mutex::new(Runtime {
                    phase: ServicePhase::Stopped,
                    state,
                }),
                want_stop: AtomicBool::new(false),
                starting: Mutex::new(None),
                settle,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn spec(&self) -> ServiceSpec {
        lock(&self.inner.spec).clone()
    }

    pub fn state(&self) -> ServiceState {
        lock(&self.inner.runtime).state.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.runtime).state.started
    }

    /// Start the service unless it already runs.
    pub async fn start(&self) -> Result<StartOutcome> {
        self.inner.want_stop.store(false, Ordering::SeqCst);

        if self.is_running() {
            info!("[{}] already started", self.name());
            return Ok(StartOutcome::AlreadyStarted);
        }

        lock(&self.inner.runtime).state.restarts = 0;
        let outcome = self.start_after(Duration::ZERO).await?;
        if let StartOutcome::Started { .. } = outcome {
            sleep(self.inner.settle).await;
        }
        Ok(outcome)
    }

    /// Spawn after `delay`, or join the attempt already in flight.
    async fn start_after(&self, delay: Duration) -> Result<StartOutcome> {
        let latch = {
            let mut starting = lock(&self.inner.starting);
            match starting.as_ref() {
                Some(latch) => {
                    info!("[{}] start called while already starting, joining", self.name());
                    latch.clone()
                }
                None => {
                    let latch: StartLatch = Arc::new(OnceCell::new());
                    *starting = Some(latch.clone());
                    latch
                }
            }
        };

        let outcome = latch
            .get_or_init(|| async {
                sleep(delay).await;
                self.spawn()
            })
            .await
            .clone();

        let mut starting = lock(&self.inner.starting);
        if starting.as_ref().is_some_and(|current| Arc::ptr_eq(current, &latch)) {
            *starting = None;
        }
        outcome
    }

    fn spawn(&self) -> Result<StartOutcome> {
        let name = self.name();
        let spec = self.spec();

        if spec.disabled {
            info!("[{name}] disabled, not starting");
            return Ok(StartOutcome::Skipped);
        }
        if self.inner.want_stop.load(Ordering::SeqCst) {
            info!("[{name}] stop requested, not starting");
            return Ok(StartOutcome::Skipped);
        }
        if self.is_running() {
            return Ok(StartOutcome::AlreadyStarted);
        }

        let failed = || Error::other(format!("Could not start service \"{name}\""));
        let service_home = spec.abs_home(&self.inner.home);
        let bin_path = spec.abs_bin_path(&self.inner.home);
        if !bin_path.is_file() {
            return Err(failed().because(Error::business(format!(
                "binPath \"{}\" is not a file",
                bin_path.display()
            ))));
        }
        let overlay = service_overlay(&spec, &service_home).map_err(|e| failed().because(e))?;

        let mut cmd = Command::new(&bin_path);
        cmd.args(&spec.arguments).current_dir(&service_home);
        if spec.clean_env {
            cmd.env_clear();
        }
        cmd.envs(&overlay);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        lock(&self.inner.runtime).transition(name, ServicePhase::Starting);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                lock(&self.inner.runtime).transition(name, ServicePhase::Stopped);
                return Err(failed().because_of(&e));
            }
        };
        let Some(pid) = child.id() else {
            lock(&self.inner.runtime).transition(name, ServicePhase::Stopped);
            return Err(failed().because(Error::other("spawned child has no pid")));
        };
        info!("[{name}] spawned (pid={pid}, cmd={})", bin_path.display());

        let target = service_target(name);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, target.clone(), Level::Debug));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, target, Level::Warn));
        }

        // `terminate` sets `want_stop` under the same lock, so it either sees
        // this pid or we see its request.
        let stop_requested = {
            let mut runtime = lock(&self.inner.runtime);
            runtime.transition(name, ServicePhase::Running);
            runtime.state.started = true;
            runtime.state.pid = Some(pid);
            runtime.state.start_time = Some(epoch_millis());
            self.inner.want_stop.load(Ordering::SeqCst)
        };

        let watcher = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            watcher.on_exit(status);
        });

        if stop_requested {
            warn!("[{name}] stop requested while spawning, killing process group {pid}");
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => error!("[{name}] could not kill process group {pid}: {e}"),
            }
            return Ok(StartOutcome::Skipped);
        }
        Ok(StartOutcome::Started { pid })
    }

    fn on_exit(&self, status: std::io::Result<ExitStatus>) {
        let name = self.name();
        let (code, signal) = match status {
            Ok(status) => (status.code(), status.signal().map(signal_name)),
            Err(e) => {
                error!("[{name}] could not wait for child: {e}");
                (None, None)
            }
        };

        {
            let mut runtime = lock(&self.inner.runtime);
            runtime.transition(name, ServicePhase::Stopped);
            runtime.state.started = false;
            runtime.state.exit_code = code;
            runtime.state.exit_signal = signal.clone();
            runtime.state.stop_time = Some(epoch_millis());
        }
        info!(
            "[{name}] stopped (code={}, signal={})",
            code.map_or_else(|| "none".to_string(), |c| c.to_string()),
            signal.as_deref().unwrap_or("none")
        );

        self.handle_auto_restart(code);
    }

    fn handle_auto_restart(&self, code: Option<i32>) {
        if self.inner.want_stop.load(Ordering::SeqCst) {
            return;
        }

        let name = self.name();
        let spec = self.spec();
        let Some(max) = spec.max_restarts else {
            return;
        };

        let restarts = lock(&self.inner.runtime).state.restarts;
        if max != 0 && restarts >= max {
            info!("[{name}] reached maximum number of restarts ({max}), will not restart");
            return;
        }
        if let Some(code) = code
            && spec.no_restart_exit_codes.contains(&code)
        {
            info!("[{name}] auto-restart is disabled for exit code {code}");
            return;
        }

        let restarts = {
            let mut runtime = lock(&self.inner.runtime);
            runtime.state.restarts += 1;
            runtime.state.restarts
        };
        let delay = spec.restart_delay();
        let limit = if max == 0 {
            "unlimited".to_string()
        } else {
            max.to_string()
        };
        info!(
            "[{name}] auto-restarting ({restarts}/{limit}) in {}ms",
            delay.as_millis()
        );

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.start_after(delay).await {
                error!("[{}] restart failed: {}", this.name(), e.full_message());
            }
        });
    }

    /// SIGTERM the service's process group and wait for it to exit.
    pub async fn stop(&self) -> Result<()> {
        self.terminate(Signal::SIGTERM).await
    }

    /// SIGKILL the service's process group and wait for it to exit.
    pub async fn kill(&self) -> Result<()> {
        self.terminate(Signal::SIGKILL).await
    }

    /// Mark the service as stopping so no pending or future auto-restart
    /// spawns it. Returns the pid of the running child, if any.
    pub fn cancel_restart(&self) -> Option<u32> {
        let runtime = lock(&self.inner.runtime);
        self.inner.want_stop.store(true, Ordering::SeqCst);
        runtime.state.started.then_some(runtime.state.pid).flatten()
    }

    async fn terminate(&self, sig: Signal) -> Result<()> {
        let name = self.name();
        let Some(pid) = self.cancel_restart() else {
            info!("[{name}] stop ({sig}): service not started, preventing auto-restart");
            return Ok(());
        };

        info!("[{name}] stop ({sig}): signalling process group {pid}");
        match killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(
                    Error::other(format!("Could not send {sig} to service \"{name}\"")).because_of(&e),
                );
            }
        }

        let exited = async {
            while self.is_running() {
                sleep(STOP_POLL_INTERVAL).await;
            }
        };
        timeout(STOP_TIMEOUT, exited).await.map_err(|_| {
            Error::other(format!(
                "Service \"{name}\" still running {}s after {sig}",
                STOP_TIMEOUT.as_secs()
            ))
            .with_condition(Condition::Timeout)
        })
    }

    /// Replace the declared spec. Disabling a running service stops it.
    pub async fn update_spec(&self, spec: ServiceSpec) -> Result<()> {
        let name = self.name();
        let disabled = spec.disabled;
        info!("[{name}] updating options");
        *lock(&self.inner.spec) = spec;

        let running = {
            let mut runtime = lock(&self.inner.runtime);
            runtime.state.disabled = disabled;
            runtime.state.started
        };
        if running && disabled {
            info!("[{name}] service is now disabled, stopping");
            self.stop().await?;
        }
        Ok(())
    }
}

fn signal_name(raw: i32) -> String {
    Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{raw}"))
}

async fn forward_output<R: AsyncRead + Unpin>(mut reader: R, target: String, level: Level) {
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in lines.feed(&chunk[..n]) {
                    log!(target: &target, level, "{line}");
                }
            }
        }
    }
    if let Some(line) = lines.finish() {
        log!(target: &target, level, "{line}");
    }
}
