// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The manager process: owns the registry and the control endpoint until a
//! signal or a `kill` request stops it.

use crate::config::{self, CONFIG_PATH_ENV, Home, ManagerConfig};
use crate::error::{Error, Result};
use crate::logs::{FileLogger, manager_log_name};
use crate::protocol::PROTOCOL_VERSION;
use crate::registry::ServiceRegistry;
use crate::server;
use crate::shutdown::shutdown_all;
use log::{error, info, warn};
use nix::unistd::{Gid, Uid, chown, geteuid, setgid, setuid};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

pub const SERVER_BIN: &str = "procmgrd";
/// A launched manager exiting within this window failed to start.
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(500);

pub struct Manager {
    home: Home,
    config: ManagerConfig,
}

impl Manager {
    /// Resolve the home from the environment and load its configuration.
    pub fn load() -> Result<Self> {
        let home = Home::resolve()?;
        let config = config::load(&home)?;
        Ok(Self::new(home, config))
    }

    pub fn new(home: Home, config: ManagerConfig) -> Self {
        Self { home, config }
    }

    pub async fn run(self) -> Result<()> {
        let Manager { home, config } = self;
        let logs_dir = home.logs_dir();
        FileLogger::new(
            &logs_dir,
            &manager_log_name(&config.name),
            config.max_log_size(),
            config.max_log_files(),
        )
        .with_echo(true)
        .init()?;
        info!("starting... (version {})", env!("CARGO_PKG_VERSION"));

        if let Some(owner) = config.process_owner.as_deref() {
            if let Err(e) = switch_owner(owner, &logs_dir) {
                error!("Could not change process owner to \"{owner}\": {}", e.full_message());
            }
        }

        let listener = server::bind(config.port).await.inspect_err(|e| {
            error!("Could not start: {}", e.full_message());
        })?;
        info!("socket ready");

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let shutdown = Arc::new(Notify::new());
        let registry = Arc::new(ServiceRegistry::new(home, config.clone(), shutdown.clone()));
        let server = tokio::spawn({
            let registry = registry.clone();
            let secret = config.secret.clone();
            async move { server::serve(listener, registry, PROTOCOL_VERSION, &secret).await }
        });
        info!("started {}", config.summary());

        if config.auto_start_services {
            let pids = registry.start_services().await;
            info!("auto-started {} service(s)", pids.len());
        }

        tokio::select! {
            _ = sigterm.recv() => warn!("received signal \"SIGTERM\""),
            _ = sigint.recv() => warn!("received signal \"SIGINT\""),
            _ = shutdown.notified() => info!("shutdown requested"),
        }

        shutdown_all(&registry, Some(server)).await;
        Ok(())
    }
}

/// Drop root privileges for `owner`, handing it the log directory first.
fn switch_owner(owner: &str, logs_dir: &Path) -> Result<()> {
    let user = uzers::get_user_by_name(owner)
        .ok_or_else(|| Error::business(format!("Unknown user \"{owner}\"")))?;
    let uid = Uid::from_raw(user.uid());
    let gid = Gid::from_raw(user.primary_group_id());
    if geteuid() == uid {
        return Ok(());
    }
    if !geteuid().is_root() {
        return Err(Error::business("Only root can change the process owner"));
    }

    let mut paths = vec![logs_dir.to_path_buf()];
    if let Ok(entries) = std::fs::read_dir(logs_dir) {
        paths.extend(entries.filter_map(|entry| entry.ok().map(|e| e.path())));
    }
    for path in paths {
        chown(&path, Some(uid), Some(gid)).map_err(|e| {
            Error::other(format!("Could not chown \"{}\"", path.display())).because_of(&e)
        })?;
    }

    #[cfg(not(target_os = "macos"))]
    nix::unistd::setgroups(&[gid]).map_err(|e| Error::other("setgroups failed").because_of(&e))?;
    setgid(gid).map_err(|e| Error::other("setgid failed").because_of(&e))?;
    setuid(uid).map_err(|e| Error::other("setuid failed").because_of(&e))?;
    info!("process owner changed to \"{owner}\"");
    Ok(())
}

/// The `procmgrd` executable shipped next to the running one.
pub fn server_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SERVER_BIN)))
        .unwrap_or_else(|| PathBuf::from(SERVER_BIN))
}

/// Launch a manager for `home` in its own process group, detached from the
/// caller's terminal.
pub async fn spawn_detached(server_bin: &Path, home: &Home) -> Result<()> {
    let mut child = Command::new(server_bin)
        .env(CONFIG_PATH_ENV, home.config_path())
        .current_dir(home.dir())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| {
            Error::other(format!("Could not launch \"{}\"", server_bin.display())).because_of(&e)
        })?;
    info!("launched {} (pid={})", server_bin.display(), child.id().unwrap_or_default());

    match timeout(EARLY_EXIT_WINDOW, child.wait()).await {
        Err(_) => Ok(()),
        Ok(Ok(status)) => Err(Error::other(format!(
            "Manager exited right after launch ({status})"
        ))),
        Ok(Err(e)) => Err(Error::other("Could not watch the launched manager").because_of(&e)),
    }
}
