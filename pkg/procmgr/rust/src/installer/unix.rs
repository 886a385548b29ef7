// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::PlatformInstaller;
use super::template::{TemplateVars, render};
use crate::config::{Home, ManagerConfig};
use crate::error::{Condition, Error, Result};
use log::{debug, info};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const START_TIMEOUT: Duration = Duration::from_secs(5);

struct InitSystemConfig {
    name: &'static str,
    template: &'static str,
    script_target: &'static str,
    mode: u32,
    start_command: Option<&'static str>,
    stop_command: Option<&'static str>,
    install_command: &'static str,
    uninstall_command: &'static str,
    post_uninstall_command: Option<&'static str>,
}

const OPENRC: InitSystemConfig = InitSystemConfig {
    name: "OpenRC",
    template: include_str!("templates/openrc.sh"),
    script_target: "/etc/init.d/{{label}}",
    mode: 0o755,
    start_command: Some("/etc/init.d/{{label}} start"),
    stop_command: Some("/etc/init.d/{{label}} stop"),
    install_command: "rc-update add {{label}} default",
    uninstall_command: "rc-update del {{label}} default",
    post_uninstall_command: None,
};

const SYSTEMD: InitSystemConfig = InitSystemConfig {
    name: "Systemd",
    template: include_str!("templates/systemd.service"),
    script_target: "/lib/systemd/system/{{label}}.service",
    mode: 0o644,
    start_command: Some("systemctl start {{label}}"),
    stop_command: Some("systemctl stop {{label}}"),
    install_command: "systemctl daemon-reload; systemctl enable {{label}}",
    uninstall_command: "systemctl disable {{label}}",
    post_uninstall_command: Some("systemctl daemon-reload"),
};

const SYSV: InitSystemConfig = InitSystemConfig {
    name: "SystemV",
    template: include_str!("templates/sysv.sh"),
    script_target: "/etc/init.d/{{label}}",
    mode: 0o755,
    start_command: Some("/etc/init.d/{{label}} start"),
    stop_command: Some("/etc/init.d/{{label}} stop"),
    install_command: concat!(
        "(for x in 2 3 4 5 ; do ln -s /etc/init.d/{{label}} /etc/rc$x.d/S80{{label}} ; done) ; ",
        "(for x in 0 1 6 ; do ln -s /etc/init.d/{{label}} /etc/rc$x.d/K80{{label}} ; done) ; ",
        "(/sbin/insserv {{label}} || /usr/lib/insserv/insserv {{label}} || true)"
    ),
    uninstall_command: concat!(
        "(for x in 0 1 6 ; do rm -f /etc/rc$x.d/K80{{label}} ; done) ; ",
        "(for x in 2 3 4 5 ; do rm -f /etc/rc$x.d/S80{{label}} ; done) ; ",
        "(/sbin/insserv -r {{label}} || /usr/lib/insserv/insserv -r {{label}} || true)"
    ),
    post_uninstall_command: None,
};

// launchd has no stop command: `launchctl remove` is the only way out.
const LAUNCHD: InitSystemConfig = InitSystemConfig {
    name: "Launchd",
    template: include_str!("templates/launchd.plist"),
    script_target: "/Library/LaunchDaemons/{{label}}.service.plist",
    mode: 0o644,
    start_command: None,
    stop_command: None,
    install_command: "launchctl load -w /Library/LaunchDaemons/{{label}}.service.plist",
    uninstall_command: "(launchctl remove {{label}}.service ; true)",
    post_uninstall_command: None,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    OpenRc,
    Systemd,
    SysV,
    Launchd,
}

impl InitSystem {
    fn config(self) -> &'static InitSystemConfig {
        match self {
            InitSystem::OpenRc => &OPENRC,
            InitSystem::Systemd => &SYSTEMD,
            InitSystem::SysV => &SYSV,
            InitSystem::Launchd => &LAUNCHD,
        }
    }

    /// launchd on macOS; elsewhere systemd if present, OpenRC on Gentoo,
    /// SysV otherwise.
    pub async fn detect() -> Self {
        if cfg!(target_os = "macos") {
            return InitSystem::Launchd;
        }
        if has_systemd().await {
            InitSystem::Systemd
        } else if tokio::fs::metadata("/etc/gentoo-release").await.is_ok() {
            InitSystem::OpenRc
        } else {
            InitSystem::SysV
        }
    }
}

async fn has_systemd() -> bool {
    Command::new("systemd")
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .is_ok_and(|out| out.status.success() && !out.stdout.is_empty())
}

struct Rendered {
    script_target: PathBuf,
    script: String,
    start_command: Option<String>,
    stop_command: Option<String>,
    install_command: String,
    uninstall_command: String,
    post_uninstall_command: Option<String>,
}

pub struct UnixInstaller {
    system: InitSystem,
    vars: TemplateVars,
    rendered: Rendered,
}

impl UnixInstaller {
    /// Detect the init system and render its configuration for the manager
    /// installed next to the running executable.
    pub async fn detect(home: &Home, config: &ManagerConfig) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::other("Could not locate the current executable").because_of(&e))?;
        let bin_dir = exe.parent().unwrap_or(Path::new("/"));
        let vars = TemplateVars::new(home, config, bin_dir);
        Self::new(InitSystem::detect().await, vars)
    }

    pub fn new(system: InitSystem, vars: TemplateVars) -> Result<Self> {
        let config = system.config();
        let optional = |command: Option<&str>| command.map(|c| render(c, &vars)).transpose();
        let rendered = Rendered {
            script_target: PathBuf::from(render(config.script_target, &vars)?),
            script: render(config.template, &vars)?,
            start_command: optional(config.start_command)?,
            stop_command: optional(config.stop_command)?,
            install_command: render(config.install_command, &vars)?,
            uninstall_command: render(config.uninstall_command, &vars)?,
            post_uninstall_command: optional(config.post_uninstall_command)?,
        };
        Ok(Self {
            system,
            vars,
            rendered,
        })
    }

    pub fn init_system(&self) -> InitSystem {
        self.system
    }

    pub fn script_target(&self) -> &Path {
        &self.rendered.script_target
    }

    async fn write_script(&self) -> Result<()> {
        let target = &self.rendered.script_target;
        let write = async {
            tokio::fs::write(target, &self.rendered.script).await?;
            tokio::fs::set_permissions(
                target,
                std::fs::Permissions::from_mode(self.system.config().mode),
            )
            .await
        };
        write.await.map_err(|e| {
            Error::business(format!("Could not write \"{}\"", target.display())).because_of(&e)
        })
    }
}

/// Run `command` through `sh -c`; a non-zero exit is a business failure.
async fn run_command(command: &str, limit: Option<Duration>) -> Result<String> {
    debug!("running `{command}`");
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match limit {
        Some(limit) => timeout(limit, cmd.output()).await.map_err(|_| {
            Error::business(format!("Command timed out: {command}")).with_condition(Condition::Timeout)
        })?,
        None => cmd.output().await,
    }
    .map_err(|e| Error::business(format!("Could not run: {command}")).because_of(&e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() { stdout } else { stderr };
        return Err(
            Error::business(format!("Command failed ({}): {command}", output.status))
                .because(Error::other(detail)),
        );
    }
    Ok(stdout)
}

impl PlatformInstaller for UnixInstaller {
    fn service_system_name(&self) -> &str {
        self.system.config().name
    }

    fn is_admin(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    async fn is_installed(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.rendered.script_target).await.is_ok())
    }

    async fn install(&self) -> Result<()> {
        self.check_admin(&format!("install {} as a system service", self.vars.name))?;
        if self.vars.username.is_empty() {
            return Err(Error::business(
                "Cannot install as a service: the process owner must be set",
            ));
        }
        info!(
            "Installing as a system service ({})",
            serde_json::to_string(&self.vars).unwrap_or_default()
        );
        self.write_script().await?;
        run_command(&self.rendered.install_command, None).await?;
        info!("Installed as a system service (done).");
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        self.check_admin(&format!("uninstall {} from system services", self.vars.name))?;
        info!("Uninstalling from system services");
        run_command(&self.rendered.uninstall_command, None).await?;
        if self.is_installed().await? {
            tokio::fs::remove_file(&self.rendered.script_target)
                .await
                .map_err(|e| Error::business("Could not remove service file").because_of(&e))?;
        }
        if let Some(ref command) = self.rendered.post_uninstall_command {
            run_command(command, None).await?;
        }
        info!("Uninstalled from system services (done).");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.check_admin(&format!("start the {} system service", self.vars.name))?;
        if let Some(ref command) = self.rendered.start_command {
            info!("Starting system service");
            run_command(command, Some(START_TIMEOUT)).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.check_admin(&format!("stop the {} system service", self.vars.name))?;
        if let Some(ref command) = self.rendered.stop_command {
            info!("Stopping system service");
            run_command(command, None).await?;
        }
        Ok(())
    }
}
