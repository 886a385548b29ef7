// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use clap::{Parser, Subcommand};
use procmgr::config::{self, Home};
use procmgr::facade::ManagerFacade;
use procmgr::installer::UnixInstaller;
use procmgr::logs::{FileLogger, client_log_name};
use procmgr::menu::run_menu;
use procmgr::state::ServiceState;
use procmgr::{Error, Result};
use std::process::ExitCode;

/// Print the cause chain in `Debug` form on failure.
const DEBUG_ENV: &str = "PROCMGR_DEBUG";

#[derive(Parser, Debug)]
#[command(name = "procmgr")]
#[command(about = "Control the process manager; opens a menu without a command")]
#[command(version)]
struct Args {
    /// Invoked by the init system: never go through it to start or stop
    #[arg(long, global = true)]
    from_service: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show whether the manager is installed and started, and its services
    Status,
    /// Start the manager
    Start,
    /// Register the manager with the init system
    Install,
    /// Remove the manager from the init system
    Uninstall,
    /// List the declared services
    ServicesList,
    /// Show the options and state of one service
    ServicesGet { name: String },
    /// Start every enabled service
    ServicesStart,
    /// Stop every service, then the manager
    Stop,
    /// Stop, then start the manager
    Restart,
}

fn say(message: &str) {
    println!("procmgr: {message}");
}

fn state_detail(state: &ServiceState) -> String {
    if state.disabled {
        "disabled:true".to_string()
    } else if state.started {
        format!("pid:{}", state.pid.unwrap_or_default())
    } else if let Some(code) = state.exit_code.filter(|c| *c != 0) {
        format!("exitCode:{code}")
    } else {
        format!("restarts:{}", state.restarts)
    }
}

async fn run(args: Args) -> Result<()> {
    let home = Home::resolve()?;
    let config = config::load(&home)?;
    let logger = FileLogger::new(
        &home.logs_dir(),
        &client_log_name(&config.name),
        config.max_log_size(),
        config.max_log_files(),
    );
    if let Err(e) = logger.init() {
        eprintln!("procmgr: logging disabled: {}", e.full_message());
    }

    let installer = UnixInstaller::detect(&home, &config).await?;
    let facade = ManagerFacade::new(home, config, installer);
    let from_service = args.from_service;

    let Some(command) = args.command else {
        return run_menu(&facade).await;
    };
    match command {
        Command::Status => {
            let status = facade.get_status().await?;
            say(&format!(
                "Status: [installed:{}] [started:{}]",
                status.installed, status.started
            ));
            for service in &status.services {
                say(&format!(
                    " - {} [running:{}] [{}]",
                    service.name,
                    service.state.started,
                    state_detail(&service.state)
                ));
            }
        }
        Command::Start => {
            let done = facade.ensure_started(from_service).await?;
            say(if done { "Start: done" } else { "Start: already started" });
        }
        Command::Install => {
            let done = facade.ensure_installed().await?;
            say(if done { "Install: done" } else { "Install: already installed" });
        }
        Command::Uninstall => {
            let done = facade.ensure_uninstalled().await?;
            say(if done { "Un-install: done" } else { "Un-install: not installed" });
        }
        Command::ServicesList => {
            facade.ensure_started(from_service).await?;
            let names = facade.client().get_services().await?;
            say(&format!("Services:\n - {}", names.join("\n - ")));
        }
        Command::ServicesGet { name } => {
            let details = facade.client().get_service(&name).await?;
            say(&format!(
                "Service \"{name}\":\n{}",
                serde_json::to_string_pretty(&details)?
            ));
        }
        Command::ServicesStart => {
            facade.ensure_started(from_service).await?;
            let pids = facade
                .client()
                .start_services(facade.enabled_service_count())
                .await?;
            say(&format!("Services start: {} services started", pids.len()));
        }
        Command::Stop => {
            let done = facade.ensure_stopped(from_service).await?;
            say(if done { "Stop: done" } else { "Stop: not started" });
        }
        Command::Restart => {
            let stopped = facade.ensure_stopped(from_service).await?;
            facade.ensure_started(from_service).await?;
            say(if stopped { "Restart: done" } else { "Restart: started" });
        }
    }
    Ok(())
}

fn report(error: &Error) {
    if std::env::var_os(DEBUG_ENV).is_some() {
        for cause in error.chain() {
            say(&format!("{cause:?}"));
        }
    } else {
        say(&error.full_message());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e.full_message());
            report(&e);
            ExitCode::FAILURE
        }
    }
}
