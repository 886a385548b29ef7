// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Interactive terminal menu over a [`ManagerFacade`].

use crate::error::{Error, Result};
use crate::facade::{ManagerFacade, Status};
use crate::installer::PlatformInstaller;
use dialoguer::Select;
use log::{debug, error};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuAction {
    Start,
    Stop,
    Restart,
    StartService(String),
    StopService(String),
    Install,
    Uninstall,
    Refresh,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub label: String,
    pub action: MenuAction,
}

impl MenuEntry {
    fn new(label: impl Into<String>, action: MenuAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count > 1 { "s" } else { "" }
}

/// Entries that make sense for `status`, in display order.
pub fn menu_entries(name: &str, system: &str, status: &Status) -> Vec<MenuEntry> {
    let enabled: Vec<_> = status.services.iter().filter(|s| !s.state.disabled).collect();
    let stopped = enabled.iter().filter(|s| !s.state.started).count();
    let mut entries = Vec::new();

    if !status.started {
        entries.push(MenuEntry::new(
            format!("Start {name} and {stopped} service{}", plural(stopped)),
            MenuAction::Start,
        ));
    } else if stopped > 0 {
        entries.push(MenuEntry::new(
            format!("Start {name} (will start {stopped} stopped service{})", plural(stopped)),
            MenuAction::Start,
        ));
    }
    if status.started {
        entries.push(MenuEntry::new(format!("Stop {name}"), MenuAction::Stop));
        entries.push(MenuEntry::new(format!("Restart {name}"), MenuAction::Restart));
        for service in &enabled {
            let entry = if service.state.started {
                MenuEntry::new(
                    format!("Stop service: \"{}\"", service.name),
                    MenuAction::StopService(service.name.clone()),
                )
            } else {
                MenuEntry::new(
                    format!("Start service: \"{}\"", service.name),
                    MenuAction::StartService(service.name.clone()),
                )
            };
            entries.push(entry);
        }
    }

    if status.installed {
        entries.push(MenuEntry::new(
            format!("Uninstall {name} from {system}"),
            MenuAction::Uninstall,
        ));
    } else {
        let owner = status
            .process_owner
            .as_ref()
            .map(|o| format!(" (as user \"{o}\")"))
            .unwrap_or_default();
        entries.push(MenuEntry::new(
            format!("Install {name} as a system service using {system}{owner}"),
            MenuAction::Install,
        ));
    }

    entries.push(MenuEntry::new("Refresh", MenuAction::Refresh));
    entries.push(MenuEntry::new("Close", MenuAction::Close));
    entries
}

pub fn render_header(name: &str, status: &Status) -> String {
    let mut out = format!(
        "{name}: {} / {}",
        if status.started { "started" } else { "stopped" },
        if status.installed { "installed" } else { "not installed" },
    );
    for service in &status.services {
        let state = &service.state;
        let detail = if state.disabled {
            "disabled".to_string()
        } else if state.started {
            format!("started (pid {})", state.pid.unwrap_or_default())
        } else if let Some(code) = state.exit_code {
            format!("stopped (exit code {code}, restarts {})", state.restarts)
        } else {
            "stopped".to_string()
        };
        let _ = write!(out, "\n  - {}: {detail}", service.name);
    }
    out
}

async fn perform<I: PlatformInstaller>(facade: &ManagerFacade<I>, action: &MenuAction) -> Result<String> {
    let count = facade.enabled_service_count();
    match action {
        MenuAction::Start => {
            facade.ensure_started(false).await?;
            let pids = facade.client().start_services(count).await?;
            Ok(format!("{} service{} started", pids.len(), plural(pids.len())))
        }
        MenuAction::Stop => {
            let done = facade.ensure_stopped(false).await?;
            Ok(if done { "stopped" } else { "not started" }.to_string())
        }
        MenuAction::Restart => {
            facade.ensure_stopped(false).await?;
            facade.ensure_started(false).await?;
            Ok("restarted".to_string())
        }
        MenuAction::StartService(name) => match facade.client().start_service(name).await? {
            Some(pid) => Ok(format!("\"{name}\" started (pid {pid})")),
            None => Ok(format!("\"{name}\" was already started")),
        },
        MenuAction::StopService(name) => {
            facade.client().stop_service(name, false).await?;
            Ok(format!("\"{name}\" stopped"))
        }
        MenuAction::Install => {
            let done = facade.ensure_installed().await?;
            Ok(if done { "installed" } else { "already installed" }.to_string())
        }
        MenuAction::Uninstall => {
            let done = facade.ensure_uninstalled().await?;
            Ok(if done { "uninstalled" } else { "not installed" }.to_string())
        }
        MenuAction::Refresh | MenuAction::Close => Ok(String::new()),
    }
}

/// Show the menu until the user closes it. Failed actions are reported and
/// the menu keeps running.
pub async fn run_menu<I: PlatformInstaller>(facade: &ManagerFacade<I>) -> Result<()> {
    let name = facade.config().name;
    loop {
        let status = facade.get_status().await?;
        println!("\n{}", render_header(&name, &status));

        let entries = menu_entries(&name, facade.service_system_name(), &status);
        let labels: Vec<String> = entries.iter().map(|e| e.label.clone()).collect();
        let choice = tokio::task::spawn_blocking(move || {
            Select::new()
                .with_prompt("What do you want to do?")
                .items(&labels)
                .default(0)
                .interact_opt()
        })
        .await
        .map_err(|e| Error::other("Menu prompt failed").because_of(&e))?
        .map_err(|e| Error::other("Menu prompt failed").because_of(&e))?;

        let Some(action) = choice.and_then(|i| entries.get(i)).map(|e| &e.action) else {
            return Ok(());
        };
        if *action == MenuAction::Close {
            return Ok(());
        }

        debug!("menu action: {action:?}");
        match perform(facade, action).await {
            Ok(message) if message.is_empty() => {}
            Ok(message) => println!("{message}"),
            Err(e) => {
                error!("menu action {action:?} failed: {}", e.full_message());
                println!("Error: {}", e.full_message());
            }
        }
    }
}
