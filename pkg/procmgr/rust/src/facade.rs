// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::cache::TtlCache;
use crate::client::ProtocolClient;
use crate::config::{self, Home, ManagerConfig, ServiceSpec};
use crate::error::{Error, Result};
use crate::installer::PlatformInstaller;
use crate::lock;
use crate::manager;
use crate::protocol::QueryOptions;
use crate::state::{NamedState, ServiceState};
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

const STARTED_KEY: &str = "started";
const STARTED_TTL: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_millis(300);
const PING_RETRY_DELAY: Duration = Duration::from_millis(300);
/// Wait after launching the manager before checking that it answers.
const LAUNCH_SETTLE: Duration = Duration::from_millis(1500);
/// Wait after starting a freshly installed native service.
const INSTALL_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub installed: bool,
    pub started: bool,
    pub process_owner: Option<String>,
    pub services: Vec<NamedState>,
}

/// Client-side view of one manager: reachability, lifecycle, native service
/// registration, and declared configuration.
pub struct ManagerFacade<I> {
    home: Home,
    config: Mutex<ManagerConfig>,
    client: ProtocolClient,
    installer: I,
    server_bin: PathBuf,
    cache: TtlCache<bool>,
}

impl<I: PlatformInstaller> ManagerFacade<I> {
    pub fn new(home: Home, config: ManagerConfig, installer: I) -> Self {
        Self {
            client: ProtocolClient::from_config(&config),
            server_bin: manager::server_bin(),
            home,
            config: Mutex::new(config),
            installer,
            cache: TtlCache::new(STARTED_TTL),
        }
    }

    pub fn home(&self) -> &Home {
        &self.home
    }

    pub fn config(&self) -> ManagerConfig {
        lock(&self.config).clone()
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    pub fn service_system_name(&self) -> &str {
        self.installer.service_system_name()
    }

    pub fn enabled_service_count(&self) -> usize {
        lock(&self.config)
            .services
            .iter()
            .filter(|s| !s.disabled)
            .count()
    }

    fn service_count(&self) -> usize {
        lock(&self.config).services.len()
    }

    /// Whether the manager answers a ping, cached for two seconds.
    pub async fn is_server_started(&self, retries: u32, bypass_cache: bool) -> Result<bool> {
        let opts = QueryOptions::default()
            .with_timeout(PING_TIMEOUT)
            .with_retries(retries, PING_RETRY_DELAY);
        self.cache
            .get_or_try_fetch(STARTED_KEY, bypass_cache, || self.client.ping(opts, true))
            .await
    }

    /// Launch the manager unless it already answers. `true` if it was launched.
    pub async fn ensure_started(&self, from_service: bool) -> Result<bool> {
        if self.is_server_started(1, true).await? {
            return Ok(false);
        }

        let installed = self.installer.is_installed().await?;
        info!("Launching manager (service:{installed} from-service:{from_service})");
        let launched = if installed && !from_service {
            self.installer.start().await
        } else {
            manager::spawn_detached(&self.server_bin, &self.home).await
        };
        if let Err(e) = launched {
            error!("Manager launch failed: {}", e.full_message());
            return Err(e);
        }

        sleep(LAUNCH_SETTLE).await;
        let opts = QueryOptions::default()
            .with_timeout(LAUNCH_SETTLE)
            .with_retries(2, PING_RETRY_DELAY);
        let checked = self.client.ping(opts, false).await;
        self.cache.invalidate(STARTED_KEY);
        checked.map_err(|e| {
            Error::other(format!("{} could not be started", lock(&self.config).name)).because(e)
        })?;
        Ok(true)
    }

    /// Stop every service, then the manager. `true` if it was running.
    pub async fn ensure_stopped(&self, from_service: bool) -> Result<bool> {
        if !self.is_server_started(2, false).await? {
            return Ok(false);
        }

        self.client
            .stop_services(self.service_count(), false)
            .await?;
        let installed = self.installer.is_installed().await?;
        let stopped = if installed && !from_service {
            self.installer.stop().await
        } else {
            self.client.kill_server().await
        };
        self.cache.invalidate(STARTED_KEY);
        stopped?;
        Ok(true)
    }

    /// Register the manager with the init system and start it through it.
    pub async fn ensure_installed(&self) -> Result<bool> {
        self.installer.check_admin("install a service")?;
        if self.installer.is_installed().await? {
            return Ok(false);
        }

        if self.is_server_started(1, false).await? {
            self.client.kill_server().await?;
        }
        self.installer.install().await?;
        self.installer.start().await?;
        sleep(INSTALL_SETTLE).await;
        self.cache.invalidate(STARTED_KEY);
        Ok(true)
    }

    pub async fn ensure_uninstalled(&self) -> Result<bool> {
        self.installer.check_admin("uninstall a service")?;
        if !self.installer.is_installed().await? {
            return Ok(false);
        }

        self.ensure_stopped(false).await?;
        self.installer.uninstall().await?;
        self.cache.invalidate(STARTED_KEY);
        Ok(true)
    }

    pub async fn get_status(&self) -> Result<Status> {
        let installed = self.installer.is_installed().await?;
        if !self.is_server_started(1, false).await? {
            return Ok(self.offline_status(installed));
        }

        match self.live_status(installed).await {
            Ok(status) => Ok(status),
            Err(e) => {
                error!(
                    "getStatus partially failed, assuming the manager went offline: {}",
                    e.full_message()
                );
                Ok(self.offline_status(installed))
            }
        }
    }

    async fn live_status(&self, installed: bool) -> Result<Status> {
        let options = self.client.get_options().await?;
        let services = self.client.get_services_state().await?;
        Ok(Status {
            installed,
            started: true,
            process_owner: options.process_owner,
            services,
        })
    }

    /// Status derived from the declared configuration alone.
    fn offline_status(&self, installed: bool) -> Status {
        let config = lock(&self.config);
        Status {
            installed,
            started: false,
            process_owner: config.process_owner.clone(),
            services: config
                .services
                .iter()
                .map(|spec| NamedState {
                    name: spec.name.clone(),
                    state: ServiceState {
                        disabled: spec.disabled,
                        ..ServiceState::default()
                    },
                })
                .collect(),
        }
    }

    /// Change the OS user the manager runs as, restarting an idle manager.
    pub async fn set_process_owner(&self, owner: Option<String>) -> Result<()> {
        if lock(&self.config).process_owner == owner {
            return Ok(());
        }

        let status = self.get_status().await?;
        if !status.started {
            lock(&self.config).process_owner = owner;
            return self.save_config().await;
        }
        if status.services.iter().any(|s| s.state.started) {
            return Err(Error::business(
                "Cannot set processOwner while manager is started, please stop manager first.",
            ));
        }

        self.ensure_stopped(false).await?;
        lock(&self.config).process_owner = owner;
        self.save_config().await?;
        self.ensure_started(false).await?;
        Ok(())
    }

    pub async fn get_service_options(&self, name: &str) -> Result<ServiceSpec> {
        if self.is_server_started(1, false).await? {
            return Ok(self.client.get_service(name).await?.options);
        }
        lock(&self.config)
            .service(name)
            .cloned()
            .ok_or_else(|| Error::business(format!("Service \"{name}\" was not found")))
    }

    pub async fn set_service_options(&self, name: &str, mut spec: ServiceSpec) -> Result<()> {
        spec.name = name.to_string();
        spec.validate(self.home.dir())?;

        if self.is_server_started(1, false).await? {
            return self.client.update_service(&spec).await;
        }

        {
            let mut config = lock(&self.config);
            let slot = config
                .services
                .iter_mut()
                .find(|s| s.name == name)
                .ok_or_else(|| Error::business(format!("Service \"{name}\" was not found")))?;
            *slot = spec;
        }
        self.save_config().await
    }

    pub async fn save_config(&self) -> Result<()> {
        let config = self.config();
        config::save(&self.home, &config).await
    }
}
