// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{self, Home, ManagerConfig, ServiceSpec};
use crate::error::{Error, Result};
use crate::lock;
use crate::logs::service_target;
use crate::process::{SETTLE_DELAY, ServiceSupervisor};
use crate::server::{ActionHandler, unknown_action};
use crate::state::{NamedState, ServiceDetails, epoch_millis};
use log::{error, info};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Delay between answering `kill` and starting the shutdown sequence.
const KILL_DELAY: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoOptions {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NameOptions {
    name: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NameForceOptions {
    name: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ForceOptions {
    #[serde(default)]
    force: bool,
}

/// Supervisors of every declared service, in declaration order.
pub struct ServiceRegistry {
    home: Home,
    config: Mutex<ManagerConfig>,
    services: Mutex<Vec<ServiceSupervisor>>,
    /// Held across snapshot and write so saves land in mutation order.
    persist: tokio::sync::Mutex<()>,
    shutdown: Arc<Notify>,
    settle: Duration,
}

impl ServiceRegistry {
    pub fn new(home: Home, config: ManagerConfig, shutdown: Arc<Notify>) -> Self {
        Self::with_settle_delay(home, config, shutdown, SETTLE_DELAY)
    }

    pub(crate) fn with_settle_delay(
        home: Home,
        mut config: ManagerConfig,
        shutdown: Arc<Notify>,
        settle: Duration,
    ) -> Self {
        let specs = std::mem::take(&mut config.services);
        let registry = Self {
            home,
            config: Mutex::new(config),
            services: Mutex::new(Vec::with_capacity(specs.len())),
            persist: tokio::sync::Mutex::new(()),
            shutdown,
            settle,
        };
        for spec in specs {
            if let Err(e) = registry.register(spec) {
                error!("{}", e.full_message());
            }
        }
        registry
    }

    fn register(&self, spec: ServiceSpec) -> Result<()> {
        let name = spec.name.clone();
        {
            let mut services = lock(&self.services);
            if services.iter().any(|s| s.name() == name) {
                return Err(Error::business("A service with this name already exists"));
            }
            services.push(ServiceSupervisor::with_settle_delay(self.home.dir(), spec, self.settle));
        }
        info!(target: &service_target(&name), "service registered");
        Ok(())
    }

    pub fn home(&self) -> &Home {
        &self.home
    }

    /// Snapshot of every supervisor handle.
    pub fn services(&self) -> Vec<ServiceSupervisor> {
        lock(&self.services).clone()
    }

    fn find(&self, name: &str) -> Result<ServiceSupervisor> {
        lock(&self.services)
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| Error::business("Service not found"))
    }

    pub fn ping(&self) -> u64 {
        epoch_millis()
    }

    /// Schedule the manager shutdown and answer at once.
    pub fn kill(&self) -> bool {
        info!("kill requested");
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_DELAY).await;
            shutdown.notify_one();
        });
        true
    }

    /// Current configuration, services included.
    pub fn get_options(&self) -> ManagerConfig {
        let mut options = lock(&self.config).clone();
        options.services = self.services().iter().map(ServiceSupervisor::spec).collect();
        options
    }

    pub async fn save_config(&self) -> Result<()> {
        let _persist = self.persist.lock().await;
        config::save(&self.home, &self.get_options()).await
    }

    pub async fn add_service(&self, spec: ServiceSpec) -> Result<()> {
        spec.validate(self.home.dir())?;
        let name = spec.name.clone();
        self.register(spec)?;
        info!("[{name}] added service");
        self.save_config().await
    }

    pub async fn update_service(&self, spec: ServiceSpec) -> Result<()> {
        spec.validate(self.home.dir())?;
        let service = self.find(&spec.name)?;
        service.update_spec(spec).await?;
        self.save_config().await
    }

    pub async fn remove_service(&self, name: &str, force: bool) -> Result<()> {
        let service = self.find(name)?;
        if force {
            service.kill().await?;
        } else {
            service.stop().await?;
        }
        lock(&self.services).retain(|s| s.name() != name);
        info!("[{name}] removed service");
        self.save_config().await
    }

    pub fn get_services(&self) -> Vec<String> {
        lock(&self.services)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn get_service(&self, name: &str) -> Result<ServiceDetails> {
        let service = self.find(name)?;
        Ok(ServiceDetails {
            options: service.spec(),
            state: service.state(),
        })
    }

    pub fn get_services_state(&self) -> Vec<NamedState> {
        self.services()
            .iter()
            .map(|s| NamedState {
                name: s.name().to_string(),
                state: s.state(),
            })
            .collect()
    }

    /// PID of the started service, `None` when it was disabled or already running.
    pub async fn start_service(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.find(name)?.start().await?.pid())
    }

    pub async fn stop_service(&self, name: &str, force: bool) -> Result<()> {
        let service = self.find(name)?;
        if force {
            service.kill().await
        } else {
            service.stop().await
        }
    }

    /// Start services one by one; failures are logged and skipped.
    pub async fn start_services(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        for service in self.services() {
            match service.start().await {
                Ok(outcome) => pids.extend(outcome.pid()),
                Err(e) => error!("[{}] {}", service.name(), e.full_message()),
            }
        }
        pids
    }

    /// Stop every service, then report every failure at once.
    pub async fn stop_services(&self, force: bool) -> Result<()> {
        let mut failures: Vec<(String, Error)> = Vec::new();
        for service in self.services() {
            let result = if force {
                service.kill().await
            } else {
                service.stop().await
            };
            if let Err(e) = result {
                failures.push((service.name().to_string(), e));
            }
        }

        let Some((_, first)) = failures.first() else {
            return Ok(());
        };
        let names: Vec<&str> = failures.iter().map(|(name, _)| name.as_str()).collect();
        Err(Error::other(format!("Could not stop services: {}", names.join(", "))).because(first.clone()))
    }
}

fn parse_options<T: DeserializeOwned>(options: Value) -> Result<T> {
    let options = if options.is_null() { json!({}) } else { options };
    serde_json::from_value(options).map_err(|e| Error::business(format!("Invalid options ({e})")))
}

impl ActionHandler for ServiceRegistry {
    async fn handle(&self, action: &str, options: Value) -> Result<Value> {
        match action {
            "ping" => {
                parse_options::<NoOptions>(options)?;
                Ok(json!(self.ping()))
            }
            "kill" => {
                parse_options::<NoOptions>(options)?;
                Ok(json!(self.kill()))
            }
            "getOptions" => {
                parse_options::<NoOptions>(options)?;
                Ok(serde_json::to_value(self.get_options())?)
            }
            "addService" => {
                self.add_service(parse_options(options)?).await?;
                Ok(Value::Null)
            }
            "updateService" => {
                self.update_service(parse_options(options)?).await?;
                Ok(Value::Null)
            }
            "removeService" => {
                let opts: NameForceOptions = parse_options(options)?;
                self.remove_service(&opts.name, opts.force).await?;
                Ok(Value::Null)
            }
            "getServices" => {
                parse_options::<NoOptions>(options)?;
                Ok(json!(self.get_services()))
            }
            "getService" => {
                let opts: NameOptions = parse_options(options)?;
                Ok(serde_json::to_value(self.get_service(&opts.name)?)?)
            }
            "startService" => {
                let opts: NameOptions = parse_options(options)?;
                Ok(json!(self.start_service(&opts.name).await?))
            }
            "startServices" => {
                parse_options::<NoOptions>(options)?;
                Ok(json!(self.start_services().await))
            }
            "stopService" => {
                let opts: NameForceOptions = parse_options(options)?;
                self.stop_service(&opts.name, opts.force).await?;
                Ok(Value::Null)
            }
            "stopServices" => {
                let opts: ForceOptions = parse_options(options)?;
                self.stop_services(opts.force).await?;
                Ok(Value::Null)
            }
            "getServicesState" => {
                parse_options::<NoOptions>(options)?;
                Ok(serde_json::to_value(self.get_services_state())?)
            }
            _ => Err(unknown_action(action)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::make_config;
    use crate::error::ErrorKind;
    use crate::process::tests::make_spec;

    fn make_registry(dir: &std::path::Path, services: Vec<ServiceSpec>) -> ServiceRegistry {
        let home = Home::from_config_path(&dir.join(config::DEFAULT_CONFIG_FILE)).unwrap();
        ServiceRegistry::with_settle_delay(
            home,
            make_config(4300, services),
            Arc::new(Notify::new()),
            Duration::from_millis(50),
        )
    }

    fn saved(dir: &std::path::Path) -> ManagerConfig {
        let home = Home::from_config_path(&dir.join(config::DEFAULT_CONFIG_FILE)).unwrap();
        config::load(&home).unwrap()
    }

    #[tokio::test]
    async fn test_add_service_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![]);

        registry
            .add_service(make_spec("web", "/bin/sleep", vec!["60"]))
            .await
            .unwrap();
        assert_eq!(registry.get_services(), vec!["web"]);
        assert_eq!(saved(dir.path()).services[0].name, "web");

        let err = registry
            .add_service(make_spec("web", "/bin/true", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert_eq!(err.message(), "A service with this name already exists");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_adds_are_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(make_registry(dir.path(), vec![]));

        for round in 0..5 {
            let adds: Vec<_> = (0..16)
                .map(|i| {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        let name = format!("svc-{round}-{i}");
                        registry.add_service(make_spec(&name, "/bin/true", vec![])).await
                    })
                })
                .collect();
            for add in adds {
                add.await.unwrap().unwrap();
            }

            let on_disk = saved(dir.path());
            assert_eq!(on_disk.services.len(), 16 * (round + 1));
        }
        assert_eq!(registry.get_services().len(), 80);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1, "no temporary files should be left behind");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_duplicate_adds() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(make_registry(dir.path(), vec![]));

        let adds: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.add_service(make_spec("web", "/bin/true", vec![])).await
                })
            })
            .collect();
        let mut added = 0;
        for add in adds {
            match add.await.unwrap() {
                Ok(()) => added += 1,
                Err(e) => assert_eq!(e.message(), "A service with this name already exists"),
            }
        }

        assert_eq!(added, 1);
        assert_eq!(registry.get_services(), vec!["web"]);
        assert_eq!(saved(dir.path()).services.len(), 1);
    }

    #[tokio::test]
    async fn test_add_invalid_service() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![]);
        let mut spec = make_spec("web", "/bin/true", vec![]);
        spec.restart_delay = Some(1);

        let err = registry.add_service(spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert!(registry.get_services().is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_service() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![]);
        let err = registry
            .update_service(make_spec("ghost", "/bin/true", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert_eq!(err.message(), "Service not found");
    }

    #[tokio::test]
    async fn test_update_service_persists_and_disables() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![make_spec("web", "/bin/sleep", vec!["60"])]);
        registry.start_service("web").await.unwrap();

        let mut spec = make_spec("web", "/bin/sleep", vec!["60"]);
        spec.disabled = true;
        registry.update_service(spec).await.unwrap();

        let details = registry.get_service("web").unwrap();
        assert!(details.options.disabled);
        assert!(details.state.disabled);
        assert!(!details.state.started);
        assert!(saved(dir.path()).services[0].disabled);
    }

    #[tokio::test]
    async fn test_disabled_service_is_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = make_spec("off", "/bin/sleep", vec!["60"]);
        spec.disabled = true;
        let registry = make_registry(dir.path(), vec![spec]);

        assert!(registry.start_services().await.is_empty());
        assert!(!registry.get_services_state()[0].state.started);
        assert_eq!(registry.start_service("off").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_and_stop_services() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(
            dir.path(),
            vec![
                make_spec("a", "/bin/sleep", vec!["60"]),
                make_spec("broken", "/nonexistent", vec![]),
                make_spec("b", "/bin/sleep", vec!["60"]),
            ],
        );

        let pids = registry.start_services().await;
        assert_eq!(pids.len(), 2, "failing service should be skipped");

        // Already running services are not reported again.
        assert!(registry.start_services().await.is_empty());

        let states = registry.get_services_state();
        let names: Vec<&str> = states.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "broken", "b"]);
        assert!(states[0].state.started && !states[1].state.started && states[2].state.started);

        registry.stop_services(false).await.unwrap();
        assert!(registry.get_services_state().iter().all(|s| !s.state.started));
    }

    #[tokio::test]
    async fn test_stop_services_aggregates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(
            dir.path(),
            vec![
                make_spec("stubborn", "/bin/sh", vec!["-c", "trap '' TERM; sleep 60"]),
                make_spec("easy", "/bin/sleep", vec!["60"]),
            ],
        );
        registry.start_services().await;

        let err = registry.stop_services(false).await.unwrap_err();
        assert!(err.matches("Could not stop services: stubborn"));
        assert!(err.is_timeout());
        assert!(!registry.get_service("easy").unwrap().state.started);

        registry.stop_services(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_service() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![make_spec("web", "/bin/sleep", vec!["60"])]);
        registry.start_service("web").await.unwrap();
        let supervisor = registry.services()[0].clone();

        registry.remove_service("web", true).await.unwrap();
        assert!(registry.get_services().is_empty());
        assert!(!supervisor.is_running());
        assert!(saved(dir.path()).services.is_empty());
    }

    #[tokio::test]
    async fn test_handle_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![make_spec("web", "/bin/true", vec![])]);

        let names = registry.handle("getServices", Value::Null).await.unwrap();
        assert_eq!(names, json!(["web"]));

        let details = registry
            .handle("getService", json!({"name": "web"}))
            .await
            .unwrap();
        assert_eq!(details["options"]["binPath"], "/bin/true");
        assert_eq!(details["state"]["started"], false);

        let options = registry.handle("getOptions", json!({})).await.unwrap();
        assert!(options.get("version").is_none());
        assert_eq!(options["services"][0]["name"], "web");

        let err = registry.handle("saveConfig", json!({})).await.unwrap_err();
        assert_eq!(err.message(), "Action \"saveConfig\" does not exist");

        let err = registry
            .handle("getServices", json!({"extra": true}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert!(err.matches("Invalid options"));

        let err = registry.handle("getService", json!({})).await.unwrap_err();
        assert!(err.matches("Invalid options"));
    }

    #[tokio::test]
    async fn test_kill_notifies_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![]);
        let shutdown = registry.shutdown.clone();

        assert_eq!(registry.handle("kill", json!({})).await.unwrap(), json!(true));
        tokio::time::timeout(Duration::from_secs(2), shutdown.notified())
            .await
            .expect("shutdown should be requested");
    }

    #[test]
    fn test_ping_is_epoch_millis() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path(), vec![]);
        assert!(registry.ping() > 1_600_000_000_000);
    }
}
