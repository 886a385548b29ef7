// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{Error, Result};
use crate::protocol::PROTOCOL_VERSION;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "PROCMGR_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "procmgr.json";

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
const MIN_RESTART_DELAY_MS: u64 = 100;
const MAX_RESTART_DELAY_MS: u64 = 60 * 1000;

pub const DEFAULT_MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_LOG_FILES: u32 = 10;
const MIN_MAX_LOG_SIZE: u64 = 500 * 1024;
const MIN_MAX_LOG_FILES: u32 = 2;

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Directory holding the configuration file and the `logs/` subdirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Home {
    dir: PathBuf,
    config_file: String,
}

impl Home {
    pub fn from_config_path(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path)
            .map_err(|e| Error::other("Invalid configuration path").because_of(&e))?;
        let config_file = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| Error::other(format!("Invalid configuration path: {}", path.display())))?
            .to_string();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Ok(Self { dir, config_file })
    }

    /// Resolve from `PROCMGR_CONFIG_PATH`, falling back to `procmgr.json` in the
    /// current directory.
    pub fn resolve() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::other("Could not read current directory").because_of(&e))?;
        Self::resolve_with(std::env::var_os(CONFIG_PATH_ENV), &cwd)
    }

    pub(crate) fn resolve_with(env_value: Option<OsString>, cwd: &Path) -> Result<Self> {
        let from_env = env_value.filter(|v| !v.is_empty());
        let path = match &from_env {
            Some(value) => cwd.join(value),
            None => cwd.join(DEFAULT_CONFIG_FILE),
        };

        if std::fs::File::open(&path).is_err() {
            let message = match from_env {
                Some(_) => format!(
                    "Could not resolve home: \"{CONFIG_PATH_ENV}\" is set to \"{}\", which can't be read.",
                    path.display()
                ),
                None => format!(
                    "Could not resolve home: \"{CONFIG_PATH_ENV}\" is not set and \"{DEFAULT_CONFIG_FILE}\" was not found in current working directory."
                ),
            };
            return Err(Error::other(message));
        }

        Self::from_config_path(&path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(&self.config_file)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }
}

/// Declared configuration of one supervised service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    /// Executable, relative paths resolve from the service home.
    pub bin_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// Service home, relative paths resolve from the manager home.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// `KEY=VALUE` file loaded before `env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    /// Do not pass the manager's own environment to the child.
    #[serde(default, skip_serializing_if = "is_false")]
    pub clean_env: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
    /// `None`: never restart, `Some(0)`: unlimited, `Some(n)`: at most n restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    /// Milliseconds before an auto-restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_restart_exit_codes: Vec<i32>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, bin_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bin_path: bin_path.into(),
            arguments: Vec::new(),
            home: None,
            env: BTreeMap::new(),
            env_file: None,
            clean_env: false,
            disabled: false,
            max_restarts: None,
            restart_delay: None,
            no_restart_exit_codes: Vec::new(),
        }
    }

    pub fn validate(&self, home_dir: &Path) -> Result<()> {
        non_empty("name", &self.name)?;
        non_empty("binPath", &self.bin_path)?;

        if let Some(delay) = self.restart_delay
            && !(MIN_RESTART_DELAY_MS..=MAX_RESTART_DELAY_MS).contains(&delay)
        {
            return Err(Error::business(format!(
                "Service \"{}\": restartDelay must be between {MIN_RESTART_DELAY_MS} and {MAX_RESTART_DELAY_MS} ms (got {delay})",
                self.name
            )));
        }

        if let Some(ref home) = self.home {
            non_empty("home", home)?;
            let abs_home = home_dir.join(home);
            if !abs_home.is_dir() {
                return Err(Error::business(format!(
                    "Service \"{}\": home \"{}\" is not a directory",
                    self.name,
                    abs_home.display()
                )));
            }
        }
        Ok(())
    }

    pub fn abs_home(&self, home_dir: &Path) -> PathBuf {
        match self.home {
            Some(ref home) => home_dir.join(home),
            None => home_dir.to_path_buf(),
        }
    }

    pub fn abs_bin_path(&self, home_dir: &Path) -> PathBuf {
        self.abs_home(home_dir).join(&self.bin_path)
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RESTART_DELAY)
    }
}

/// Persisted manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManagerConfig {
    pub name: String,
    pub description: String,
    pub port: u16,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_owner: Option<String>,
    #[serde(default = "default_true")]
    pub auto_start_services: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_log_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_log_files: Option<u32>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Derived from the protocol version on every validation, never written back.
    #[serde(default, skip_serializing)]
    pub version: String,
}

impl ManagerConfig {
    /// Check every field and derive `version`.
    pub fn validate(&mut self, home: &Home) -> Result<()> {
        self.version = PROTOCOL_VERSION.to_string();

        non_empty("name", &self.name)?;
        non_empty("description", &self.description)?;
        non_empty("secret", &self.secret)?;
        if self.port == 0 {
            return Err(Error::business("Invalid configuration: \"port\" must be between 1 and 65535"));
        }
        if let Some(ref owner) = self.process_owner {
            non_empty("processOwner", owner)?;
        }
        if let Some(size) = self.max_log_size
            && size < MIN_MAX_LOG_SIZE
        {
            return Err(Error::business(format!(
                "Invalid configuration: \"maxLogSize\" must be at least {MIN_MAX_LOG_SIZE}"
            )));
        }
        if let Some(files) = self.max_log_files
            && files < MIN_MAX_LOG_FILES
        {
            return Err(Error::business(format!(
                "Invalid configuration: \"maxLogFiles\" must be at least {MIN_MAX_LOG_FILES}"
            )));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            service.validate(home.dir())?;
            if !names.insert(service.name.as_str()) {
                return Err(Error::business(format!(
                    "Invalid configuration: duplicate service name \"{}\"",
                    service.name
                )));
            }
        }
        Ok(())
    }

    pub fn max_log_size(&self) -> u64 {
        self.max_log_size.unwrap_or(DEFAULT_MAX_LOG_SIZE)
    }

    pub fn max_log_files(&self) -> u32 {
        self.max_log_files.unwrap_or(DEFAULT_MAX_LOG_FILES)
    }

    /// Configuration without services, secret, and version, for log lines.
    pub fn summary(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("services");
            map.remove("secret");
        }
        value
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::business(format!(
            "Invalid configuration: \"{field}\" must be a non-empty string"
        )));
    }
    Ok(())
}

/// Read, parse, and validate the configuration file of `home`.
pub fn load(home: &Home) -> Result<ManagerConfig> {
    let path = home.config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::other("Configuration file not found").because_of(&e));
        }
        Err(e) => {
            return Err(Error::other(format!("Could not read \"{}\"", path.display())).because_of(&e));
        }
    };

    let mut config: ManagerConfig = serde_json::from_str(&contents)
        .map_err(|e| Error::business(format!("Could not load configuration file ({e})")))?;
    config.validate(home)?;
    debug!(
        "loaded configuration from {} ({} service(s))",
        path.display(),
        config.services.len()
    );
    Ok(config)
}

/// Write `config` to the home's configuration file.
///
/// The file is written to a fresh temporary file next to its target and
/// renamed into place, so a crash leaves the previous version intact and two
/// writers never share a temporary file.
pub async fn save(home: &Home, config: &ManagerConfig) -> Result<()> {
    let path = home.config_path();
    let mut contents = serde_json::to_string_pretty(config)?;
    contents.push('\n');

    let dir = home.dir().to_path_buf();
    let target = path.clone();
    let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        // NamedTempFile is created with mode 0600.
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::other("Configuration writer task failed").because_of(&e))?;
    written.map_err(|e| {
        Error::other(format!("Could not write configuration file \"{}\"", path.display()))
            .because_of(&e)
    })?;
    debug!("saved configuration to {}", path.display());
    Ok(())
}
