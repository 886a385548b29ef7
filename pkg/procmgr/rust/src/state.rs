// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    /// No child process.
    Stopped,
    /// A spawn is in flight.
    Starting,
    /// Child process is alive.
    Running,
}

impl ServicePhase {
    pub fn is_alive(self) -> bool {
        self == ServicePhase::Running
    }

    pub(crate) fn can_transition_to(self, next: ServicePhase) -> bool {
        use ServicePhase::*;
        matches!(
            (self, next),
            (Stopped, Starting) | (Starting, Running) | (Starting, Stopped) | (Running, Stopped)
        )
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServicePhase::Stopped => write!(f, "stopped"),
            ServicePhase::Starting => write!(f, "starting"),
            ServicePhase::Running => write!(f, "running"),
        }
    }
}

/// Runtime state of one service, as reported over the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub started: bool,
    pub pid: Option<u32>,
    /// Epoch milliseconds of the last successful spawn.
    pub start_time: Option<u64>,
    /// Epoch milliseconds of the last exit.
    pub stop_time: Option<u64>,
    pub exit_code: Option<i32>,
    /// Name of the terminating signal, e.g. `SIGTERM`.
    pub exit_signal: Option<String>,
    /// Auto-restarts since the last manual start.
    pub restarts: u32,
    pub disabled: bool,
}

impl ServiceState {
    pub fn phase(&self) -> ServicePhase {
        if self.started {
            ServicePhase::Running
        } else {
            ServicePhase::Stopped
        }
    }
}

/// One entry of `getServicesState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedState {
    pub name: String,
    pub state: ServiceState,
}

/// Answer of `getService`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetails {
    pub options: ServiceSpec,
    pub state: ServiceState,
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
