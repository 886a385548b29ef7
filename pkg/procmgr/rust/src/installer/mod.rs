// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Registration of the manager with the host's init system.

pub mod template;
mod unix;

pub use template::TemplateVars;
pub use unix::{InitSystem, UnixInstaller};

use crate::error::{Error, Result};
use std::future::Future;

/// Native service registration for the manager itself.
pub trait PlatformInstaller: Send + Sync {
    /// Human readable name of the init system, e.g. `Systemd`.
    fn service_system_name(&self) -> &str;

    fn is_admin(&self) -> bool;

    fn is_installed(&self) -> impl Future<Output = Result<bool>> + Send;

    fn install(&self) -> impl Future<Output = Result<()>> + Send;

    fn uninstall(&self) -> impl Future<Output = Result<()>> + Send;

    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    fn stop(&self) -> impl Future<Output = Result<()>> + Send;

    fn check_admin(&self, action: &str) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(Error::business(format!("You need administrator access to {action}")))
        }
    }
}
