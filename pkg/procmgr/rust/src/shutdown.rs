// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::registry::ServiceRegistry;
use log::{error, info, warn};
use tokio::task::JoinHandle;

/// SIGTERM every service, SIGKILL the ones still alive after the stop
/// timeout, then stop answering requests.
///
/// Pending auto-restarts are cancelled for every service before the first
/// one is stopped, so no child is spawned while the others wind down.
pub async fn shutdown_all(registry: &ServiceRegistry, server: Option<JoinHandle<()>>) {
    info!("cleanup before exit");

    let services = registry.services();
    for service in &services {
        service.cancel_restart();
    }
    for service in &services {
        if let Err(e) = service.stop().await {
            warn!("[{}] {}, sending SIGKILL", service.name(), e.full_message());
            if let Err(e) = service.kill().await {
                error!("[{}] still running after SIGKILL, giving up: {}", service.name(), e.full_message());
            }
        }
    }

    if let Some(server) = server {
        server.abort();
    }
    info!("goodbye");
    log::logger().flush();
}
