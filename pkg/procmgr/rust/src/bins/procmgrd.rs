// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Result, anyhow};
use procmgr::manager::Manager;

#[tokio::main]
async fn main() -> Result<()> {
    let manager = Manager::load().map_err(|e| anyhow!(e.full_message()))?;
    manager.run().await.map_err(|e| anyhow!(e.full_message()))?;
    Ok(())
}
