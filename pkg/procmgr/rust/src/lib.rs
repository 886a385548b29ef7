// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Single-host process manager.
//!
//! `procmgrd` supervises the services declared in a JSON configuration file
//! and answers a loopback HTTP/JSON control protocol. `procmgr` drives it:
//! launching, stopping, registering it with the init system, and querying
//! service state.

pub mod cache;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod facade;
pub mod installer;
pub mod lines;
pub mod logs;
pub mod manager;
pub mod menu;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod state;

pub use error::{Error, ErrorKind, Result};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `m`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
