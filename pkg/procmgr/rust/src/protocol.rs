// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Wire format shared by the manager and its clients.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Both sides must agree on this exactly.
pub const PROTOCOL_VERSION: &str = "0.1";

/// An inbound request as it appears on the wire, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub action: Value,
    #[serde(default)]
    pub options: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A request that passed validation. The secret is gone by now.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub action: String,
    pub options: Value,
}

impl Envelope {
    pub fn new(action: &str, options: Value, secret: &str, version: &str) -> Self {
        Self {
            action: Value::String(action.to_string()),
            options,
            secret: Some(secret.to_string()),
            version: Some(version.to_string()),
        }
    }

    /// Check action shape, version, then secret, in that order.
    pub fn validate(self, version: &str, secret: &str) -> Result<Request> {
        let action = match self.action {
            Value::String(action) if is_valid_action(&action) => action,
            other => return Err(Error::protocol(format!("Invalid action ({other})"))),
        };

        let got = self.version.as_deref().unwrap_or("undefined");
        if got != version {
            return Err(Error::protocol(format!(
                "Version mismatch (expected {version}, got {got})"
            )));
        }

        if self.secret.as_deref() != Some(secret) {
            return Err(Error::protocol("Wrong secret"));
        }

        Ok(Request {
            action,
            options: self.options,
        })
    }
}

fn is_valid_action(action: &str) -> bool {
    action.len() >= 2 && !action.starts_with('_') && !action.starts_with('$')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Success {
    pub content: Value,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub error: String,
    pub version: String,
}

/// Per-query client knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Bound on one whole request/response exchange.
    pub timeout: Duration,
    /// Extra attempts after the first one fails.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            retries: 0,
            retry_delay: Duration::from_millis(300),
        }
    }
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }
}
