// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classification carried by every error, end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure (connection refused, send/receive failure, timeout).
    Communication,
    /// Malformed or disallowed exchange: bad JSON, wrong secret, version mismatch.
    Protocol,
    /// Expected domain failure, shown to the user without a cause dump.
    Business,
    /// Anything unexpected.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Timeout,
    ConnectionRefused,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    condition: Option<Condition>,
    #[source]
    cause: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            condition: None,
            cause: None,
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Chain `cause` below this error.
    pub fn because(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Chain a foreign error (and its own source chain) below this error.
    pub fn because_of(self, cause: &(dyn std::error::Error + 'static)) -> Self {
        self.because(Error::wrap(cause))
    }

    /// Convert any error into an `Other` error, keeping our own errors as they are.
    pub fn wrap(err: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(own) = err.downcast_ref::<Error>() {
            return own.clone();
        }
        Self {
            kind: ErrorKind::Other,
            message: err.to_string(),
            condition: None,
            cause: err.source().map(|source| Box::new(Error::wrap(source))),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// This error followed by each of its causes.
    pub fn chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |e| e.cause())
    }

    /// Messages of the whole chain joined with `[because]`.
    pub fn full_message(&self) -> String {
        self.chain()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join(" [because] ")
    }

    pub fn is_timeout(&self) -> bool {
        self.chain()
            .any(|e| e.condition == Some(Condition::Timeout))
    }

    /// True when the peer could not be reached at all (refused or timed out).
    pub fn is_unreachable(&self) -> bool {
        self.chain().any(|e| e.condition.is_some())
    }

    pub fn matches(&self, part: &str) -> bool {
        self.chain().any(|e| e.message.contains(part))
    }

    /// Business and protocol failures are the caller's fault, not the manager's.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Business | ErrorKind::Protocol)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::wrap(&err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::wrap(&err)
    }
}
