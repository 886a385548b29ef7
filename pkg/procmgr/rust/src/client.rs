// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{ManagerConfig, ServiceSpec};
use crate::error::{Condition, Error, ErrorKind, Result};
use crate::protocol::{Envelope, Failure, PROTOCOL_VERSION, QueryOptions, Success};
use crate::state::{NamedState, ServiceDetails};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Pause after `kill` so the manager can release its port.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// Budget per service for start/stop requests.
const PER_SERVICE_TIMEOUT: Duration = Duration::from_secs(3);

/// Client side of the control protocol.
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    port: u16,
    secret: String,
    version: String,
}

impl ProtocolClient {
    pub fn new(port: u16, secret: &str, version: &str) -> Self {
        Self {
            port,
            secret: secret.to_string(),
            version: version.to_string(),
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.port, &config.secret, PROTOCOL_VERSION)
    }

    /// Send `action` and return the response content.
    ///
    /// Communication failures are retried `opts.retries` times; protocol and
    /// handler failures are returned at once.
    pub async fn query(&self, action: &str, options: Value, opts: QueryOptions) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match self.query_once(action, &options, opts.timeout).await {
                Ok(content) => return Ok(content),
                Err(e) if e.kind() == ErrorKind::Communication && attempt < opts.retries => {
                    attempt += 1;
                    debug!(
                        "query {action} failed (attempt {attempt}/{}): {}",
                        opts.retries + 1,
                        e.full_message()
                    );
                    sleep(opts.retry_delay).await;
                }
                Err(e) => {
                    warn!("query {action} failed: {}", e.full_message());
                    return Err(e);
                }
            }
        }
    }

    async fn query_once(&self, action: &str, options: &Value, limit: Duration) -> Result<Value> {
        let envelope = Envelope::new(action, options.clone(), &self.secret, &self.version);
        let body = serde_json::to_vec(&envelope)?;

        let (status, bytes) = timeout(limit, self.exchange(body)).await.map_err(|_| {
            Error::communication(format!(
                "Request \"{action}\" timed out after {}ms",
                limit.as_millis()
            ))
            .with_condition(Condition::Timeout)
        })??;
        self.decode(status, &bytes)
    }

    /// One raw POST on a fresh connection.
    pub(crate) async fn exchange(&self, body: Vec<u8>) -> Result<(StatusCode, Bytes)> {
        let send_failed = || Error::communication("Could not send request");

        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port))
            .await
            .map_err(|e| {
                let err = send_failed().because_of(&e);
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    err.with_condition(Condition::ConnectionRefused)
                } else {
                    err
                }
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| send_failed().because_of(&e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("connection closed: {e}");
            }
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(HOST, format!("127.0.0.1:{}", self.port))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| send_failed().because_of(&e))?;

        let res = sender
            .send_request(req)
            .await
            .map_err(|e| send_failed().because_of(&e))?;
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::communication("Could not read response").because_of(&e))?
            .to_bytes();
        Ok((status, bytes))
    }

    fn decode(&self, status: StatusCode, bytes: &[u8]) -> Result<Value> {
        if status != StatusCode::OK {
            let cause = serde_json::from_slice::<Failure>(bytes)
                .map(|f| f.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned());
            return Err(
                Error::protocol(format!("Unexpected HTTP status: {}", status.as_u16()))
                    .because(Error::other(cause)),
            );
        }

        let success: Success = serde_json::from_slice(bytes)
            .map_err(|e| Error::protocol("Invalid response").because_of(&e))?;
        if success.version != self.version {
            return Err(Error::protocol(format!(
                "Version mismatch (expected {}, got {})",
                self.version, success.version
            )));
        }
        Ok(success.content)
    }

    async fn query_as<T: DeserializeOwned>(
        &self,
        action: &str,
        options: Value,
        opts: QueryOptions,
    ) -> Result<T> {
        let content = self.query(action, options, opts).await?;
        serde_json::from_value(content).map_err(|e| {
            Error::protocol(format!("Unexpected content for \"{action}\"")).because_of(&e)
        })
    }

    /// `Ok(true)` when the manager answers. With `no_reject`, an unreachable
    /// manager is `Ok(false)` instead of an error.
    pub async fn ping(&self, opts: QueryOptions, no_reject: bool) -> Result<bool> {
        match self.query("ping", json!({}), opts).await {
            Ok(_) => Ok(true),
            Err(e) if no_reject && e.is_unreachable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_options(&self) -> Result<ManagerConfig> {
        self.query_as("getOptions", json!({}), QueryOptions::default())
            .await
    }

    pub async fn kill_server(&self) -> Result<()> {
        self.query("kill", json!({}), QueryOptions::default())
            .await?;
        sleep(KILL_GRACE).await;
        Ok(())
    }

    pub async fn add_service(&self, spec: &ServiceSpec) -> Result<()> {
        self.query("addService", serde_json::to_value(spec)?, QueryOptions::default())
            .await
            .map(drop)
    }

    pub async fn update_service(&self, spec: &ServiceSpec) -> Result<()> {
        self.query("updateService", serde_json::to_value(spec)?, QueryOptions::default())
            .await
            .map(drop)
    }

    pub async fn remove_service(&self, name: &str, force: bool) -> Result<()> {
        let opts = QueryOptions::default().with_timeout(PER_SERVICE_TIMEOUT);
        self.query("removeService", json!({"name": name, "force": force}), opts)
            .await
            .map(drop)
    }

    pub async fn get_services_state(&self) -> Result<Vec<NamedState>> {
        self.query_as("getServicesState", json!({}), QueryOptions::default())
            .await
    }

    pub async fn get_services(&self) -> Result<Vec<String>> {
        self.query_as("getServices", json!({}), QueryOptions::default())
            .await
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceDetails> {
        self.query_as("getService", json!({"name": name}), QueryOptions::default())
            .await
    }

    /// Start every service; `service_count` scales the timeout.
    pub async fn start_services(&self, service_count: usize) -> Result<Vec<u32>> {
        let opts = QueryOptions::default().with_timeout(bulk_timeout(service_count));
        self.query_as("startServices", json!({}), opts).await
    }

    pub async fn stop_services(&self, service_count: usize, force: bool) -> Result<()> {
        let opts = QueryOptions::default().with_timeout(bulk_timeout(service_count));
        self.query("stopServices", json!({"force": force}), opts)
            .await
            .map(drop)
    }

    pub async fn start_service(&self, name: &str) -> Result<Option<u32>> {
        let opts = QueryOptions::default().with_timeout(PER_SERVICE_TIMEOUT);
        self.query_as("startService", json!({"name": name}), opts)
            .await
    }

    pub async fn stop_service(&self, name: &str, force: bool) -> Result<()> {
        let opts = QueryOptions::default().with_timeout(PER_SERVICE_TIMEOUT);
        self.query("stopService", json!({"name": name, "force": force}), opts)
            .await
            .map(drop)
    }
}

fn bulk_timeout(service_count: usize) -> Duration {
    PER_SERVICE_TIMEOUT * service_count.max(1) as u32
}
