// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{Error, Result};
use crate::protocol::{Envelope, Failure, Success};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Executes validated actions. Only actions the implementation matches
/// explicitly are reachable.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, action: &str, options: Value) -> impl Future<Output = Result<Value>> + Send;
}

pub fn unknown_action(action: &str) -> Error {
    Error::protocol(format!("Action \"{action}\" does not exist"))
}

struct Settings {
    version: String,
    secret: String,
}

/// Bind the control endpoint on loopback.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::business(format!("port {port} is already in use")).because_of(&e)
            } else {
                Error::other(format!("Could not listen on port {port}")).because_of(&e)
            }
        })
}

/// Accept connections forever, one task per connection.
pub async fn serve<H: ActionHandler + 'static>(
    listener: TcpListener,
    handler: Arc<H>,
    version: &str,
    secret: &str,
) {
    let settings = Arc::new(Settings {
        version: version.to_string(),
        secret: secret.to_string(),
    });

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("could not accept connection: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let handler = handler.clone();
        let settings = settings.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                let settings = settings.clone();
                async move { Ok::<_, Infallible>(handle_request(req, &*handler, &settings).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("error serving connection: {err}");
            }
        });
    }
}

async fn handle_request<H: ActionHandler>(
    req: Request<Incoming>,
    handler: &H,
    settings: &Settings,
) -> Response<BoxBody<Bytes, Infallible>> {
    match process(req, handler, settings).await {
        Ok(content) => json_response(
            StatusCode::OK,
            &Success {
                content,
                version: settings.version.clone(),
            },
        ),
        Err(e) => {
            if e.is_caller_error() {
                debug!("request rejected: {}", e.full_message());
            } else {
                error!("request failed: {}", e.full_message());
            }
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &Failure {
                    error: e.full_message(),
                    version: settings.version.clone(),
                },
            )
        }
    }
}

async fn process<H: ActionHandler>(
    req: Request<Incoming>,
    handler: &H,
    settings: &Settings,
) -> Result<Value> {
    let body = req
        .collect()
        .await
        .map_err(|e| Error::communication("Could not read request body").because_of(&e))?
        .to_bytes();
    if body.is_empty() {
        return Err(Error::protocol("Request body is missing"));
    }

    let envelope: Envelope =
        serde_json::from_slice(&body).map_err(|_| Error::protocol("JSON is invalid"))?;
    let request = envelope.validate(&settings.version, &settings.secret)?;

    if request.action != "ping" {
        info!("action {} {}", request.action, request.options);
    }
    handler.handle(&request.action, request.options).await
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody<Bytes, Infallible>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|e| {
        error!("Failed to serialize response: {e}");
        b"{}".to_vec()
    });
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{}")).boxed()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::ProtocolClient;
    use crate::error::ErrorKind;
    use crate::protocol::{PROTOCOL_VERSION, QueryOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct CountingHandler {
        pub calls: AtomicUsize,
    }

    impl ActionHandler for CountingHandler {
        async fn handle(&self, action: &str, options: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match action {
                "echo" => Ok(options),
                "fail" => Err(Error::business("Service not found")),
                _ => Err(unknown_action(action)),
            }
        }
    }

    async fn start_server(handler: Arc<CountingHandler>, secret: &str) -> u16 {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let secret = secret.to_string();
        tokio::spawn(async move { serve(listener, handler, PROTOCOL_VERSION, &secret).await });
        port
    }

    #[tokio::test]
    async fn test_round_trip() {
        let handler = Arc::new(CountingHandler::default());
        let port = start_server(handler.clone(), "s").await;
        let client = ProtocolClient::new(port, "s", PROTOCOL_VERSION);

        let content = client
            .query("echo", json!({"a": 1}), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(content, json!({"a": 1}));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_secret_never_reaches_handler() {
        let handler = Arc::new(CountingHandler::default());
        let port = start_server(handler.clone(), "s").await;
        let client = ProtocolClient::new(port, "not-the-secret", PROTOCOL_VERSION);

        let err = client
            .query("echo", json!({}), QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.matches("Unexpected HTTP status: 500"));
        assert!(err.matches("Wrong secret"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let handler = Arc::new(CountingHandler::default());
        let port = start_server(handler.clone(), "s").await;
        let client = ProtocolClient::new(port, "s", "0.0");

        let err = client
            .query("echo", json!({}), QueryOptions::default())
            .await
            .unwrap_err();
        assert!(err.matches("Version mismatch (expected 0.1, got 0.0)"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_errors_are_chained() {
        let handler = Arc::new(CountingHandler::default());
        let port = start_server(handler, "s").await;
        let client = ProtocolClient::new(port, "s", PROTOCOL_VERSION);

        let err = client
            .query("fail", Value::Null, QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.full_message(),
            "Unexpected HTTP status: 500 [because] Service not found"
        );

        let err = client
            .query("nope", Value::Null, QueryOptions::default())
            .await
            .unwrap_err();
        assert!(err.matches("Action \"nope\" does not exist"));
    }

    #[tokio::test]
    async fn test_malformed_bodies() {
        let handler = Arc::new(CountingHandler::default());
        let port = start_server(handler.clone(), "s").await;
        let client = ProtocolClient::new(port, "s", PROTOCOL_VERSION);

        let (status, body) = client.exchange(Vec::new()).await.unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let failure: Failure = serde_json::from_slice(&body).unwrap();
        assert_eq!(failure.error, "Request body is missing");
        assert_eq!(failure.version, PROTOCOL_VERSION);

        let (_, body) = client.exchange(b"{oops".to_vec()).await.unwrap();
        let failure: Failure = serde_json::from_slice(&body).unwrap();
        assert_eq!(failure.error, "JSON is invalid");

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = bind(port).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert_eq!(err.message(), format!("port {port} is already in use"));
    }
}
