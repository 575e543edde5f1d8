//! HTTP side of the gateway: validates provider callbacks and acknowledges them.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, ValidationError};
use crate::types::{DeliveryReason, DeliveryResult, InboundCallback};

/// How long a connection over the limit may take to read its 503.
const REJECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ListenerState {
    config: Arc<WebhookConfig>,
    methods: Arc<Vec<Method>>,
    dispatcher: Dispatcher,
}

impl ListenerState {
    fn ack(&self) -> Response {
        let status = StatusCode::from_u16(self.config.ack_status).unwrap_or(StatusCode::OK);
        (status, self.config.ack_body.clone()).into_response()
    }

    fn respond(&self, result: DeliveryResult) -> Response {
        match result.reason {
            DeliveryReason::Accepted => self.ack(),
            DeliveryReason::Backpressure => StatusCode::from_u16(self.config.busy_status)
                .unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
                .into_response(),
            DeliveryReason::PipelineFailed(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    fn method_not_allowed(&self) -> Response {
        let allow = self
            .methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let mut response = ValidationError::MethodNotAllowed.into_response();
        if let Ok(value) = HeaderValue::from_str(&allow) {
            response.headers_mut().insert(header::ALLOW, value);
        }
        response
    }
}

/// Build the router serving `config.full_path()` with the given methods.
pub fn router(config: Arc<WebhookConfig>, methods: Vec<Method>, dispatcher: Dispatcher) -> Router {
    let path = config.full_path();
    let state = ListenerState {
        config,
        methods: Arc::new(methods),
        dispatcher,
    };

    Router::new()
        .route(&path, any(handle_callback))
        .with_state(state)
}

async fn handle_callback(State(state): State<ListenerState>, request: Request) -> Response {
    let source_address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    if !state.methods.contains(&parts.method) {
        debug!(%path, method = %parts.method, "rejecting method");
        return state.method_not_allowed();
    }

    let body = match read_body(body, &parts.headers, state.config.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            warn!(%path, limit = state.config.max_body_size, "rejecting oversized body");
            return e.into_response();
        }
    };

    if let Some(secret) = &state.config.secret {
        if !state.config.signature.verify(secret, &parts.headers, &body) {
            warn!(%path, source = ?source_address, "signature verification failed");
            return ValidationError::BadSignature.into_response();
        }
    }

    let callback = InboundCallback::new(parts.method, path, parts.headers, body, source_address);
    let callback_id = callback.id;
    debug!(%callback_id, "callback validated");

    let mut pending = match state.dispatcher.dispatch(callback) {
        Ok(pending) => pending,
        Err(rejected) => return state.respond(rejected),
    };

    match tokio::time::timeout(state.config.ack_timeout(), pending.wait_mut()).await {
        Ok(result) => state.respond(result),
        Err(_) if state.config.sync_ack => {
            // The provider wants the processing outcome; it will retry.
            warn!(%callback_id, "pipeline outcome not ready before ack timeout");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        Err(_) => {
            // Acknowledge anyway so the provider does not retry; delivery
            // carries on in the background.
            info!(%callback_id, "pipeline slower than ack timeout, acknowledging early");
            state.ack()
        }
    }
}

async fn read_body(
    body: Body,
    headers: &axum::http::HeaderMap,
    limit: usize,
) -> Result<bytes::Bytes, ValidationError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if matches!(declared, Some(len) if len > limit) {
        return Err(ValidationError::BodyTooLarge);
    }
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| ValidationError::BodyTooLarge)
}

/// Bind the listening socket without serving yet.
pub async fn bind(address: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| GatewayError::Bind {
            address: address.to_string(),
            source,
        })
}

/// A running server, stopped through [`ListenerHandle::shutdown`].
pub struct ListenerHandle {
    local_addr: SocketAddr,
    drain: CancellationToken,
    close: CancellationToken,
    task: JoinHandle<()>,
}

/// Start serving `router` on an already bound listener, holding at most
/// `max_connections` connections open.
pub fn serve(
    listener: TcpListener,
    router: Router,
    max_connections: usize,
) -> Result<ListenerHandle, GatewayError> {
    let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind {
        address: "bound listener".to_string(),
        source,
    })?;
    let drain = CancellationToken::new();
    let close = CancellationToken::new();
    let slots = Arc::new(Semaphore::new(max_connections));

    let task = tokio::spawn(accept_loop(listener, router, slots, drain.clone(), close.clone()));
    info!(%local_addr, max_connections, "listener started");

    Ok(ListenerHandle {
        local_addr,
        drain,
        close,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    slots: Arc<Semaphore>,
    drain: CancellationToken,
    close: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = drain.cancelled() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "connection task failed");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => match slots.clone().try_acquire_owned() {
                    Ok(permit) => {
                        connections.spawn(serve_connection(
                            stream,
                            remote,
                            router.clone(),
                            permit,
                            drain.clone(),
                        ));
                    }
                    Err(_) => {
                        warn!(%remote, "connection limit reached, rejecting connection");
                        connections.spawn(reject_connection(stream));
                    }
                },
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    drop(listener);
    debug!(open = connections.len(), "stopped accepting, draining connections");

    loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => {
                warn!(open = connections.len(), "closing remaining connections");
                connections.shutdown().await;
                break;
            }
            joined = connections.join_next() => match joined {
                Some(_) => {}
                None => break,
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    router: Router,
    _permit: OwnedSemaphorePermit,
    drain: CancellationToken,
) {
    let service = router.map_request(move |mut request: axum::http::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        request
    });
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = drain.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };
    if let Err(e) = result {
        debug!(%remote, error = %e, "connection closed with error");
    }
}

async fn reject_connection(stream: TcpStream) {
    let service = hyper::service::service_fn(|_request: axum::http::Request<Incoming>| async {
        Ok::<_, Infallible>(StatusCode::SERVICE_UNAVAILABLE.into_response())
    });
    let conn = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);
    let _ = tokio::time::timeout(REJECT_TIMEOUT, conn).await;
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let open connections finish for up to `grace`, then
    /// close whatever is left.
    pub async fn shutdown(self, grace: Duration) -> Result<(), GatewayError> {
        let ListenerHandle {
            local_addr,
            drain,
            close,
            mut task,
        } = self;
        drain.cancel();

        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {
                info!(%local_addr, "listener drained");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(%local_addr, error = %e, "listener task failed");
                Ok(())
            }
            Err(_) => {
                close.cancel();
                if let Err(e) = task.await {
                    warn!(%local_addr, error = %e, "listener task failed");
                }
                warn!(%local_addr, ?grace, "drain grace elapsed, connections closed");
                Err(GatewayError::ShutdownTimeout("listener drain"))
            }
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
