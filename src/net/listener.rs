//! Plain HTTP listener with per-connection control.
//!
//! # Responsibilities
//! - Bind to the configured host/port and report the bound address
//! - Accept incoming TCP connections and serve HTTP/1.1 on each
//! - Enable TCP keep-alive and enforce the idle-socket timeout
//! - Reset a connection when a handler asks for it
//! - Close: stop accepting, drain in-flight requests, force-close stragglers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::{TokioIo, TokioTimer};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tower::ServiceExt;

use crate::config::TimeoutConfig;
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::net::connection::{
    Activity, ConnectionControl, ConnectionGuard, ConnectionTracker, TrackedStream,
};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an error.
    #[error("Failed to serve: {0}")]
    Serve(#[source] std::io::Error),

    /// The listener task panicked or was cancelled.
    #[error("Listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ListenerError {
    pub(crate) fn bind(host: &str, port: u16, source: std::io::Error) -> Self {
        ListenerError::Bind {
            address: format!("{host}:{port}"),
            source,
        }
    }
}

/// Socket and timeout settings for accepted connections.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub keepalive: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&TimeoutConfig> for ListenerSettings {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            keepalive: Duration::from_secs(config.keepalive_secs),
            idle_timeout: Duration::from_secs(config.idle_secs),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }
}

/// A bound plain HTTP listener serving a router.
///
/// The accept loop and every connection run as tasks owned by this value;
/// dropping it (or calling [`close`](Self::close)) ends all of them.
pub struct PlainListener {
    local_addr: SocketAddr,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    task: Option<JoinHandle<()>>,
}

impl PlainListener {
    /// Bind `host:port` and start serving `router`. Returns once the socket is listening.
    pub async fn bind(
        host: &str,
        port: u16,
        router: Router,
        settings: ListenerSettings,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ListenerError::bind(host, port, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ListenerError::bind(host, port, e))?;

        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();
        let task = tokio::spawn(accept_loop(
            listener,
            router,
            settings,
            tracker.clone(),
            shutdown.subscribe(),
        ));

        tracing::info!(
            address = %local_addr,
            idle_timeout_secs = settings.idle_timeout.as_secs(),
            keepalive_secs = settings.keepalive.as_secs(),
            "Listener bound"
        );

        Ok(Self {
            local_addr,
            tracker,
            shutdown,
            task: Some(task),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sockets currently open on this listener.
    pub fn live_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Stop accepting, let in-flight requests finish within the grace period,
    /// then force-close whatever is left. The port is free once this returns.
    pub async fn close(mut self) -> Result<(), ListenerError> {
        self.shutdown.trigger();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for PlainListener {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    settings: ListenerSettings,
    tracker: ConnectionTracker,
    mut signal: ShutdownSignal,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = signal.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = tracker.track(peer);
                    connections.spawn(serve_connection(
                        stream,
                        router.clone(),
                        settings,
                        guard,
                        signal.clone(),
                    ));
                }
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning.
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    tracing::debug!(live = connections.len(), "Listener stopped accepting, draining");

    let drained = tokio::time::timeout(settings.shutdown_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            remaining = connections.len(),
            "Force-closing connections after shutdown grace period"
        );
        connections.shutdown().await;
    }
}

fn configure_socket(stream: &TcpStream, keepalive: Duration) -> std::io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;
    stream.set_nodelay(true)
}

async fn serve_connection(
    stream: TcpStream,
    router: Router,
    settings: ListenerSettings,
    guard: ConnectionGuard,
    mut signal: ShutdownSignal,
) {
    let connection_id = guard.id();
    if let Err(e) = configure_socket(&stream, settings.keepalive) {
        tracing::debug!(connection_id = %connection_id, error = %e, "Failed to configure socket");
    }

    let control = ConnectionControl::default();
    let activity = Arc::new(Activity::new());
    let io = TokioIo::new(TrackedStream::new(stream, activity.clone(), control.clone()));

    let request_control = control.clone();
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(request_control.clone());
        router.clone().oneshot(request)
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Connection error");
                }
                break;
            }
            _ = control.reset_requested() => {
                tracing::debug!(connection_id = %connection_id, "Connection reset on request");
                break;
            }
            _ = activity.idle_for(settings.idle_timeout) => {
                tracing::debug!(connection_id = %connection_id, "Idle timeout, closing connection");
                break;
            }
            _ = signal.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
    // Dropping `conn` closes the socket; `guard` removes it from the live set.
}
