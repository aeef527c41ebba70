//! TLS fixture loading and the untrusted-certificate listener.
//!
//! The certificate is a self-signed root that no trust store contains, so a
//! correctly configured client must refuse the handshake.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::http::untrusted_tls_router;
use crate::net::listener::ListenerError;

/// Error type for loading the TLS fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Failed to read TLS fixture {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificate found in {0:?}")]
    NoCertificate(PathBuf),

    #[error("No private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid TLS fixture: {0}")]
    Rustls(#[source] std::io::Error),
}

async fn read_fixture(path: &Path) -> Result<Vec<u8>, FixtureError> {
    tokio::fs::read(path).await.map_err(|source| FixtureError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the untrusted certificate and its key into a rustls server config.
pub async fn load_untrusted_fixture(
    cert_path: &Path,
    key_path: &Path,
) -> Result<RustlsConfig, FixtureError> {
    let (cert, key) = tokio::try_join!(read_fixture(cert_path), read_fixture(key_path))?;

    // Check the PEM contents up front so a bad fixture names the file at fault.
    let has_cert = rustls_pemfile::certs(&mut cert.as_slice()).any(|c| c.is_ok());
    if !has_cert {
        return Err(FixtureError::NoCertificate(cert_path.to_path_buf()));
    }
    match rustls_pemfile::private_key(&mut key.as_slice()) {
        Ok(Some(_)) => {}
        Ok(None) | Err(_) => return Err(FixtureError::NoPrivateKey(key_path.to_path_buf())),
    }

    RustlsConfig::from_pem(cert, key)
        .await
        .map_err(FixtureError::Rustls)
}

/// HTTPS listener presenting the untrusted certificate. Every request that
/// gets past the handshake receives `200 Hello!`.
pub struct UntrustedTlsListener {
    local_addr: SocketAddr,
    handle: Handle,
    task: Option<JoinHandle<std::io::Result<()>>>,
    grace: Duration,
}

impl UntrustedTlsListener {
    pub async fn bind(
        host: &str,
        port: u16,
        tls: RustlsConfig,
        grace: Duration,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ListenerError::bind(host, port, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ListenerError::bind(host, port, e))?;
        let listener = listener
            .into_std()
            .map_err(|e| ListenerError::bind(host, port, e))?;

        let handle = Handle::new();
        let server = axum_server::from_tcp_rustls(listener, tls).handle(handle.clone());
        let task = tokio::spawn(async move {
            server
                .serve(untrusted_tls_router().into_make_service())
                .await
        });

        tracing::info!(address = %local_addr, "Untrusted TLS listener bound");

        Ok(Self {
            local_addr,
            handle,
            task: Some(task),
            grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sockets currently open on this listener.
    pub fn live_connections(&self) -> usize {
        self.handle.connection_count()
    }

    /// Stop accepting and close open connections, forcing them after the grace period.
    pub async fn close(mut self) -> Result<(), ListenerError> {
        self.handle.graceful_shutdown(Some(self.grace));
        match self.task.take() {
            Some(task) => task.await?.map_err(ListenerError::Serve),
            None => Ok(()),
        }
    }
}

impl Drop for UntrustedTlsListener {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.handle.shutdown();
        }
    }
}
