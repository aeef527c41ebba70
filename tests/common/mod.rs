//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fault_server::{ServerConfig, TestingServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Config listening on an OS-assigned loopback port.
pub fn loopback_config() -> ServerConfig {
    let mut config = ServerConfig::new("127.0.0.1", 0);
    config.observability.access_log = false;
    config
}

/// Start a testing server with `config`.
pub async fn start_server(config: ServerConfig) -> TestingServer {
    let mut server = TestingServer::new(config);
    server.start().await.expect("server should start");
    server
}

pub fn base_url(server: &TestingServer) -> String {
    format!("http://{}", server.listen_addr().unwrap())
}

/// Client that bypasses any system proxy and never reuses sockets.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

pub fn static_fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures/static")
        .join(name)
}

/// Outcome of a raw HTTP/1.1 exchange.
#[derive(Debug)]
pub enum RawOutcome {
    /// Bytes received before the server closed its side.
    Closed(Vec<u8>),
    /// The connection was reset.
    Reset(std::io::Error),
    /// Nothing arrived within the deadline.
    TimedOut,
}

/// Send a bare `GET path` on a fresh socket and read until close, reset or `deadline`.
pub async fn raw_get(addr: SocketAddr, path: &str, deadline: Duration) -> RawOutcome {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    match tokio::time::timeout(deadline, stream.read_to_end(&mut received)).await {
        Ok(Ok(_)) => RawOutcome::Closed(received),
        Ok(Err(e)) => RawOutcome::Reset(e),
        Err(_) => RawOutcome::TimedOut,
    }
}
