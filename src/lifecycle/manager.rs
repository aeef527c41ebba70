//! Dual server lifecycle.
//!
//! # Responsibilities
//! - Start the plain listener, the collaborator and the untrusted TLS listener in order
//! - Stop them in order, continuing past failures
//! - Expose the bound ports once their listeners exist
//! - Forward test-facing operations to the collaborator
//!
//! # Design Decisions
//! - A failed start tears down whatever already started and leaves the server `Stopped`
//! - Listener handles are owned fields; dropping the server closes everything

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::bridge::{BridgeError, CommandAndControl, Script, ScriptFunction};
use crate::config::ServerConfig;
use crate::http::build_router;
use crate::net::listener::{ListenerError, ListenerSettings, PlainListener};
use crate::net::tls::{load_untrusted_fixture, FixtureError, UntrustedTlsListener};

/// Where a [`TestingServer`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Error type for lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    #[error("{0} has not been started")]
    NotStarted(&'static str),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Fixture(#[from] FixtureError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

const MAIN_SERVER: &str = "Main server";
const BAD_TLS_SERVER: &str = "Bad-TLS server";

/// The test double: a plain HTTP listener with every fault-injection route,
/// plus an optional HTTPS listener presenting an untrusted certificate.
pub struct TestingServer {
    config: ServerConfig,
    state: ServerState,
    collaborator: Option<Arc<dyn CommandAndControl>>,
    collaborator_running: bool,
    plain: Option<PlainListener>,
    bad_tls: Option<UntrustedTlsListener>,
}

impl TestingServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: ServerState::Stopped,
            collaborator: None,
            collaborator_running: false,
            plain: None,
            bad_tls: None,
        }
    }

    /// Attach a command-and-control collaborator, started and stopped with the server.
    pub fn with_collaborator(mut self, collaborator: Arc<dyn CommandAndControl>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bind the listeners and start the collaborator.
    ///
    /// Only valid while stopped. On failure everything already started is torn
    /// down again and the error is returned.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state != ServerState::Stopped {
            return Err(LifecycleError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = ServerState::Starting;

        match self.start_all().await {
            Ok(()) => {
                self.state = ServerState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start testing server");
                if let Err(teardown) = self.teardown().await {
                    tracing::warn!(error = %teardown, "Teardown after failed start also failed");
                }
                self.state = ServerState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_all(&mut self) -> Result<(), LifecycleError> {
        let listener = &self.config.listener;
        let settings = ListenerSettings::from(&self.config.timeouts);
        let extra = self.collaborator.as_ref().and_then(|c| c.routes());
        let router = build_router(&self.config, extra);

        let plain = PlainListener::bind(
            &listener.listen_host,
            listener.listen_port,
            router,
            settings,
        )
        .await?;
        let plain_addr = plain.local_addr();
        self.plain = Some(plain);
        tracing::warn!(
            host = %listener.listen_host,
            port = plain_addr.port(),
            "Started main HTTP server"
        );

        if let Some(collaborator) = &self.collaborator {
            collaborator
                .start(plain_addr)
                .await
                .map_err(BridgeError::Collaborator)?;
            self.collaborator_running = true;
            tracing::info!(address = %plain_addr, "Command-and-control collaborator started");
        }

        if let Some(port) = listener.bad_tls_listen_port {
            let content = &self.config.content;
            let tls =
                load_untrusted_fixture(&content.tls_cert_path, &content.tls_key_path).await?;
            let grace = settings.shutdown_grace;
            let bad_tls =
                UntrustedTlsListener::bind(&listener.listen_host, port, tls, grace).await?;
            tracing::warn!(
                host = %listener.listen_host,
                port = bad_tls.local_addr().port(),
                "Started Bad-TLS HTTP server"
            );
            self.bad_tls = Some(bad_tls);
        }

        Ok(())
    }

    /// Stop the collaborator, then the plain listener, then the TLS listener.
    ///
    /// No-op while stopped. Every step runs even if an earlier one failed; the
    /// last error is returned.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            ServerState::Stopped => return Ok(()),
            ServerState::Running => {}
            state => {
                return Err(LifecycleError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }
        self.state = ServerState::Stopping;
        let result = self.teardown().await;
        self.state = ServerState::Stopped;
        tracing::warn!("Stopped");
        result
    }

    async fn teardown(&mut self) -> Result<(), LifecycleError> {
        let mut result = Ok(());

        if self.collaborator_running {
            self.collaborator_running = false;
            if let Some(collaborator) = &self.collaborator {
                match collaborator.stop().await {
                    Ok(()) => {
                        tracing::info!("Command-and-control collaborator has been stopped")
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "Failed to stop command-and-control collaborator"
                        );
                        result = Err(BridgeError::Collaborator(e).into());
                    }
                }
            }
        }

        if let Some(plain) = self.plain.take() {
            match plain.close().await {
                Ok(()) => tracing::info!("Main HTTP server has been closed"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to close main HTTP server");
                    result = Err(e.into());
                }
            }
        }

        if let Some(bad_tls) = self.bad_tls.take() {
            match bad_tls.close().await {
                Ok(()) => tracing::info!("Bad-TLS HTTP server has been closed"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to close Bad-TLS HTTP server");
                    result = Err(e.into());
                }
            }
        }

        result
    }

    /// Address of the plain listener.
    pub fn listen_addr(&self) -> Result<SocketAddr, LifecycleError> {
        self.plain
            .as_ref()
            .map(PlainListener::local_addr)
            .ok_or(LifecycleError::NotStarted(MAIN_SERVER))
    }

    /// Port of the plain listener.
    pub fn listen_port(&self) -> Result<u16, LifecycleError> {
        self.listen_addr().map(|addr| addr.port())
    }

    /// Port of the untrusted TLS listener.
    pub fn bad_tls_listen_port(&self) -> Result<u16, LifecycleError> {
        self.bad_tls
            .as_ref()
            .map(|listener| listener.local_addr().port())
            .ok_or(LifecycleError::NotStarted(BAD_TLS_SERVER))
    }

    /// Open sockets across both listeners.
    pub fn live_connections(&self) -> usize {
        let plain = self.plain.as_ref().map_or(0, PlainListener::live_connections);
        let bad_tls = self
            .bad_tls
            .as_ref()
            .map_or(0, UntrustedTlsListener::live_connections);
        plain + bad_tls
    }

    fn collaborator(&self) -> Result<&Arc<dyn CommandAndControl>, BridgeError> {
        self.collaborator.as_ref().ok_or(BridgeError::NotAttached)
    }

    pub async fn wait_for_active_cnc_connection(&self) -> Result<(), LifecycleError> {
        self.collaborator()?
            .wait_for_active_connection()
            .await
            .map_err(|e| BridgeError::Collaborator(e).into())
    }

    pub async fn run_script(&self, script: Script) -> Result<Value, LifecycleError> {
        tracing::debug!(stack_file_name = %script.stack_file_name, "Running script");
        self.collaborator()?
            .run_script(script)
            .await
            .map_err(|e| BridgeError::Collaborator(e).into())
    }

    /// Turn `function` into a script with `injected` bound as a constant and run it.
    pub async fn run_script_from_function<T: Serialize + ?Sized>(
        &self,
        function: &ScriptFunction,
        injected: &T,
    ) -> Result<Value, LifecycleError> {
        let script = function.to_script(injected)?;
        self.run_script(script).await
    }

    pub async fn report_code_coverage(&self) -> Result<Value, LifecycleError> {
        self.collaborator()?
            .report_code_coverage()
            .await
            .map_err(|e| BridgeError::Collaborator(e).into())
    }
}

impl Drop for TestingServer {
    fn drop(&mut self) {
        if self.state != ServerState::Stopped {
            tracing::debug!(state = %self.state, "Testing server dropped without stop()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CollaboratorError;
    use async_trait::async_trait;
    use axum::{routing::get, Router};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCollaborator {
        events: Mutex<Vec<String>>,
        fail_start: bool,
        fail_stop: bool,
    }

    impl RecordingCollaborator {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    #[async_trait]
    impl CommandAndControl for RecordingCollaborator {
        fn routes(&self) -> Option<Router> {
            Some(Router::new().route("/cnc", get(|| async { "cnc" })))
        }

        async fn start(&self, addr: SocketAddr) -> Result<(), CollaboratorError> {
            self.record(format!("start:{}", addr.port()));
            if self.fail_start {
                return Err("collaborator refused".into());
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), CollaboratorError> {
            self.record("stop");
            if self.fail_stop {
                return Err("collaborator would not stop".into());
            }
            Ok(())
        }

        async fn wait_for_active_connection(&self) -> Result<(), CollaboratorError> {
            self.record("wait");
            Ok(())
        }

        async fn run_script(&self, script: Script) -> Result<Value, CollaboratorError> {
            self.record(format!("run:{}", script.stack_file_name));
            Ok(json!({ "content": script.script_content }))
        }

        async fn report_code_coverage(&self) -> Result<Value, CollaboratorError> {
            self.record("coverage");
            Ok(json!({ "lines": 1 }))
        }
    }

    fn config() -> ServerConfig {
        ServerConfig::new("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn ports_are_unavailable_before_start() {
        let server = TestingServer::new(config());
        assert!(matches!(
            server.listen_port(),
            Err(LifecycleError::NotStarted(MAIN_SERVER))
        ));
        assert!(matches!(
            server.bad_tls_listen_port(),
            Err(LifecycleError::NotStarted(BAD_TLS_SERVER))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut server = TestingServer::new(config());
        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);

        let err = server.start().await.err().unwrap();
        assert!(matches!(
            err,
            LifecycleError::InvalidState {
                operation: "start",
                state: ServerState::Running
            }
        ));

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.listen_port().is_err());
    }

    #[tokio::test]
    async fn stop_while_stopped_is_a_no_op() {
        let mut server = TestingServer::new(config());
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn bad_tls_listener_is_optional() {
        let mut server = TestingServer::new(config().with_bad_tls_listen_port(0));
        server.start().await.unwrap();
        let plain = server.listen_port().unwrap();
        let bad_tls = server.bad_tls_listen_port().unwrap();
        assert_ne!(bad_tls, 0);
        assert_ne!(plain, bad_tls);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn collaborator_follows_the_server() {
        let collaborator = Arc::new(RecordingCollaborator::default());
        let mut server = TestingServer::new(config()).with_collaborator(collaborator.clone());

        server.start().await.unwrap();
        let port = server.listen_port().unwrap();
        server.wait_for_active_cnc_connection().await.unwrap();

        let function = ScriptFunction::named("scenario", "async () => { run(injected.n); }");
        let result = server
            .run_script_from_function(&function, &json!({ "n": 3 }))
            .await
            .unwrap();
        assert_eq!(result["content"], r#"const injected = {"n":3}; run(injected.n); "#);
        assert_eq!(server.report_code_coverage().await.unwrap()["lines"], 1);

        server.stop().await.unwrap();
        assert_eq!(
            collaborator.events(),
            vec![
                format!("start:{port}"),
                "wait".to_string(),
                "run:scenario.js".to_string(),
                "coverage".to_string(),
                "stop".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_collaborator_start_tears_down() {
        let collaborator = Arc::new(RecordingCollaborator {
            fail_start: true,
            ..Default::default()
        });
        let mut server = TestingServer::new(config()).with_collaborator(collaborator.clone());

        let err = server.start().await.err().unwrap();
        assert!(matches!(err, LifecycleError::Bridge(BridgeError::Collaborator(_))));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.listen_port().is_err());
        // Never started, so never stopped.
        assert_eq!(collaborator.events().len(), 1);
    }

    #[tokio::test]
    async fn failed_collaborator_stop_still_frees_both_ports() {
        let free_port = || {
            std::net::TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port()
        };
        let (plain, bad_tls) = (free_port(), free_port());
        let collaborator = Arc::new(RecordingCollaborator {
            fail_stop: true,
            ..Default::default()
        });
        let config = ServerConfig::new("127.0.0.1", plain).with_bad_tls_listen_port(bad_tls);
        let mut server = TestingServer::new(config).with_collaborator(collaborator.clone());
        server.start().await.unwrap();
        assert_eq!(server.listen_port().unwrap(), plain);
        assert_eq!(server.bad_tls_listen_port().unwrap(), bad_tls);

        let err = server.stop().await.err().unwrap();
        assert!(matches!(err, LifecycleError::Bridge(BridgeError::Collaborator(_))));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.listen_port().is_err());
        assert!(server.bad_tls_listen_port().is_err());
        assert_eq!(collaborator.events().last().map(String::as_str), Some("stop"));

        std::net::TcpListener::bind(("127.0.0.1", plain)).unwrap();
        std::net::TcpListener::bind(("127.0.0.1", bad_tls)).unwrap();
    }

    #[tokio::test]
    async fn missing_fixture_fails_start() {
        let mut config = config().with_bad_tls_listen_port(0);
        config.content.tls_key_path = config.content.tls_key_path.with_file_name("absent.key");
        let mut server = TestingServer::new(config);

        let err = server.start().await.err().unwrap();
        assert!(matches!(err, LifecycleError::Fixture(FixtureError::Read { .. })));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.listen_port().is_err());
    }

    #[tokio::test]
    async fn bridge_calls_need_a_collaborator() {
        let server = TestingServer::new(config());
        let err = server.report_code_coverage().await.err().unwrap();
        assert!(matches!(err, LifecycleError::Bridge(BridgeError::NotAttached)));
    }
}
