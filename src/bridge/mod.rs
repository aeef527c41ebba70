//! Bridge to the command-and-control collaborator.
//!
//! The collaborator is an external component that executes scripts inside the
//! client under test and reports coverage. This crate only starts and stops it
//! next to the plain listener and forwards the test-facing operations.

use std::net::SocketAddr;
use std::sync::OnceLock;

use async_trait::async_trait;
use axum::Router;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Boxed error returned by collaborator implementations.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No command-and-control collaborator is attached")]
    NotAttached,

    #[error("Failed to serialize injected values: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Collaborator failed: {0}")]
    Collaborator(#[source] CollaboratorError),
}

/// A script to run inside the client under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Script {
    pub script_content: String,
    /// File name reported in stack traces of the script.
    pub stack_file_name: String,
}

/// The command-and-control collaborator.
#[async_trait]
pub trait CommandAndControl: Send + Sync {
    /// Extra routes mounted on the plain listener.
    fn routes(&self) -> Option<Router> {
        None
    }

    /// Called once the plain listener is bound.
    async fn start(&self, addr: SocketAddr) -> Result<(), CollaboratorError>;

    async fn stop(&self) -> Result<(), CollaboratorError>;

    /// Resolve once a client has connected back to the collaborator.
    async fn wait_for_active_connection(&self) -> Result<(), CollaboratorError>;

    async fn run_script(&self, script: Script) -> Result<Value, CollaboratorError>;

    async fn report_code_coverage(&self) -> Result<Value, CollaboratorError>;
}

const DEFAULT_SCRIPT_NAME: &str = "integrationTest";

/// Opening `async () => {` and the final `}` of a function source.
static WRAPPER_REGEX: OnceLock<Regex> = OnceLock::new();

fn wrapper_regex() -> &'static Regex {
    WRAPPER_REGEX.get_or_init(|| Regex::new(r"^async\s*\(\)\s*=>\s*\{|\}$").unwrap())
}

/// Source text of an `async () => { ... }` function to be run as a script.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    name: Option<String>,
    source: String,
}

impl ScriptFunction {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            name: None,
            source: source.into(),
        }
    }

    pub fn named(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            source: source.into(),
        }
    }

    /// Unwrap the function body and prefix it with `const injected = <json>;`.
    pub fn to_script<T: Serialize + ?Sized>(&self, injected: &T) -> Result<Script, BridgeError> {
        let injected = serde_json::to_string(injected)?;
        let body = wrapper_regex().replace_all(self.source.trim(), "");
        let name = match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_SCRIPT_NAME,
        };

        Ok(Script {
            script_content: format!("const injected = {injected};{body}"),
            stack_file_name: format!("{name}.js"),
        })
    }
}
