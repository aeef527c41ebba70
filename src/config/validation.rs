//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0)
//! - Check that the static root and TLS fixtures exist where they are needed
//! - Detect two listeners configured on the same fixed port
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::path::PathBuf;

use thiserror::Error;

use crate::config::schema::ServerConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.listen_host must not be empty")]
    EmptyHost,

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("content.static_root {0:?} is not a directory")]
    MissingStaticRoot(PathBuf),

    #[error("TLS fixture {0:?} does not exist")]
    MissingTlsFixture(PathBuf),

    #[error("plain and untrusted TLS listeners both configured on port {0}")]
    PortConflict(u16),
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.listen_host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }

    if config.timeouts.idle_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("idle_secs"));
    }
    if config.timeouts.keepalive_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("keepalive_secs"));
    }

    if !config.content.static_root.is_dir() {
        errors.push(ValidationError::MissingStaticRoot(
            config.content.static_root.clone(),
        ));
    }

    if let Some(tls_port) = config.listener.bad_tls_listen_port {
        for path in [&config.content.tls_key_path, &config.content.tls_cert_path] {
            if !path.is_file() {
                errors.push(ValidationError::MissingTlsFixture(path.clone()));
            }
        }
        // Port 0 is OS-assigned, so two zeros never collide.
        if tls_port != 0 && tls_port == config.listener.listen_port {
            errors.push(ValidationError::PortConflict(tls_port));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
