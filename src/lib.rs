//! HTTP/HTTPS test double with fault injection.

pub mod bridge;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use bridge::{CommandAndControl, Script, ScriptFunction};
pub use config::schema::ServerConfig;
pub use lifecycle::{LifecycleError, ServerState, TestingServer};
