//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, keep-alive, idle timeout, drain on close)
//!     → connection.rs (live-connection set, activity, reset requests)
//!     → Hand off to HTTP layer
//!
//! Untrusted TLS connection
//!     → tls.rs (fixture certificate, fixed "Hello!" responder)
//! ```
//!
//! # Design Decisions
//! - Each listener owns its connection tasks; closing it ends them all
//! - Stuck connections are force-closed once the drain grace period expires

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionControl, ConnectionTracker};
pub use listener::{ListenerError, ListenerSettings, PlainListener};
pub use tls::{load_untrusted_fixture, FixtureError, UntrustedTlsListener};
