//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (manager.rs):
//!     Stopped → Starting → bind plain listener → start collaborator
//!             → load fixture, bind untrusted TLS listener → Running
//!
//! Stop (manager.rs, shutdown.rs):
//!     Running → Stopping → stop collaborator → close plain listener
//!             → close TLS listener → Stopped
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Draining has a deadline; stragglers are force-closed after it

pub mod manager;
pub mod shutdown;

pub use manager::{LifecycleError, ServerState, TestingServer};
pub use shutdown::{Shutdown, ShutdownSignal};
