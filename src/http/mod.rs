//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Connection from net::listener
//!     → server.rs (Axum router, middleware stack)
//!     → directives.rs (parse query directives, delay, no-cache)
//!     → routes.rs / static_files.rs (route handler produces a response)
//!     → throttle.rs (optional pacing of streamed file bytes)
//!     → error.rs (4xx for bad input, generic 500 for everything else)
//!     → Send to client
//! ```

pub mod directives;
pub mod error;
pub mod escape;
pub mod routes;
pub mod server;
pub mod static_files;
pub mod throttle;

pub use directives::{DirectiveError, RequestDirectives};
pub use error::AppError;
pub use server::{build_router, untrusted_tls_router, AppState};
pub use throttle::ThrottledStream;
