//! Router setup for both listeners.
//!
//! # Responsibilities
//! - Create the Axum Router with every fault-injection route
//! - Wire up middleware (directives, panic catching, request logging)
//! - Mount the collaborator's routes next to the built-in ones
//! - Provide the fixed responder used by the untrusted TLS listener

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::http::directives::directives_middleware;
use crate::http::error::handle_panic;
use crate::http::routes;
use crate::http::static_files::{self, StaticContent};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub static_content: Arc<StaticContent>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            static_content: Arc::new(StaticContent::new(&config.content.static_root)),
        }
    }
}

/// Build the plain listener's router with all middleware layers.
///
/// `extra` is merged in before the middleware is applied, so collaborator
/// routes see the same directives and error handling as the built-in ones.
pub fn build_router(config: &ServerConfig, extra: Option<Router>) -> Router {
    let mut router = Router::new()
        .route("/", get(routes::root))
        .route("/static", get(static_files::static_index))
        .route("/static/", get(static_files::static_index))
        .route("/static/{*path}", get(static_files::static_content))
        .route("/404", get(routes::not_found))
        .route("/empty", get(routes::empty))
        .route("/no-reply", get(routes::no_reply))
        .route("/unexpected-close", get(routes::unexpected_close))
        .route("/redirect/307", get(routes::redirect_307))
        .route("/redirect/html", get(routes::redirect_html))
        .route("/headers/json", get(routes::headers_json))
        .route("/headers/html", get(routes::headers_html))
        .fallback(routes::not_found)
        .with_state(AppState::new(config));

    if let Some(extra) = extra {
        router = router.merge(extra);
    }

    let router = router
        .layer(middleware::from_fn(directives_middleware))
        .layer(CatchPanicLayer::custom(handle_panic));

    if config.observability.access_log {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Router of the untrusted TLS listener: every request gets `200 Hello!`.
pub fn untrusted_tls_router() -> Router {
    Router::new().fallback(hello)
}

async fn hello() -> impl IntoResponse {
    (StatusCode::OK, "Hello!")
}
