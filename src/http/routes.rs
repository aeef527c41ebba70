//! Fixed endpoints of the plain listener.
//!
//! Each handler is a function of the request (and its directives) only.
//! Delay and no-cache are applied around them by
//! [`directives_middleware`](crate::http::directives::directives_middleware).

use std::collections::BTreeMap;

use axum::{
    extract::{Query, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http::error::AppError;
use crate::http::escape::{encode_location, json_for_html};
use crate::net::connection::ConnectionControl;

pub const NOT_FOUND_BODY: &str = "Thing not found!";

const ROOT_HINT: &str = r#"<a href="/static">Interesting stuff is at /static"#;

const X_FOO_VALUE: &str = "Value for the X-Foo Header";
const X_BAR_VALUE: &str = "Value for the X-Bar Header";

/// Query of the redirect endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct RedirectParams {
    pub url: Option<String>,
}

/// `GET /`
pub async fn root() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html(ROOT_HINT))
}

/// `GET /404` and the fallback for everything unmatched.
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// `GET /empty`
pub async fn empty() -> impl IntoResponse {
    (StatusCode::OK, "")
}

/// `GET /no-reply`: accept the request and never answer it.
pub async fn no_reply() -> Response {
    tracing::debug!("Holding request without replying");
    std::future::pending().await
}

/// `GET /unexpected-close`: drop the socket without sending a single byte.
pub async fn unexpected_close(request: Request) -> Result<Response, AppError> {
    let control = request
        .extensions()
        .get::<ConnectionControl>()
        .cloned()
        .ok_or_else(|| {
            AppError::Internal("request did not arrive on a controllable connection".into())
        })?;

    tracing::debug!("Resetting connection on request");
    control.reset();
    // The connection task tears the socket down; this response is never written.
    Ok(std::future::pending().await)
}

/// `GET /redirect/307?url=...`
pub async fn redirect_307(Query(params): Query<RedirectParams>) -> Result<Response, AppError> {
    let url = params
        .url
        .ok_or_else(|| AppError::InvalidRequest("missing url query parameter".into()))?;
    let location = HeaderValue::from_str(&encode_location(&url))
        .map_err(|_| AppError::InvalidRequest(format!("url {url:?} is not a valid Location")))?;

    Ok((StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response())
}

/// `GET /redirect/html?url=...`: client-side navigation via script.
pub async fn redirect_html(Query(params): Query<RedirectParams>) -> impl IntoResponse {
    let target = json_for_html(&Value::String(params.url.unwrap_or_default()));
    let page = format!(
        "<!DOCTYPE html>
<html>
    <head>
        <title>JavaScript Redirect</title>
        <script>location.replace({target})</script>
    </head>
    <body>
        <p>Bye!</p>
    </body>
</html>
"
    );
    (StatusCode::OK, Html(page))
}

/// `GET /headers/json`
pub async fn headers_json(headers: HeaderMap) -> impl IntoResponse {
    (
        StatusCode::OK,
        custom_headers(),
        Json(json!({ "headers": request_headers(&headers) })),
    )
}

/// `GET /headers/html`
pub async fn headers_html(headers: HeaderMap) -> impl IntoResponse {
    let embedded = json_for_html(&Value::Object(
        request_headers(&headers).into_iter().collect(),
    ));
    let page = format!(
        "<!DOCTYPE html>
<html>
    <head>
        <title>Headers</title>
        <script>window.requestHeaders = {embedded}</script>
    </head>
    <body>
        <pre id=\"requestHeadersDisplay\"></pre>
        <script>requestHeadersDisplay.textContent = JSON.stringify(requestHeaders, null, 2)</script>
    </body>
</html>
"
    );
    (StatusCode::OK, custom_headers(), Html(page))
}

fn custom_headers() -> [(HeaderName, HeaderValue); 2] {
    [
        (HeaderName::from_static("x-foo"), HeaderValue::from_static(X_FOO_VALUE)),
        (HeaderName::from_static("x-bar"), HeaderValue::from_static(X_BAR_VALUE)),
    ]
}

/// Received headers by lower-case name; repeated headers are joined with `", "`.
pub fn request_headers(headers: &HeaderMap) -> BTreeMap<String, Value> {
    let mut out: BTreeMap<String, Value> = BTreeMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_string(), Value::String(joined));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("x-sample", HeaderValue::from_static("1"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let map = request_headers(&headers);
        assert_eq!(map["x-sample"], "1");
        assert_eq!(map["accept"], "text/html, application/json");
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn redirect_requires_url() {
        let err = redirect_307(Query(RedirectParams::default())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn redirect_sets_location() {
        let response = redirect_307(Query(RedirectParams {
            url: Some("http://example.test/x".into()),
        }))
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "http://example.test/x");
    }

    #[tokio::test]
    async fn unexpected_close_needs_a_connection() {
        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        let err = unexpected_close(request).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
