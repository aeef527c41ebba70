//! Behavior directives carried in the query string.
//!
//! | parameter            | effect                                                  |
//! |----------------------|---------------------------------------------------------|
//! | `waitBeforeResponse` | delay (ms) before the request reaches any route         |
//! | `noCache`            | presence-only; response gets headers that forbid caching |
//! | `bytesPerSecond`     | throttle streamed file bytes to this rate               |
//!
//! A missing parameter, or one with an empty value, means "no directive".
//! Anything else that is not a non-negative integer is rejected with 400.

use std::num::NonZeroU64;
use std::time::Duration;

use axum::{
    extract::{FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use url::form_urlencoded;

use crate::http::error::AppError;

pub const WAIT_BEFORE_RESPONSE: &str = "waitBeforeResponse";
pub const NO_CACHE: &str = "noCache";
pub const BYTES_PER_SECOND: &str = "bytesPerSecond";

/// Error raised for a directive whose value cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("query parameter {name} must be a non-negative integer, got {value:?}")]
    NotANumber { name: &'static str, value: String },

    #[error("query parameter {name} must be greater than zero")]
    Zero { name: &'static str },
}

/// Per-request behavior derived from the query string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDirectives {
    pub wait_before_response: Option<Duration>,
    pub no_cache: bool,
    pub bytes_per_second: Option<NonZeroU64>,
}

impl RequestDirectives {
    /// Parse directives from a raw (still percent-encoded) query string.
    ///
    /// The first non-empty occurrence of a numeric parameter wins.
    pub fn from_query(query: Option<&str>) -> Result<Self, DirectiveError> {
        let mut directives = Self::default();
        let Some(query) = query else {
            return Ok(directives);
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                WAIT_BEFORE_RESPONSE if directives.wait_before_response.is_none() => {
                    directives.wait_before_response =
                        parse_number(WAIT_BEFORE_RESPONSE, &value)?.map(Duration::from_millis);
                }
                BYTES_PER_SECOND if directives.bytes_per_second.is_none() => {
                    if let Some(rate) = parse_number(BYTES_PER_SECOND, &value)? {
                        let rate = NonZeroU64::new(rate)
                            .ok_or(DirectiveError::Zero { name: BYTES_PER_SECOND })?;
                        directives.bytes_per_second = Some(rate);
                    }
                }
                NO_CACHE => directives.no_cache = true,
                _ => {}
            }
        }

        Ok(directives)
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<Option<u64>, DirectiveError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|_| DirectiveError::NotANumber {
            name,
            value: value.to_string(),
        })
}

/// Whether `noCache` is present, regardless of the other directives.
fn requests_no_cache(query: Option<&str>) -> bool {
    query.is_some_and(|query| {
        form_urlencoded::parse(query.as_bytes()).any(|(key, _)| key == NO_CACHE)
    })
}

/// Headers that stop HTTP/1.1 clients, HTTP/1.0 clients and proxies from caching.
pub fn apply_no_cache(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// First stage of the plain listener's chain.
///
/// Parses the directives, serves the delay, hands the parsed value to the
/// routes through request extensions and stamps no-cache headers on whatever
/// comes back.
pub async fn directives_middleware(mut request: Request, next: Next) -> Response {
    let directives = match RequestDirectives::from_query(request.uri().query()) {
        Ok(directives) => directives,
        Err(e) => {
            let mut response = AppError::from(e).into_response();
            if requests_no_cache(request.uri().query()) {
                apply_no_cache(response.headers_mut());
            }
            return response;
        }
    };

    if let Some(wait) = directives.wait_before_response {
        tracing::debug!(
            path = %request.uri().path(),
            wait_ms = wait.as_millis() as u64,
            "Delaying request"
        );
        tokio::time::sleep(wait).await;
    }

    request.extensions_mut().insert(directives);
    let mut response = next.run(request).await;

    if directives.no_cache {
        apply_no_cache(response.headers_mut());
    }
    response
}

impl<S> FromRequestParts<S> for RequestDirectives
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(directives) = parts.extensions.get::<Self>() {
            return Ok(*directives);
        }
        Ok(Self::from_query(parts.uri.query())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_query_means_no_directives() {
        assert_eq!(RequestDirectives::from_query(None), Ok(RequestDirectives::default()));
        assert_eq!(
            RequestDirectives::from_query(Some("url=http://x")),
            Ok(RequestDirectives::default())
        );
    }

    #[test]
    fn parses_all_directives() {
        let query = "waitBeforeResponse=250&noCache&bytesPerSecond=1024";
        let directives = RequestDirectives::from_query(Some(query)).unwrap();
        assert_eq!(directives.wait_before_response, Some(Duration::from_millis(250)));
        assert!(directives.no_cache);
        assert_eq!(directives.bytes_per_second, NonZeroU64::new(1024));
    }

    #[test]
    fn no_cache_is_presence_only() {
        for query in ["noCache", "noCache=", "noCache=false", "a=1&noCache=0"] {
            let directives = RequestDirectives::from_query(Some(query)).unwrap();
            assert!(directives.no_cache, "{query}");
        }
    }

    #[test]
    fn empty_numeric_value_is_absent() {
        let directives =
            RequestDirectives::from_query(Some("waitBeforeResponse=&bytesPerSecond=")).unwrap();
        assert_eq!(directives, RequestDirectives::default());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = RequestDirectives::from_query(Some("waitBeforeResponse=soon")).unwrap_err();
        assert_eq!(
            err,
            DirectiveError::NotANumber {
                name: WAIT_BEFORE_RESPONSE,
                value: "soon".into()
            }
        );

        assert!(RequestDirectives::from_query(Some("bytesPerSecond=-5")).is_err());
        assert!(RequestDirectives::from_query(Some("bytesPerSecond=1.5")).is_err());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert_eq!(
            RequestDirectives::from_query(Some("bytesPerSecond=0")),
            Err(DirectiveError::Zero { name: BYTES_PER_SECOND })
        );
    }

    #[test]
    fn first_occurrence_wins() {
        let directives =
            RequestDirectives::from_query(Some("waitBeforeResponse=10&waitBeforeResponse=junk"))
                .unwrap();
        assert_eq!(directives.wait_before_response, Some(Duration::from_millis(10)));
    }

    #[test]
    fn no_cache_survives_a_rejected_directive() {
        let query = Some("noCache&bytesPerSecond=fast");
        assert!(RequestDirectives::from_query(query).is_err());
        assert!(requests_no_cache(query));
        assert!(!requests_no_cache(Some("bytesPerSecond=fast")));
        assert!(!requests_no_cache(None));
    }

    #[test]
    fn no_cache_headers() {
        let mut headers = HeaderMap::new();
        apply_no_cache(&mut headers);
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-store, must-revalidate");
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::EXPIRES], "0");
    }
}
