//! Static content under `/static`.
//!
//! A request walks an ordered chain of steps; each step either handles it or
//! defers to the next:
//!
//! ```text
//! resolve sub-path (reject escapes, no filesystem access yet)
//!     → serve_file        regular file → stream it (throttled on request)
//!     → directory_index   directory   → HTML listing
//!     → not found         anything else
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::http::directives::RequestDirectives;
use crate::http::error::AppError;
use crate::http::escape::{encode_path_segment, escape_html};
use crate::http::routes::not_found;
use crate::http::server::AppState;
use crate::http::throttle::ThrottledStream;

/// URL prefix the static root is mounted at.
pub const STATIC_PREFIX: &str = "/static";

/// Outcome of one step of a fallthrough chain.
pub enum Dispatch {
    /// The step produced the response.
    Handled(Response),
    /// The step does not apply; try the next one.
    Defer,
}

/// The read-only directory served under [`STATIC_PREFIX`].
#[derive(Debug, Clone)]
pub struct StaticContent {
    root: PathBuf,
}

impl StaticContent {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            root: normalize(&root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request sub-path against the root without touching the filesystem.
    ///
    /// The sub-path is always treated as relative. `..` segments are applied
    /// lexically and the result must stay inside the root.
    pub fn resolve(&self, sub_path: &str) -> Result<PathBuf, AppError> {
        let mut resolved = self.root.clone();
        for component in Path::new(sub_path).components() {
            match component {
                Component::Normal(part) if part.as_encoded_bytes().contains(&0) => {
                    return Err(AppError::InvalidRequest(format!(
                        "path {sub_path:?} contains a NUL byte"
                    )));
                }
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(AppError::InvalidRequest(format!(
                "path {sub_path:?} escapes the static root"
            )))
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// `GET /static/{*path}`
pub async fn static_content(
    State(state): State<AppState>,
    directives: RequestDirectives,
    UrlPath(sub_path): UrlPath<String>,
) -> Result<Response, AppError> {
    let content = &state.static_content;
    let path = content.resolve(&sub_path)?;

    if let Dispatch::Handled(response) = serve_file(&path, &directives).await? {
        return Ok(response);
    }
    if let Dispatch::Handled(response) = directory_index(content, &path).await? {
        return Ok(response);
    }
    Ok(not_found().await.into_response())
}

/// `GET /static` and `GET /static/`
pub async fn static_index(State(state): State<AppState>) -> Result<Response, AppError> {
    let content = &state.static_content;
    match directory_index(content, content.root()).await? {
        Dispatch::Handled(response) => Ok(response),
        Dispatch::Defer => Ok(not_found().await.into_response()),
    }
}

/// Stream `path` if it is a regular file.
pub async fn serve_file(path: &Path, directives: &RequestDirectives) -> Result<Dispatch, AppError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Dispatch::Defer),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Ok(Dispatch::Defer);
    }

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Dispatch::Defer),
        Err(e) => return Err(e.into()),
    };

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));

    let stream = ReaderStream::new(file);
    let body = match directives.bytes_per_second {
        Some(rate) => {
            tracing::debug!(path = ?path, bytes_per_second = rate.get(), "Throttling file");
            Body::from_stream(ThrottledStream::new(stream, rate))
        }
        None => Body::from_stream(stream),
    };

    let response = (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_LENGTH, HeaderValue::from(metadata.len())),
        ],
        body,
    )
        .into_response();
    Ok(Dispatch::Handled(response))
}

/// Render an HTML listing if `path` is a directory.
pub async fn directory_index(content: &StaticContent, path: &Path) -> Result<Dispatch, AppError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Dispatch::Defer),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_dir() {
        return Ok(Dispatch::Defer);
    }

    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    // Directories first, then files, each alphabetically.
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let relative: Vec<String> = path
        .strip_prefix(content.root())
        .unwrap_or(Path::new(""))
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    let mut base = String::from(STATIC_PREFIX);
    for segment in &relative {
        base.push('/');
        base.push_str(&encode_path_segment(segment));
    }
    let title = format!("{STATIC_PREFIX}/{}", relative.join("/"));

    let mut items = String::new();
    if !relative.is_empty() {
        let parent = base.rsplit_once('/').map_or(STATIC_PREFIX, |(parent, _)| parent);
        items.push_str(&format!(
            "            <li><a href=\"{}/\">../</a></li>\n",
            escape_html(parent)
        ));
    }
    for (name, is_dir) in &entries {
        let suffix = if *is_dir { "/" } else { "" };
        items.push_str(&format!(
            "            <li><a href=\"{}/{}{suffix}\">{}{suffix}</a></li>\n",
            escape_html(&base),
            escape_html(&encode_path_segment(name)),
            escape_html(name),
        ));
    }

    let page = format!(
        "<!DOCTYPE html>
<html>
    <head>
        <title>Index of {title}</title>
    </head>
    <body>
        <h1>Index of {title}</h1>
        <ul>
{items}        </ul>
    </body>
</html>
",
        title = escape_html(&title),
    );

    Ok(Dispatch::Handled((StatusCode::OK, Html(page)).into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> StaticContent {
        StaticContent::new("/srv/static")
    }

    #[test]
    fn resolves_inside_root() {
        let content = content();
        assert_eq!(content.resolve("a/b.txt").unwrap(), PathBuf::from("/srv/static/a/b.txt"));
        assert_eq!(content.resolve("./a/../b.txt").unwrap(), PathBuf::from("/srv/static/b.txt"));
        assert_eq!(content.resolve("").unwrap(), PathBuf::from("/srv/static"));
    }

    #[test]
    fn absolute_sub_paths_stay_relative() {
        assert_eq!(
            content().resolve("/etc/passwd").unwrap(),
            PathBuf::from("/srv/static/etc/passwd")
        );
    }

    #[test]
    fn rejects_escapes() {
        let content = content();
        let attempts = [
            "..",
            "../secret",
            "a/../../secret",
            "../../../../etc/passwd",
            "../static-evil/x",
        ];
        for attempt in attempts {
            let err = content.resolve(attempt).unwrap_err();
            assert!(matches!(err, AppError::InvalidRequest(_)), "{attempt}");
        }
    }

    #[test]
    fn rejects_nul_bytes() {
        let err = content().resolve("a\0b/c.txt").unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn reentering_the_root_is_allowed() {
        assert_eq!(
            content().resolve("../static/hello.txt").unwrap(),
            PathBuf::from("/srv/static/hello.txt")
        );
    }

    #[test]
    fn root_is_normalized() {
        let content = StaticContent::new("/srv/other/../static/.");
        assert_eq!(content.root(), Path::new("/srv/static"));
    }

    #[tokio::test]
    async fn missing_paths_defer() {
        let directives = RequestDirectives::default();
        let missing = Path::new("/definitely/not/here.txt");
        assert!(matches!(serve_file(missing, &directives).await, Ok(Dispatch::Defer)));
        assert!(matches!(directory_index(&content(), missing).await, Ok(Dispatch::Defer)));
    }
}
