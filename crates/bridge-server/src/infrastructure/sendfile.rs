//! Conditional static-file responder.
//!
//! Serves the file named by an application's `X-Sendfile` response header:
//! a missing file becomes a 404, a matching `If-None-Match` becomes a 304,
//! and anything else streams the file bytes with a path-derived ETag.  The
//! ETag hashes only the path, not the content; deployments that rewrite
//! files in place should disable sendfile rather than rely on it for cache
//! validation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::infrastructure::{empty_body, error_page, BoxError, BridgeBody};

/// Fixed-length (16 hex chars) ETag derived from the file path.
pub fn path_etag(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Builds the response for one sendfile request.
pub async fn respond(path: &Path, if_none_match: Option<&str>) -> Response<BridgeBody> {
    let etag = path_etag(path);

    let metadata = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            debug!(path = %path.display(), "sendfile target missing");
            return error_page(StatusCode::NOT_FOUND, "Not found");
        }
    };

    if if_none_match == Some(etag.as_str()) {
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        set_etag(&mut response, &etag);
        return response;
    }

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %path.display(), "sendfile open failed: {err}");
            return error_page(StatusCode::NOT_FOUND, "Not found");
        }
    };

    let stream = ReaderStream::new(file)
        .map_ok(Frame::data)
        .map_err(|err| Box::new(err) as BoxError);
    let mut response = Response::new(StreamBody::new(stream).boxed());
    set_etag(&mut response, &etag);
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

fn set_etag(response: &mut Response<BridgeBody>, etag: &str) {
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_file(content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sendfile-test-{}", Uuid::new_v4()));
        std::fs::write(&path, content).expect("write temp file");
        path
    }

    #[test]
    fn test_path_etag_is_16_hex_chars_and_stable() {
        let etag = path_etag(Path::new("/srv/files/report.pdf"));

        assert_eq!(etag.len(), 16);
        assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(etag, path_etag(Path::new("/srv/files/report.pdf")));
        assert_ne!(etag, path_etag(Path::new("/srv/files/other.pdf")));
    }

    #[tokio::test]
    async fn test_missing_file_yields_404() {
        let response = respond(Path::new("/definitely/not/here"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_matching_if_none_match_yields_304_with_empty_body() {
        let path = temp_file(b"cached content");
        let etag = path_etag(&path);

        let response = respond(&path, Some(etag.as_str())).await;

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            response.headers().get(header::ETAG).and_then(|v| v.to_str().ok()),
            Some(etag.as_str())
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_fresh_request_streams_file_with_etag_and_length() {
        let path = temp_file(b"file payload");

        let response = respond(&path, None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok()),
            Some("12")
        );
        assert!(response.headers().contains_key(header::ETAG));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"file payload");

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_stale_if_none_match_still_streams() {
        let path = temp_file(b"fresh");

        let response = respond(&path, Some("0000000000000000")).await;
        assert_eq!(response.status(), StatusCode::OK);

        std::fs::remove_file(&path).ok();
    }
}
