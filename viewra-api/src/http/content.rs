//! Content serving: manifests, segments and metadata by fingerprint, plus
//! the transitional session-scoped read path used while an encode is still
//! publishing. Segment reads honour HTTP byte ranges.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::path::{Component, Path as FsPath, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::http::{AppError, AppResult, AppState};
use viewra_core::models::SessionId;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// JSON metadata snapshot for published content
#[axum::debug_handler]
pub async fn content_info(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> AppResult<impl IntoResponse> {
    let (record, _) = state.store.get(&fingerprint)?;
    Ok(Json(record))
}

/// Manifest or segment bytes for published content
#[axum::debug_handler]
pub async fn serve_content(
    State(state): State<AppState>,
    Path((fingerprint, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let (_, leaf) = state.store.get(&fingerprint)?;
    serve_file(&leaf, &file, &headers).await
}

/// Transitional read path into a session's working directory. Disappears
/// once the session publishes (content is then addressed by fingerprint).
#[axum::debug_handler]
pub async fn serve_session_file(
    State(state): State<AppState>,
    Path((session_id, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let session = state
        .session_manager
        .get_session(&SessionId::from_string(session_id))?;
    let Some(working_dir) = session.working_dir else {
        return Err(AppError::not_found(
            "session has no working directory (published or cleaned up)",
        ));
    };
    serve_file(&working_dir, &file, &headers).await
}

async fn serve_file(base: &FsPath, file: &str, headers: &HeaderMap) -> AppResult<Response> {
    let relative = sanitize(file)?;
    let path = base.join(relative);
    if !path.is_file() {
        return Err(AppError::not_found(format!("no such file: {file}")));
    }

    let mut handle = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::not_found(format!("no such file: {file}")))?;
    let total = handle
        .metadata()
        .await
        .map_err(|e| AppError::internal_server_error(e.to_string()))?
        .len();
    let content_type = content_type_for(file);

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| AppError::bad_request("malformed Range header"))?;
            match parse_byte_range(raw, total) {
                Some(range) => Some(range),
                None => {
                    return Ok(Response::builder()
                        .status(StatusCode::RANGE_NOT_SATISFIABLE)
                        .header(header::CONTENT_RANGE, format!("bytes */{total}"))
                        .body(Body::empty())
                        .map_err(|e| AppError::internal_server_error(e.to_string()))?);
                }
            }
        }
        None => None,
    };

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let response = match range {
        Some((start, end)) => {
            handle
                .seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| AppError::internal_server_error(e.to_string()))?;
            let len = end - start + 1;
            let stream = ReaderStream::with_capacity(handle.take(len), STREAM_BUFFER_SIZE);
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, len)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .body(Body::from_stream(stream))
        }
        None => {
            let stream = ReaderStream::with_capacity(handle, STREAM_BUFFER_SIZE);
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, total)
                .body(Body::from_stream(stream))
        }
    };
    response.map_err(|e| AppError::internal_server_error(e.to_string()))
}

/// Only plain relative file names are served; anything that could walk out
/// of the leaf is rejected.
fn sanitize(file: &str) -> AppResult<PathBuf> {
    let path = FsPath::new(file);
    let clean = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if file.is_empty() || !clean {
        return Err(AppError::bad_request(format!("invalid file path: {file}")));
    }
    Ok(path.to_path_buf())
}

fn content_type_for(file: &str) -> &'static str {
    match FsPath::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mpd") => "application/dash+xml",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("m4s") => "video/iso.segment",
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        Some("json") => "application/json",
        Some("log" | "txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Parse a single-range `bytes=` header against a known length. `None`
/// means the range cannot be satisfied.
fn parse_byte_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?.trim();
    // Multi-range requests are not worth the multipart reply for segments.
    if spec.contains(',') || total == 0 {
        return None;
    }
    let (start_raw, end_raw) = spec.split_once('-')?;

    if start_raw.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = total.saturating_sub(suffix);
        return Some((start, total - 1));
    }

    let start: u64 = start_raw.parse().ok()?;
    if start >= total {
        return None;
    }
    let end = if end_raw.is_empty() {
        total - 1
    } else {
        end_raw.parse::<u64>().ok()?.min(total - 1)
    };
    (start <= end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_open_ranges() {
        assert_eq!(parse_byte_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_byte_range("bytes=0-", 1000), Some((0, 999)));
    }

    #[test]
    fn suffix_range() {
        assert_eq!(parse_byte_range("bytes=-200", 1000), Some((800, 999)));
        assert_eq!(parse_byte_range("bytes=-2000", 1000), Some((0, 999)));
    }

    #[test]
    fn unsatisfiable_ranges() {
        assert_eq!(parse_byte_range("bytes=1000-", 1000), None);
        assert_eq!(parse_byte_range("bytes=5-2", 1000), None);
        assert_eq!(parse_byte_range("bytes=-0", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_byte_range("items=0-10", 1000), None);
    }

    #[test]
    fn end_clamps_to_length() {
        assert_eq!(parse_byte_range("bytes=900-5000", 1000), Some((900, 999)));
    }

    #[test]
    fn content_types_match_streaming_formats() {
        assert_eq!(content_type_for("manifest.mpd"), "application/dash+xml");
        assert_eq!(
            content_type_for("playlist.m3u8"),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(content_type_for("chunk-0-00001.m4s"), "video/iso.segment");
        assert_eq!(content_type_for("segment-00001.ts"), "video/mp2t");
        assert_eq!(content_type_for("output.mp4"), "video/mp4");
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(sanitize("../secrets").is_err());
        assert!(sanitize("/etc/passwd").is_err());
        assert!(sanitize("a/../../b").is_err());
        assert!(sanitize("").is_err());
        assert!(sanitize("init-0.m4s").is_ok());
        assert!(sanitize("sub/init-0.m4s").is_ok());
    }
}
