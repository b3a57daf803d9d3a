//! Error types for the loveseat CouchDB client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// 401 from the server after the single re-auth attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 403: authenticated but not permitted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// 404 where the operation requires the resource to exist.
    /// `CouchDatabase::get` maps a clean 404 to `Ok(None)` instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// 409: the supplied rev lost an MVCC race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// 412: precondition (If-Match) not met.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Query rejected locally before any request was made.
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    /// Network or socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// 5xx from the server.
    #[error("server error (HTTP {status}): {reason}")]
    Server { status: u16, reason: String },

    /// Response body did not parse or had an unexpected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Local file I/O while staging or uploading an attachment.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Server { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Decode(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Classify a non-2xx response into the error taxonomy.
///
/// CouchDB error bodies look like `{"error": "...", "reason": "..."}`;
/// both halves are folded into the message when present.
pub(crate) fn map_status(status: u16, body: &str) -> Error {
    let reason = parse_reason(body);
    match status {
        401 => Error::Unauthorized(reason),
        403 => Error::Forbidden(reason),
        404 => Error::NotFound(reason),
        409 => Error::Conflict(reason),
        412 => Error::PreconditionFailed(reason),
        _ => Error::Server { status, reason },
    }
}

fn parse_reason(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        let error = v.get("error").and_then(|e| e.as_str());
        let reason = v.get("reason").and_then(|r| r.as_str());
        match (error, reason) {
            (Some(e), Some(r)) => return format!("{}: {}", e, r),
            (Some(e), None) => return e.to_string(),
            (None, Some(r)) => return r.to_string(),
            (None, None) => {}
        }
    }
    if body.is_empty() {
        "(no body)".to_string()
    } else {
        body.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_couchdb_error_bodies() {
        let err = map_status(409, r#"{"error":"conflict","reason":"Document update conflict."}"#);
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(
            format!("{}", err),
            "conflict: conflict: Document update conflict."
        );
    }

    #[test]
    fn maps_5xx_to_server() {
        let err = map_status(503, "");
        assert!(matches!(err, Error::Server { status: 503, .. }));
        assert!(err.is_retriable());
    }

    #[test]
    fn local_errors_not_retriable() {
        assert!(!Error::UnsupportedQuery("x".into()).is_retriable());
        assert!(!map_status(401, "{}").is_retriable());
        assert!(!map_status(412, "{}").is_retriable());
    }
}
