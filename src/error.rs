//! Typed error taxonomy for the HTTP checking core.
//!
//! Each variant corresponds to one of the error kinds in the checker's
//! design: protocol hiccups and outright HTTP failures are terminal,
//! configuration errors are terminal and not retried, transport errors
//! cover socket/TLS/timeout failures. Content and cookie problems are
//! warnings, not errors, and never appear here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    /// Malformed status line or headers that survived a HEAD->GET retry.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Final response carried a status >= 400 after all retries.
    #[error("{status} {reason}")]
    HttpFailure { status: u16, reason: String },

    /// More than `max_redirects` redirects, or a redirect cycle.
    #[error("{0}")]
    Redirect(String),

    /// Scheme other than http/https requested from the connection pool,
    /// or TLS requested when unavailable.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// A 305 (Use Proxy) response carried an empty Location header.
    #[error("Enforced proxy {0:?} ignored, aborting")]
    EnforcedProxyEmpty(Option<String>),

    /// Socket error, connect timeout, TLS handshake failure, etc.
    #[error("transport error: {0}")]
    Transport(String),

    /// The URL string itself could not be parsed or joined.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl CheckError {
    /// Render the way `check_response` renders a terminal HTTP failure:
    /// `"<status> <reason>"`.
    pub fn http_failure(status: reqwest::StatusCode) -> Self {
        let reason = status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string();
        CheckError::HttpFailure {
            status: status.as_u16(),
            reason,
        }
    }
}

#[derive(Debug, Error)]
#[error("cookie parse error: {0}")]
pub struct CookieError(pub String);
