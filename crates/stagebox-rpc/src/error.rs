use thiserror::Error;

/// Top-level error type for the `stagebox-rpc` crate.
///
/// Covers every failure mode of talking to a single device:
/// transport, protocol, and structured RPC errors. `stagebox-core`
/// maps these into per-device outcomes.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Device did not respond (connection refused, no route, DNS).
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Request timed out.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// URL construction failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Protocol ────────────────────────────────────────────────────
    /// Non-2xx status or a body that is not valid JSON.
    #[error("Protocol error (HTTP {status}): {message}")]
    Protocol { status: u16, message: String },

    // ── Device ──────────────────────────────────────────────────────
    /// Structured RPC error returned by the device
    /// (the `{"error": {"code", "message"}}` envelope).
    #[error("Device RPC error {code}: {message}")]
    Device { code: i64, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Result payload did not match the expected shape.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient transport failure worth
    /// retrying or, during an IP change, treating as expected.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout { .. })
    }

    /// Map a `reqwest::Error` into the transport taxonomy.
    pub(crate) fn from_transport(err: &reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout { timeout_ms }
        } else if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Protocol {
                status: err.status().map_or(0, |s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}
