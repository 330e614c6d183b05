// Shelly RPC HTTP client
//
// Wraps `reqwest::Client` with the two call styles the Shelly HTTP RPC
// dialect supports: a JSON-RPC envelope POSTed to `/rpc`, and per-method
// GET requests to `/rpc/<Method>` with parameters in the query string.
// Typed method wrappers live in `methods.rs`; this module is transport
// mechanics only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::error::Error;

/// Default per-call timeout. Devices sit on the local network, so
/// anything slower than a few seconds is as good as unreachable.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection options for a single device.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Per-call timeout unless overridden by the caller.
    pub timeout: Duration,
    /// HTTP basic auth, for devices with authentication enabled.
    pub auth: Option<(String, String)>,
    /// Optional delay inserted between sequential calls to the same
    /// device, to avoid overwhelming constrained firmwares.
    pub pace: Option<Duration>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            auth: None,
            pace: None,
        }
    }
}

/// HTTP RPC client bound to one device.
///
/// Stateless apart from a monotonically increasing request id and the
/// pacing clock; cheap to construct per device, per job.
pub struct RpcClient {
    http: reqwest::Client,
    base_url: Url,
    options: RpcOptions,
    next_id: AtomicU64,
    pace_gate: tokio::sync::Mutex<()>,
}

impl RpcClient {
    /// Create a client for a device reachable at `host` (IP or hostname).
    pub fn new(host: &str, options: RpcOptions) -> Result<Self, Error> {
        let base_url = Url::parse(&format!("http://{host}"))?;
        Ok(Self::from_base_url(base_url, options))
    }

    /// Create a client from an explicit base URL (used by tests to point
    /// at a mock server).
    pub fn from_base_url(base_url: Url, options: RpcOptions) -> Self {
        let http = reqwest::Client::new();
        Self {
            http,
            base_url,
            options,
            next_id: AtomicU64::new(1),
            pace_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The device base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Host portion of the device URL, for logging.
    pub fn host(&self) -> &str {
        self.base_url.host_str().unwrap_or("<unknown>")
    }

    // ── Envelope call (POST /rpc) ────────────────────────────────────

    /// Issue one RPC call with the default timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.call_with_timeout(method, params, self.options.timeout)
            .await
    }

    /// Issue one RPC call with an explicit timeout (OTA calls need a
    /// longer budget than the default).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.pace().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut envelope = json!({ "id": id, "method": method });
        if let Some(params) = params {
            envelope["params"] = params;
        }

        let url = self.base_url.join("/rpc")?;
        debug!(host = self.host(), method, "POST /rpc");

        let mut req = self.http.post(url).json(&envelope).timeout(timeout);
        if let Some((user, pass)) = &self.options.auth {
            req = req.basic_auth(user, Some(pass));
        }

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let resp = req
            .send()
            .await
            .map_err(|e| Error::from_transport(&e, timeout_ms))?;

        let body = Self::parse_body(resp).await?;
        // Envelope responses wrap the payload in `result`.
        match body {
            Value::Object(mut map) => Ok(map.remove("result").unwrap_or(Value::Null)),
            other => Ok(other),
        }
    }

    // ── Query call (GET /rpc/<Method>) ───────────────────────────────

    /// Issue one RPC call in GET style, parameters in the query string.
    ///
    /// Object/array parameter values are serialized as compact JSON with
    /// no insignificant whitespace. At least one firmware generation
    /// answers HTTP 500 to payloads containing spaces around JSON
    /// punctuation, so the compact form is mandatory, not cosmetic.
    pub async fn call_query(
        &self,
        method: &str,
        params: &[(&str, Value)],
    ) -> Result<Value, Error> {
        self.call_query_with_timeout(method, params, self.options.timeout)
            .await
    }

    /// GET-style call with an explicit timeout.
    pub async fn call_query_with_timeout(
        &self,
        method: &str,
        params: &[(&str, Value)],
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.pace().await;

        let mut url = self.base_url.join(&format!("/rpc/{method}"))?;
        if !params.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (key, value) in params {
                let encoded = match value {
                    // Bare strings go through unquoted, as the device expects.
                    Value::String(s) => s.clone(),
                    // serde_json's to_string is the compact encoding.
                    other => other.to_string(),
                };
                qp.append_pair(key, &encoded);
            }
        }

        debug!(host = self.host(), method, "GET /rpc/{method}");

        let mut req = self.http.get(url).timeout(timeout);
        if let Some((user, pass)) = &self.options.auth {
            req = req.basic_auth(user, Some(pass));
        }

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let resp = req
            .send()
            .await
            .map_err(|e| Error::from_transport(&e, timeout_ms))?;

        Self::parse_body(resp).await
    }

    /// Decode a call result into a typed struct.
    pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
        let body = value.to_string();
        serde_json::from_value(value).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Shared body handling: status check, JSON parse, structured
    /// device-error unwrapping.
    async fn parse_body(resp: reqwest::Response) -> Result<Value, Error> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::from_transport(&e, 0))?;

        if !status.is_success() {
            return Err(Error::Protocol {
                status: status.as_u16(),
                message: truncate(&text, 200),
            });
        }

        // Some setters answer an empty body or literal `null`.
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(Value::Null);
        }

        let body: Value = serde_json::from_str(&text).map_err(|_| Error::Protocol {
            status: status.as_u16(),
            message: format!("invalid JSON body: {}", truncate(&text, 200)),
        })?;

        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Device {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("device error")
                    .to_owned(),
            });
        }

        Ok(body)
    }

    /// Apply the configured inter-call pacing delay, serialized so
    /// concurrent callers on the same client do not collapse the gap.
    async fn pace(&self) {
        if let Some(pace) = self.options.pace {
            let _gate = self.pace_gate.lock().await;
            tokio::time::sleep(pace).await;
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
