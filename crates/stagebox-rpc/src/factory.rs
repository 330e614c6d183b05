// Client construction seam.
//
// Stage code never builds `RpcClient`s directly; it asks a factory.
// Production maps a host straight to `http://{host}`, tests map every
// host to a mock server.

use url::Url;

use crate::client::{RpcClient, RpcOptions};
use crate::error::Error;

/// Produces a client for a device host (IP or name).
pub trait ClientFactory: Send + Sync {
    fn client(&self, host: &str) -> Result<RpcClient, Error>;
}

/// Direct HTTP factory used in production.
#[derive(Debug, Clone, Default)]
pub struct HttpFactory {
    pub options: RpcOptions,
}

impl HttpFactory {
    pub fn new(options: RpcOptions) -> Self {
        Self { options }
    }
}

impl ClientFactory for HttpFactory {
    fn client(&self, host: &str) -> Result<RpcClient, Error> {
        RpcClient::new(host, self.options.clone())
    }
}

/// Factory that sends every host to one fixed base URL. Intended for
/// tests against a local mock server.
#[derive(Debug, Clone)]
pub struct FixedUrlFactory {
    pub base_url: Url,
    pub options: RpcOptions,
}

impl ClientFactory for FixedUrlFactory {
    fn client(&self, _host: &str) -> Result<RpcClient, Error> {
        Ok(RpcClient::from_base_url(
            self.base_url.clone(),
            self.options.clone(),
        ))
    }
}
