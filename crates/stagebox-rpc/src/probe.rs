// Reachability probing.
//
// A fast ICMP ping answers the common case, with an RPC round trip as
// the authoritative fallback for hosts that filter ICMP.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::client::{RpcClient, RpcOptions};

/// Liveness check for a candidate address.
#[async_trait]
pub trait Probe: Send + Sync {
    /// True if something answers at `ip` within the probe's budget.
    async fn is_alive(&self, ip: Ipv4Addr) -> bool;
}

/// Probe using the system `ping` binary with a short deadline, falling
/// back to `Shelly.GetDeviceInfo` when ping says nothing is there.
///
/// The fallback matters twice: hosts that drop ICMP, and the window
/// right after a device re-addresses itself when its ARP entry is
/// stale but the RPC endpoint already answers.
pub struct SystemPinger {
    ping_timeout: Duration,
    rpc_timeout: Duration,
}

impl SystemPinger {
    pub fn new() -> Self {
        Self {
            ping_timeout: Duration::from_millis(250),
            rpc_timeout: Duration::from_secs(1),
        }
    }

    async fn ping(&self, ip: Ipv4Addr) -> bool {
        let timeout_s = self.ping_timeout.as_secs_f64().max(0.001);
        let result = tokio::process::Command::new("ping")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(format!("{}", timeout_s.ceil() as u64))
            .arg(ip.to_string())
            .kill_on_drop(true)
            .output()
            .await;
        match result {
            Ok(output) => output.status.success(),
            Err(err) => {
                debug!(%ip, %err, "ping unavailable, relying on RPC probe");
                false
            }
        }
    }

    async fn rpc_probe(&self, ip: Ipv4Addr) -> bool {
        let options = RpcOptions {
            timeout: self.rpc_timeout,
            ..RpcOptions::default()
        };
        let Ok(client) = RpcClient::new(&ip.to_string(), options) else {
            return false;
        };
        client.device_info().await.is_ok()
    }
}

impl Default for SystemPinger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for SystemPinger {
    async fn is_alive(&self, ip: Ipv4Addr) -> bool {
        if self.ping(ip).await {
            return true;
        }
        self.rpc_probe(ip).await
    }
}
