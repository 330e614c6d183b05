// stagebox-rpc: Async HTTP RPC client for Shelly Gen2+ devices

pub mod client;
pub mod error;
pub mod factory;
pub mod methods;
pub mod probe;
pub mod types;

pub use client::{DEFAULT_TIMEOUT, RpcClient, RpcOptions};
pub use error::Error;
pub use factory::{ClientFactory, FixedUrlFactory, HttpFactory};
pub use probe::{Probe, SystemPinger};
