// ── Core error types ──
//
// User-facing errors from stagebox-core. Device transport failures are
// wrapped so consumers reason about fleet operations, not HTTP details.
// The `From<stagebox_rpc::Error>` impl translates transport-layer
// errors into domain-appropriate variants.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device errors ────────────────────────────────────────────────
    #[error("Device unreachable: {host}")]
    DeviceUnreachable { host: String },

    #[error("Device {host} rejected {method}: {message}")]
    DeviceRejected {
        host: String,
        method: String,
        message: String,
    },

    #[error("Device RPC failed: {0}")]
    Rpc(#[from] stagebox_rpc::Error),

    #[error("Device not found in registry: {mac}")]
    DeviceNotFound { mac: String },

    // ── Addressing errors ────────────────────────────────────────────
    #[error("Invalid MAC address: {input}")]
    InvalidMac { input: String },

    #[error("Invalid network range: {input}: {reason}")]
    InvalidRange { input: String, reason: String },

    #[error("IP pool exhausted: all {size} addresses in {range} are assigned")]
    AllocationConflict { range: String, size: usize },

    // ── Registry errors ──────────────────────────────────────────────
    #[error("Registry file {path} is corrupt: {reason}")]
    RegistryCorrupt { path: PathBuf, reason: String },

    #[error("Unsupported registry version {found} in {path} (expected {expected})")]
    RegistryVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("Registry I/O error on {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Provisioning errors ──────────────────────────────────────────
    #[error("WiFi control failed: {message}")]
    Wifi { message: String },

    #[error("Stage {stage} failed for {mac}: {message}")]
    StageFailed {
        stage: u8,
        mac: String,
        message: String,
    },

    #[error("Unknown device profile: {name}")]
    UnknownProfile { name: String },

    // ── Job errors ───────────────────────────────────────────────────
    #[error("Job conflict: {running} is already operating on stage {stage}")]
    JobConflict { running: String, stage: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Snapshot errors ──────────────────────────────────────────────
    #[error("Snapshot error on {path}: {message}")]
    Snapshot { path: PathBuf, message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether retrying against the same device could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DeviceUnreachable { .. } => true,
            Self::Rpc(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
