//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use stagebox_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("Configuration problem")]
    #[diagnostic(
        code(stagebox::config),
        help("Check the config file; `stagebox --config <file> devices` validates it.")
    )]
    Config(#[from] stagebox_config::ConfigError),

    #[error("Invalid {field}: {reason}")]
    #[diagnostic(code(stagebox::validation))]
    Validation { field: String, reason: String },

    #[error("No snapshot found in {dir}")]
    #[diagnostic(
        code(stagebox::no_snapshot),
        help("Take one first: stagebox snapshot take")
    )]
    NoSnapshot { dir: String },

    #[error(transparent)]
    #[diagnostic(code(stagebox::core))]
    Core(#[from] CoreError),

    #[error(transparent)]
    #[diagnostic(code(stagebox::rpc))]
    Rpc(#[from] stagebox_rpc::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(stagebox::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    #[diagnostic(code(stagebox::serialize))]
    Serialize(#[from] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Validation { .. } => exit_code::USAGE,
            Self::NoSnapshot { .. } => exit_code::NOT_FOUND,
            Self::Core(CoreError::JobConflict { .. }) => exit_code::CONFLICT,
            Self::Core(CoreError::DeviceNotFound { .. } | CoreError::JobNotFound { .. }) => {
                exit_code::NOT_FOUND
            }
            _ => exit_code::GENERAL,
        }
    }
}
