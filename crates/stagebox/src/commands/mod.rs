//! Command dispatch: CLI args -> core runners -> output.

pub mod devices;
pub mod snapshot;
pub mod stage;

use std::sync::Arc;

use stagebox_config::Settings;
use stagebox_core::Registry;
use stagebox_rpc::{HttpFactory, RpcOptions, SystemPinger};

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Everything a command handler needs, shareable across job workers.
pub struct Context {
    pub settings: Arc<Settings>,
    pub registry: Arc<Registry>,
    pub factory: Arc<HttpFactory>,
    pub probe: Arc<SystemPinger>,
}

impl Context {
    fn build(config: Option<&std::path::Path>) -> Result<Self, CliError> {
        let settings = stagebox_config::load_settings(config)?;
        let registry = Registry::open(&settings.registry_path)?;
        Ok(Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            factory: Arc::new(HttpFactory::new(RpcOptions::default())),
            probe: Arc::new(SystemPinger::new()),
        })
    }
}

pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let ctx = Context::build(cli.global.config.as_deref())?;
    let format = cli.global.output;

    match cli.command {
        Command::Stage1(args) => stage::stage1(&ctx, args, format).await,
        Command::Stage2(args) => stage::stage2(&ctx, args, format).await,
        Command::Stage3(args) => stage::stage3(&ctx, args, format).await,
        Command::Stage4(args) => stage::stage4(&ctx, args, format).await,
        Command::Snapshot(cmd) => snapshot::handle(&ctx, cmd, format).await,
        Command::Audit(args) => snapshot::audit(&ctx, args, format).await,
        Command::Devices => devices::handle(&ctx, format),
    }
}

/// Parse a `--mac` flag into a canonical address.
pub fn parse_mac_flag(
    flag: Option<&str>,
) -> Result<Option<stagebox_core::MacAddress>, CliError> {
    flag.map(|raw| {
        stagebox_core::MacAddress::parse(raw).map_err(|e| CliError::Validation {
            field: "mac".into(),
            reason: e.to_string(),
        })
    })
    .transpose()
}
