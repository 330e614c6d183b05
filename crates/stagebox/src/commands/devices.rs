//! Registry listing.

use stagebox_core::model::DeviceRecord;
use stagebox_core::MacAddress;
use tabled::Tabled;

use crate::cli::OutputFormat;
use crate::commands::Context;
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Hostname")]
    hostname: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Firmware")]
    firmware: String,
    #[tabled(rename = "Stage")]
    stage: u8,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Last seen")]
    last_seen: String,
}

impl DeviceRow {
    fn from(mac: &MacAddress, record: &DeviceRecord) -> Self {
        Self {
            mac: mac.to_string(),
            ip: record.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            hostname: record.hostname.clone().unwrap_or_default(),
            model: record
                .hw_model
                .clone()
                .or_else(|| record.model.clone())
                .unwrap_or_default(),
            firmware: record.firmware_version.clone().unwrap_or_default(),
            stage: record.stage_completed,
            name: record.friendly_name.clone().unwrap_or_default(),
            last_seen: record
                .last_seen
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default(),
        }
    }
}

pub fn handle(ctx: &Context, format: OutputFormat) -> Result<(), CliError> {
    let devices = ctx.registry.snapshot();

    if format == OutputFormat::Json {
        return output::print_json(&devices);
    }

    let rows: Vec<DeviceRow> = devices
        .iter()
        .map(|(mac, record)| DeviceRow::from(mac, record))
        .collect();
    output::print_table(rows);
    println!("{} device(s)", devices.len());
    Ok(())
}
