//! Output rendering: tabled tables or JSON.

use owo_colors::OwoColorize;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::error::CliError;

pub fn print_table<R: Tabled>(rows: Vec<R>) {
    if rows.is_empty() {
        println!("(nothing to show)");
        return;
    }
    let mut table = Table::new(rows);
    table.with(Style::sharp());
    println!("{table}");
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-line progress for a device outcome, colored by result.
pub fn print_outcome(outcome: &stagebox_core::stage::DeviceOutcome) {
    if outcome.ok {
        println!("  {} {}: {}", "ok".green(), outcome.device, outcome.message);
    } else {
        println!("  {} {}: {}", "err".red(), outcome.device, outcome.message);
    }
}
