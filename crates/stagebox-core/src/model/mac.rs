// ── MAC address identity ──
//
// MAC addresses are the primary key of the registry. Devices report
// them in several shapes (colons, dashes, mixed case); everything is
// normalized to 12 uppercase hex digits before it touches state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Canonical MAC address: 12 uppercase hex digits, no separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse and normalize any common MAC notation.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let normalized: String = input
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != 12 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidMac {
                input: input.to_owned(),
            });
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last six hex digits, as they appear in default hostnames and
    /// AP SSIDs (`ShellyMini1PMG3-543204AABBCC`).
    pub fn suffix(&self) -> &str {
        &self.0[6..]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}
