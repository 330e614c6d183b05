// ── Provisioning stages ──
//
// Stage 1 onboards factory-fresh devices over their own AP; Stage 2
// adopts them into the static pool; Stage 3 handles firmware and
// naming; Stage 4 applies device-type profiles. Stages 2-4 run per
// device and are fanned out by the job orchestrator.

pub mod stage1;
pub mod stage2;
pub mod stage3;
pub mod stage4;

use serde::Serialize;

/// Outcome of one device within a stage run.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOutcome {
    /// MAC when known, otherwise the probed address.
    pub device: String,
    pub ok: bool,
    pub message: String,
}

impl DeviceOutcome {
    pub fn ok(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ok: true,
            message: message.into(),
        }
    }

    pub fn error(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ok: false,
            message: message.into(),
        }
    }
}
