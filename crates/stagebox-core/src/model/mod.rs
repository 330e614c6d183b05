pub mod device;
pub mod mac;

pub use device::{DeviceRecord, MAX_STAGE, Stage3Status, Stage4Status};
pub use mac::MacAddress;
