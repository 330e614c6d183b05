// stagebox-core: provisioning pipeline, registry and audit engine

pub mod audit;
pub mod config;
pub mod error;
pub mod job;
pub mod model;
pub mod pool;
pub mod registry;
pub mod scan;
pub mod stage;

pub use error::{CoreError, Result};
pub use job::{DEFAULT_CONCURRENCY, JobStage, JobState, JobStatus, JobTracker};
pub use model::{DeviceRecord, MacAddress};
pub use pool::IpPool;
pub use registry::Registry;
