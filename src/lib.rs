//! `bthome-gateway` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The core "business logic" lives in [`crate::app`]
//! and [`crate::pipeline`] where it can be tested deterministically with an
//! injected scanner and an injected broker connector.

pub mod app;
pub mod config;
pub mod crypto;
pub mod device;
pub mod duration;
pub mod mac_address;
pub mod measurement;
pub mod parser;
pub mod pipeline;
pub mod publish;
pub mod scanner;
pub mod sensor;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use device::{BrokerTarget, DeviceRegistry, DeviceState};
pub use mac_address::MacAddress;
pub use measurement::{Measurement, Measurements};
pub use pipeline::{Advertisement, Pipeline};
pub use publish::{Delivery, PublishReport, Publisher};
pub use scanner::{Backend, ScanError, ScanHandle};
