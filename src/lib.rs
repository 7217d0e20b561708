// Bluet - BLE device-under-test harness

pub mod config;
pub mod controller;
pub mod device;
pub mod hci;
pub mod link;
pub mod logging;
pub mod markers;
pub mod monitor;
pub mod pairing;
pub mod process;
pub mod relay;
pub mod scenario;
pub mod sim;
pub mod transport;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use config::HarnessConfig;
pub use device::{dut_device, DeviceError, ManagedDevice};
pub use link::{LinkAddress, LinkBus};
pub use scenario::{MarkerWatch, Outcome, ScenarioError};
