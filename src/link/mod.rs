//! Virtual link bus
//!
//! An in-process stand-in for the radio medium. Controller adapters and
//! simulated peers attach to a [`LinkBus`]; anything attached to the same
//! bus instance can advertise to, scan for and connect to anything else on
//! it, while separate bus instances are mutually unreachable.

pub mod bus;
pub mod transport;

use thiserror::Error;

pub use bus::{LinkBus, LinkEndpoint};
pub use transport::{
    AdvertisingData, LinkAddress, LinkAdvertisement, LinkCentral, LinkConnection, LinkPeripheral,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("No endpoint at {0} on this bus")]
    Unreachable(LinkAddress),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Peer disconnected")]
    Disconnected,
}
