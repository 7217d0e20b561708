//! Link-layer trait definitions and core types
//!
//! Defines the contract every endpoint on a [`LinkBus`](super::LinkBus)
//! fulfils: advertising, scanning, connecting and exchanging opaque
//! link-layer payloads over an established connection.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::LinkError;

/// AD type for a complete local name.
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
/// AD type for a shortened local name.
pub const AD_TYPE_SHORTENED_NAME: u8 = 0x08;
/// AD type for the flags field.
pub const AD_TYPE_FLAGS: u8 = 0x01;

/// A 6-byte device address on the link bus, printed most-significant byte
/// first (`E0:E0:E0:E0:E0:E0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    /// A random static address: the two most significant bits are set.
    pub fn random_static() -> Self {
        let mut bytes: [u8; 6] = rand::random();
        bytes[0] |= 0xC0;
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for LinkAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(LinkError::ConnectionError(format!(
                "Malformed address: {}",
                s
            )));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| {
                LinkError::ConnectionError(format!("Malformed address: {}", s))
            })?;
        }
        Ok(Self(bytes))
    }
}

/// Largest data field an AD structure can carry: the length byte counts
/// the type byte too.
pub const MAX_AD_STRUCTURE_DATA: usize = u8::MAX as usize - 1;

/// Advertising payload as a sequence of `(ad_type, data)` structures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    structures: Vec<(u8, Vec<u8>)>,
}

impl AdvertisingData {
    pub fn new() -> Self {
        Self::default()
    }

    /// General-discoverable, BR/EDR-unsupported flags plus a complete local name.
    pub fn with_name(name: &str) -> Self {
        Self::new()
            .push(AD_TYPE_FLAGS, vec![0x06])
            .push(AD_TYPE_COMPLETE_NAME, name.as_bytes().to_vec())
    }

    /// Append a structure. Data beyond what a one-byte length can describe
    /// is cut off.
    pub fn push(mut self, ad_type: u8, mut data: Vec<u8>) -> Self {
        if data.len() > MAX_AD_STRUCTURE_DATA {
            log::debug!(
                "AD type {:#04x} carries {} bytes; keeping {}",
                ad_type,
                data.len(),
                MAX_AD_STRUCTURE_DATA
            );
            data.truncate(MAX_AD_STRUCTURE_DATA);
        }
        self.structures.push((ad_type, data));
        self
    }

    /// The first local name (complete or shortened) carried in the payload.
    pub fn local_name(&self) -> Option<String> {
        self.structures
            .iter()
            .find(|(t, _)| *t == AD_TYPE_COMPLETE_NAME || *t == AD_TYPE_SHORTENED_NAME)
            .map(|(_, data)| String::from_utf8_lossy(data).into_owned())
    }

    /// Length-type-value encoding as carried over the air.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (ad_type, data) in &self.structures {
            out.push((data.len() + 1) as u8);
            out.push(*ad_type);
            out.extend_from_slice(data);
        }
        out
    }

    /// Parse length-type-value structures, stopping at the first zero
    /// length or truncated structure.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut structures = Vec::new();
        let mut rest = bytes;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len == 0 || tail.len() < len {
                break;
            }
            structures.push((tail[0], tail[1..len].to_vec()));
            rest = &tail[len..];
        }
        Self { structures }
    }
}

/// A received advertisement.
#[derive(Debug, Clone)]
pub struct LinkAdvertisement {
    /// Raw advertising data.
    pub data: Vec<u8>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Address of the advertising endpoint.
    pub source_address: LinkAddress,
    /// Whether the advertiser accepts connections.
    pub connectable: bool,
}

impl LinkAdvertisement {
    pub fn local_name(&self) -> Option<String> {
        AdvertisingData::from_bytes(&self.data).local_name()
    }
}

/// An established link between two endpoints.
#[async_trait]
pub trait LinkConnection: Send + Sync {
    /// Send a payload to the connected peer.
    async fn send(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Receive the next payload from the connected peer.
    async fn recv(&self) -> Result<Vec<u8>, LinkError>;

    /// Tear the link down. The peer observes the disconnect.
    async fn disconnect(&self) -> Result<(), LinkError>;

    fn peer_address(&self) -> LinkAddress;

    fn is_connected(&self) -> bool;
}

/// Central role: scanning for advertisements and initiating connections.
#[async_trait]
pub trait LinkCentral: Send + Sync {
    async fn start_scan(&self) -> Result<(), LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    /// Subscribe to advertisements on the bus. Subscribe before
    /// `start_scan` so nothing emitted in between is missed.
    fn advertisements(&self) -> broadcast::Receiver<LinkAdvertisement>;

    async fn connect(&self, address: &LinkAddress) -> Result<Box<dyn LinkConnection>, LinkError>;
}

/// Peripheral role: advertising and accepting incoming connections.
#[async_trait]
pub trait LinkPeripheral: Send + Sync {
    /// Start advertising and begin accepting connections.
    async fn start_advertising(&self, data: Vec<u8>) -> Result<(), LinkError>;

    async fn stop_advertising(&self) -> Result<(), LinkError>;

    /// Accept the next incoming connection from a central.
    async fn accept(&self) -> Result<Box<dyn LinkConnection>, LinkError>;
}
