//! Simulated protocol stacks
//!
//! Stand-ins for the pairing engine on both ends of a link: [`SimPeer`]
//! attaches straight to the link bus as the device the DUT talks to, and
//! [`SimHost`] drives a controller adapter over HCI the way DUT firmware
//! does. Both run the same pairing exchange from [`protocol`].

pub mod host;
pub mod messages;
pub mod peer;
pub mod protocol;

pub use host::{ConsoleDelegate, HostConnection, HostError, SimHost};
pub use messages::SmpMessage;
pub use peer::{
    PeerRole, SimPeer, SimPeerConfig, DEFAULT_PAIRING_TIMEOUT, DEFAULT_PEER_ADDRESS,
    DEFAULT_PEER_NAME,
};
