//! Pairing decisions
//!
//! A simulated peer asks its [`PairingDelegate`] three things during
//! pairing: whether to go ahead at all, which number to enter when the
//! other side displays one, and what to do with a number it displays
//! itself. Scenarios answer by picking or writing a delegate; the stock
//! ones below cover accepting, rejecting, a fixed passkey, a passkey
//! relayed from DUT output, and typing a displayed passkey into the DUT.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::{LinkAddress, LinkError};
use crate::markers::format_passkey_line;
use crate::process::StdinWriter;
use crate::relay::Relay;

/// Reason codes carried by a pairing failure.
pub const REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const REASON_UNSPECIFIED: u8 = 0x08;

/// Highest passkey value, inclusive.
pub const MAX_PASSKEY: u32 = 999_999;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Pairing rejected: {reason}")]
    Rejected { reason: String },

    #[error("Authentication failed (reason {reason_code:#04x})")]
    AuthenticationFailed { reason_code: u8 },

    #[error("No passkey was supplied")]
    MissingNumber,

    #[error("Transport error: {0}")]
    Transport(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Input/output capabilities a side declares when pairing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCapability {
    DisplayOutputOnly,
    DisplayOutputAndYesNoInput,
    KeyboardInputOnly,
    NoOutputNoInput,
    DisplayOutputAndKeyboardInput,
}

impl IoCapability {
    pub fn can_display(self) -> bool {
        matches!(
            self,
            IoCapability::DisplayOutputOnly
                | IoCapability::DisplayOutputAndYesNoInput
                | IoCapability::DisplayOutputAndKeyboardInput
        )
    }

    pub fn can_type(self) -> bool {
        matches!(
            self,
            IoCapability::KeyboardInputOnly | IoCapability::DisplayOutputAndKeyboardInput
        )
    }
}

/// How the two sides authenticate, derived from their capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    /// No number changes hands.
    JustWorks,
    /// The responder displays, the initiator types.
    InitiatorEntersPasskey,
    /// The initiator displays, the responder types.
    ResponderEntersPasskey,
}

impl PairingMethod {
    pub fn select(initiator: IoCapability, responder: IoCapability) -> Self {
        if initiator.can_type() && responder.can_display() {
            PairingMethod::InitiatorEntersPasskey
        } else if responder.can_type() && initiator.can_display() {
            PairingMethod::ResponderEntersPasskey
        } else {
            PairingMethod::JustWorks
        }
    }
}

/// Outcome of a successful pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingResult {
    pub method: PairingMethod,
    pub bonded: bool,
}

// ---------------------------------------------------------------------------
// Delegate capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PairingDelegate: Send + Sync {
    fn io_capability(&self) -> IoCapability;

    /// Whether to pair at all.
    async fn should_accept(&self) -> bool {
        true
    }

    /// The passkey to enter. `None` aborts pairing.
    async fn provide_number(&self) -> Option<u32> {
        None
    }

    /// Show a passkey that the other side must enter.
    async fn display_number(&self, _value: u32, _digits: usize) {}
}

/// Accepts everything; pairs with Just Works unless told otherwise.
pub struct AcceptAll {
    pub io_capability: IoCapability,
}

impl Default for AcceptAll {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoOutputNoInput,
        }
    }
}

#[async_trait]
impl PairingDelegate for AcceptAll {
    fn io_capability(&self) -> IoCapability {
        self.io_capability
    }
}

/// Declines every pairing request.
pub struct Rejecting {
    pub io_capability: IoCapability,
}

impl Default for Rejecting {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::DisplayOutputAndKeyboardInput,
        }
    }
}

#[async_trait]
impl PairingDelegate for Rejecting {
    fn io_capability(&self) -> IoCapability {
        self.io_capability
    }

    async fn should_accept(&self) -> bool {
        false
    }
}

/// Always enters the same passkey.
pub struct FixedPasskey {
    pub value: u32,
}

#[async_trait]
impl PairingDelegate for FixedPasskey {
    fn io_capability(&self) -> IoCapability {
        IoCapability::KeyboardInputOnly
    }

    async fn provide_number(&self) -> Option<u32> {
        Some(self.value)
    }
}

/// Enters whatever value arrives on a relay, typically resolved by a
/// monitor that spotted the passkey in DUT output.
pub struct RelayDelegate {
    relay: Relay<u32>,
    io_capability: IoCapability,
}

impl RelayDelegate {
    pub fn new(relay: Relay<u32>) -> Self {
        Self {
            relay,
            io_capability: IoCapability::DisplayOutputAndKeyboardInput,
        }
    }

    pub fn with_io_capability(mut self, io_capability: IoCapability) -> Self {
        self.io_capability = io_capability;
        self
    }
}

#[async_trait]
impl PairingDelegate for RelayDelegate {
    fn io_capability(&self) -> IoCapability {
        self.io_capability
    }

    async fn provide_number(&self) -> Option<u32> {
        self.relay.wait().await.ok()
    }
}

/// Display-only peer whose "display" types the passkey into the DUT's
/// standard input as `PK<digits>PK`.
pub struct StdinPasskeyDelegate {
    stdin: StdinWriter,
}

impl StdinPasskeyDelegate {
    pub fn new(stdin: StdinWriter) -> Self {
        Self { stdin }
    }
}

#[async_trait]
impl PairingDelegate for StdinPasskeyDelegate {
    fn io_capability(&self) -> IoCapability {
        IoCapability::DisplayOutputOnly
    }

    async fn display_number(&self, value: u32, digits: usize) {
        let line = format_passkey_line(value, digits);
        if let Err(e) = self.stdin.write_line(&line).await {
            log::warn!("Failed to type passkey into DUT: {}", e);
        }
    }
}

/// Delegate built from a closure answering `provide_number`.
pub struct PasskeyFn<F> {
    io_capability: IoCapability,
    provide: F,
}

impl<F> PasskeyFn<F>
where
    F: Fn() -> Option<u32> + Send + Sync,
{
    pub fn new(io_capability: IoCapability, provide: F) -> Self {
        Self {
            io_capability,
            provide,
        }
    }
}

#[async_trait]
impl<F> PairingDelegate for PasskeyFn<F>
where
    F: Fn() -> Option<u32> + Send + Sync,
{
    fn io_capability(&self) -> IoCapability {
        self.io_capability
    }

    async fn provide_number(&self) -> Option<u32> {
        (self.provide)()
    }
}

// ---------------------------------------------------------------------------
// Pending authentication
// ---------------------------------------------------------------------------

/// What the peer stack is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Passkey { digits: usize },
}

/// A connection waiting on its delegate for proof of possession. Consumed
/// by [`PendingAuthRequest::resolve`], which either yields the value or
/// gives up at the deadline.
#[derive(Debug, Clone)]
pub struct PendingAuthRequest {
    pub peer: LinkAddress,
    pub kind: AuthKind,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthRequest {
    pub fn passkey(peer: LinkAddress) -> Self {
        Self {
            peer,
            kind: AuthKind::Passkey {
                digits: crate::markers::PASSKEY_DIGITS,
            },
            created_at: Utc::now(),
        }
    }

    pub async fn resolve(
        self,
        delegate: &dyn PairingDelegate,
        deadline: Duration,
    ) -> Result<u32, PairingError> {
        log::debug!("awaiting {:?} for {}", self.kind, self.peer);
        let value = tokio::time::timeout(deadline, delegate.provide_number())
            .await
            .map_err(|_| PairingError::Timeout(format!("passkey for {}", self.peer)))?
            .ok_or(PairingError::MissingNumber)?;

        let AuthKind::Passkey { digits } = self.kind;
        let limit = 10u64.pow(digits as u32);
        if u64::from(value) >= limit {
            return Err(PairingError::Protocol(format!(
                "passkey {} does not fit in {} digits",
                value, digits
            )));
        }
        Ok(value)
    }
}

/// A fresh random passkey.
pub fn random_passkey() -> u32 {
    rand::random::<u32>() % (MAX_PASSKEY + 1)
}
