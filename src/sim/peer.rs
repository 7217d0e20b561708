//! Simulated peer device attached directly to the link bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

use crate::link::{
    AdvertisingData, LinkAddress, LinkBus, LinkCentral, LinkConnection, LinkEndpoint, LinkError,
    LinkPeripheral,
};
use crate::pairing::{
    AcceptAll, IoCapability, PairingDelegate, PairingError, PairingResult,
};

use super::messages::{recv_msg, SmpMessage};
use super::protocol::{initiate, respond};

/// Address the peer uses unless configured otherwise.
pub const DEFAULT_PEER_ADDRESS: LinkAddress = LinkAddress([0xE0; 6]);

pub const DEFAULT_PEER_NAME: &str = "TestPeerName";

pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SimPeerConfig {
    pub name: String,
    pub address: LinkAddress,
    pub delegate: Arc<dyn PairingDelegate>,
    /// Passkey shown when this peer displays. Random if unset.
    pub passkey: Option<u32>,
    /// As a peripheral, ask the central to start pairing.
    pub request_security: bool,
    pub pairing_timeout: Duration,
    pub advertising_interval: Duration,
}

impl SimPeerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: DEFAULT_PEER_ADDRESS,
            delegate: Arc::new(AcceptAll {
                io_capability: IoCapability::DisplayOutputAndKeyboardInput,
            }),
            passkey: None,
            request_security: false,
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            advertising_interval: Duration::from_millis(10),
        }
    }

    pub fn with_address(mut self, address: LinkAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_delegate(mut self, delegate: impl PairingDelegate + 'static) -> Self {
        self.delegate = Arc::new(delegate);
        self
    }

    pub fn with_passkey(mut self, passkey: u32) -> Self {
        self.passkey = Some(passkey);
        self
    }

    pub fn with_security_request(mut self) -> Self {
        self.request_security = true;
        self
    }

    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }
}

impl Default for SimPeerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Central,
    Peripheral,
}

struct PeerLink {
    conn: Arc<dyn LinkConnection>,
    role: PeerRole,
}

/// A peer device running the in-process pairing stack. One link at a time.
pub struct SimPeer {
    config: SimPeerConfig,
    endpoint: LinkEndpoint,
    link: Mutex<Option<PeerLink>>,
}

impl SimPeer {
    /// Attach to `bus` at the configured address.
    pub fn power_on(config: SimPeerConfig, bus: &Arc<LinkBus>) -> Self {
        let endpoint = bus.attach_with_address(config.address);
        log::debug!("peer {} powered on at {}", config.name, config.address);
        Self {
            config,
            endpoint,
            link: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn address(&self) -> LinkAddress {
        self.endpoint.address()
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .map_or(false, |link| link.conn.is_connected())
    }

    /// Advertise the configured name until a central connects.
    pub async fn advertise_until_connected(&self) -> Result<LinkAddress, PairingError> {
        self.ensure_idle().await?;
        let data = AdvertisingData::with_name(&self.config.name).to_bytes();
        let mut ticker = tokio::time::interval(self.config.advertising_interval);

        let conn = loop {
            tokio::select! {
                accepted = self.endpoint.accept() => break accepted?,
                _ = ticker.tick() => self.endpoint.start_advertising(data.clone()).await?,
            }
        };
        self.endpoint.stop_advertising().await?;

        let peer = conn.peer_address();
        log::debug!("peer {} accepted connection from {}", self.config.name, peer);
        self.store(Arc::from(conn), PeerRole::Peripheral).await;
        Ok(peer)
    }

    /// Scan until an advertiser named `target_name` shows up and connect to
    /// it. With `wait_for_security_request`, also wait for the remote side
    /// to ask for pairing before returning.
    pub async fn scan_and_connect(
        &self,
        target_name: &str,
        wait_for_security_request: bool,
    ) -> Result<LinkAddress, PairingError> {
        self.ensure_idle().await?;
        let mut advertisements = self.endpoint.advertisements();
        self.endpoint.start_scan().await?;

        let target = loop {
            match advertisements.recv().await {
                Ok(adv) if adv.source_address == self.address() => {}
                Ok(adv) if adv.connectable && adv.local_name().as_deref() == Some(target_name) => {
                    break adv.source_address;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("peer {} skipped {} advertisements", self.config.name, skipped);
                }
                Err(RecvError::Closed) => {
                    return Err(LinkError::ScanError("bus closed".to_string()).into());
                }
            }
        };
        self.endpoint.stop_scan().await?;

        let conn: Arc<dyn LinkConnection> = Arc::from(self.endpoint.connect(&target).await?);
        log::debug!("peer {} connected to {} ({})", self.config.name, target_name, target);

        if wait_for_security_request {
            loop {
                match recv_msg(conn.as_ref()).await? {
                    SmpMessage::SecurityRequest => break,
                    other => log::debug!("peer {} ignoring {:?}", self.config.name, other),
                }
            }
            log::debug!("peer {} got security request", self.config.name);
        }

        self.store(conn, PeerRole::Central).await;
        Ok(target)
    }

    /// Pair over the current link: as initiator when this peer connected
    /// out, as responder when it was connected to.
    pub async fn pair(&self) -> Result<PairingResult, PairingError> {
        let (conn, role) = {
            let link = self.link.lock().await;
            let link = link
                .as_ref()
                .ok_or_else(|| PairingError::Protocol("not connected".to_string()))?;
            (Arc::clone(&link.conn), link.role)
        };

        let delegate = self.config.delegate.as_ref();
        let timeout = self.config.pairing_timeout;
        let result = match role {
            PeerRole::Central => initiate(conn.as_ref(), delegate, false, timeout).await,
            PeerRole::Peripheral => {
                respond(
                    conn.as_ref(),
                    delegate,
                    self.config.passkey,
                    self.config.request_security,
                    timeout,
                )
                .await
            }
        };
        match &result {
            Ok(outcome) => log::debug!("peer {} paired: {:?}", self.config.name, outcome),
            Err(e) => log::debug!("peer {} pairing failed: {}", self.config.name, e),
        }
        result
    }

    /// Drop the current link. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<(), PairingError> {
        if let Some(link) = self.link.lock().await.take() {
            link.conn.disconnect().await?;
            log::debug!("peer {} disconnected", self.config.name);
        }
        Ok(())
    }

    async fn ensure_idle(&self) -> Result<(), PairingError> {
        let mut link = self.link.lock().await;
        match link.as_ref() {
            Some(current) if current.conn.is_connected() => {
                Err(PairingError::Protocol("already connected".to_string()))
            }
            _ => {
                link.take();
                Ok(())
            }
        }
    }

    async fn store(&self, conn: Arc<dyn LinkConnection>, role: PeerRole) {
        *self.link.lock().await = Some(PeerLink { conn, role });
    }
}
