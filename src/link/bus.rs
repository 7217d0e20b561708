//! In-process link bus
//!
//! The shared medium through which every attached endpoint communicates.
//! Advertisements are broadcast to every subscriber on the same bus;
//! connections are pairs of channels created on demand between a central
//! and an advertising peripheral.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use uuid::Uuid;

use super::transport::{LinkAddress, LinkAdvertisement, LinkCentral, LinkConnection, LinkPeripheral};
use super::LinkError;

/// Default maximum payload per link-layer send.
pub const DEFAULT_MTU: usize = 251;

/// The simulated medium. No owner; any number of endpoints may attach.
pub struct LinkBus {
    id: Uuid,
    /// Broadcast channel for advertisements.
    adv_tx: broadcast::Sender<LinkAdvertisement>,
    /// Peripherals currently accepting connections, keyed by address.
    peripherals: Mutex<HashMap<LinkAddress, mpsc::Sender<Box<dyn LinkConnection>>>>,
}

impl LinkBus {
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(256);
        let bus = Arc::new(Self {
            id: Uuid::new_v4(),
            adv_tx,
            peripherals: Mutex::new(HashMap::new()),
        });
        log::debug!("link bus {} created", bus.id);
        bus
    }

    /// Identifier used in logs to tell bus instances apart.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach a new endpoint with a random static address.
    pub fn attach(self: &Arc<Self>) -> LinkEndpoint {
        self.attach_with_address(LinkAddress::random_static())
    }

    pub fn attach_with_address(self: &Arc<Self>, address: LinkAddress) -> LinkEndpoint {
        let (conn_tx, conn_rx) = mpsc::channel(16);
        log::debug!("endpoint {} attached to bus {}", address, self.id);
        LinkEndpoint {
            address,
            bus: Arc::clone(self),
            mtu: DEFAULT_MTU,
            latency: Duration::ZERO,
            conn_tx,
            conn_rx: Mutex::new(conn_rx),
        }
    }

    /// Number of peripherals currently accepting connections.
    pub async fn connectable_count(&self) -> usize {
        self.peripherals.lock().await.len()
    }
}

/// An endpoint attached to a [`LinkBus`], usable in both roles.
pub struct LinkEndpoint {
    address: LinkAddress,
    bus: Arc<LinkBus>,
    mtu: usize,
    /// Applied to each send().
    latency: Duration,
    conn_tx: mpsc::Sender<Box<dyn LinkConnection>>,
    conn_rx: Mutex<mpsc::Receiver<Box<dyn LinkConnection>>>,
}

impl LinkEndpoint {
    pub fn address(&self) -> LinkAddress {
        self.address
    }

    pub fn bus(&self) -> &Arc<LinkBus> {
        &self.bus
    }

    /// Change the address this endpoint advertises and connects from.
    /// Takes effect for subsequent advertising and connections.
    pub fn set_address(&mut self, address: LinkAddress) {
        self.address = address;
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Uses tokio time, so paused clocks advance instantly in tests.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Stop accepting connections and leave the bus's connectable set.
    pub async fn detach(&self) {
        self.bus.peripherals.lock().await.remove(&self.address);
        log::debug!("endpoint {} detached from bus {}", self.address, self.bus.id);
    }
}

/// One side of a link, backed by tokio mpsc channels. Both sides share a
/// watch flag so either disconnecting (or being dropped) is seen by the other.
pub struct BusConnection {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    up: Arc<watch::Sender<bool>>,
    up_rx: watch::Receiver<bool>,
    peer_address: LinkAddress,
    mtu: usize,
    latency: Duration,
}

impl BusConnection {
    fn create_pair(
        addr_a: LinkAddress,
        addr_b: LinkAddress,
        mtu: usize,
        latency: Duration,
    ) -> (BusConnection, BusConnection) {
        let (tx_ab, rx_ab) = mpsc::channel(64);
        let (tx_ba, rx_ba) = mpsc::channel(64);
        let (up_tx, up_rx) = watch::channel(true);
        let up = Arc::new(up_tx);

        let conn_a = BusConnection {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            up: Arc::clone(&up),
            up_rx: up_rx.clone(),
            peer_address: addr_b,
            mtu,
            latency,
        };

        let conn_b = BusConnection {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            up,
            up_rx,
            peer_address: addr_a,
            mtu,
            latency,
        };

        (conn_a, conn_b)
    }
}

async fn link_down(mut up: watch::Receiver<bool>) {
    loop {
        let is_up = *up.borrow_and_update();
        if !is_up || up.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl LinkConnection for BusConnection {
    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        if data.len() > self.mtu {
            return Err(LinkError::MtuExceeded {
                size: data.len(),
                mtu: self.mtu,
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| LinkError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        // Payloads already in flight are delivered before the disconnect.
        tokio::select! {
            biased;
            received = rx.recv() => received.ok_or(LinkError::Disconnected),
            _ = link_down(self.up_rx.clone()) => Err(LinkError::Disconnected),
        }
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.up.send_replace(false);
        Ok(())
    }

    fn peer_address(&self) -> LinkAddress {
        self.peer_address
    }

    fn is_connected(&self) -> bool {
        *self.up_rx.borrow()
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.up.send_replace(false);
    }
}

#[async_trait]
impl LinkCentral for LinkEndpoint {
    async fn start_scan(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<LinkAdvertisement> {
        self.bus.adv_tx.subscribe()
    }

    async fn connect(&self, address: &LinkAddress) -> Result<Box<dyn LinkConnection>, LinkError> {
        let conn_sender = {
            let peripherals = self.bus.peripherals.lock().await;
            peripherals
                .get(address)
                .cloned()
                .ok_or(LinkError::Unreachable(*address))?
        };

        let (conn_central, conn_peripheral) =
            BusConnection::create_pair(self.address, *address, self.mtu, self.latency);

        conn_sender
            .send(Box::new(conn_peripheral))
            .await
            .map_err(|_| {
                LinkError::ConnectionError(
                    "Peripheral is no longer accepting connections".to_string(),
                )
            })?;

        log::debug!("{} connected to {} on bus {}", self.address, address, self.bus.id);
        Ok(Box::new(conn_central))
    }
}

#[async_trait]
impl LinkPeripheral for LinkEndpoint {
    async fn start_advertising(&self, data: Vec<u8>) -> Result<(), LinkError> {
        {
            let mut peripherals = self.bus.peripherals.lock().await;
            peripherals.insert(self.address, self.conn_tx.clone());
        }
        let adv = LinkAdvertisement {
            data,
            rssi: None,
            source_address: self.address,
            connectable: true,
        };
        // No subscribers is not an error: nobody is scanning yet.
        let _ = self.bus.adv_tx.send(adv);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), LinkError> {
        let mut peripherals = self.bus.peripherals.lock().await;
        peripherals.remove(&self.address);
        Ok(())
    }

    async fn accept(&self) -> Result<Box<dyn LinkConnection>, LinkError> {
        let mut rx = self.conn_rx.lock().await;
        rx.recv().await.ok_or(LinkError::Disconnected)
    }
}
