//! Controller adapter
//!
//! The simulated link-layer endpoint that stands in for radio firmware. It
//! sits between a [`HostTransport`] (the DUT's side) and a [`LinkBus`] (the
//! simulated air) and does what the host tells it: advertise, scan, connect,
//! disconnect, and carry ACL payloads across the active link.
//!
//! All work happens in one background task per adapter. Advertising and
//! scanning each run as a child task feeding that loop over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::hci::{
    Command, ConnectionRole, Event, HciDecoder, HciPacket, REASON_LOCAL_HOST_TERMINATED,
    REASON_REMOTE_USER_TERMINATED, STATUS_COMMAND_DISALLOWED, STATUS_CONNECTION_FAILED,
    STATUS_SUCCESS, STATUS_UNKNOWN_COMMAND, STATUS_UNKNOWN_CONNECTION,
};
use crate::link::{
    LinkAddress, LinkAdvertisement, LinkBus, LinkCentral, LinkConnection, LinkEndpoint,
    LinkError, LinkPeripheral,
};
use crate::transport::{HostSink, HostSource, HostTransport, TransportError};

/// Random address the adapter uses unless told otherwise.
pub const DEFAULT_CONTROLLER_ADDRESS: LinkAddress = LinkAddress([0xA0; 6]);

/// How often an enabled advertiser repeats its advertisement.
pub const DEFAULT_ADVERTISING_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Host transport source already taken")]
    SourceTaken,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub name: String,
    pub address: LinkAddress,
    pub advertising_interval: Duration,
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: DEFAULT_CONTROLLER_ADDRESS,
            advertising_interval: DEFAULT_ADVERTISING_INTERVAL,
        }
    }

    pub fn with_random_address(mut self, address: LinkAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_advertising_interval(mut self, interval: Duration) -> Self {
        self.advertising_interval = interval;
        self
    }
}

/// Handle to a running controller adapter. Dropping it without calling
/// [`ControllerAdapter::close`] lets the background task wind down on its
/// own the next time it is scheduled.
pub struct ControllerAdapter {
    name: String,
    address: LinkAddress,
    connected: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControllerAdapter {
    /// Bind a new adapter to `transport` and `bus`. Takes the transport's
    /// read end, so at most one adapter can be bound to a transport.
    pub fn new(
        config: ControllerConfig,
        bus: &Arc<LinkBus>,
        transport: &mut HostTransport,
    ) -> Result<Self, ControllerError> {
        let source = transport
            .take_source()
            .ok_or(ControllerError::SourceTaken)?;
        Ok(Self::from_parts(config, bus, source, transport.sink()))
    }

    pub fn from_parts(
        config: ControllerConfig,
        bus: &Arc<LinkBus>,
        source: HostSource,
        sink: HostSink,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(4);
        let (report_tx, report_rx) = mpsc::channel(64);

        let controller = Controller {
            name: config.name.clone(),
            bus: Arc::clone(bus),
            endpoint: Arc::new(bus.attach_with_address(config.address)),
            sink,
            advertising_interval: config.advertising_interval,
            advertising_data: Vec::new(),
            advertiser: None,
            scanner: None,
            link: None,
            next_handle: 1,
            connected: Arc::clone(&connected),
            incoming_tx,
            report_tx,
        };
        let task = tokio::spawn(controller.run(source, incoming_rx, report_rx, shutdown_rx));

        log::debug!(
            "controller {} ({}) attached to bus {}",
            config.name,
            config.address,
            bus.id()
        );
        Self {
            name: config.name,
            address: config.address,
            connected,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the adapter attached with. The host may change it later.
    pub fn address(&self) -> LinkAddress {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the adapter: drop any link, stop advertising and scanning, and
    /// leave the bus. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may have ended on its own already.
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::warn!("Controller {} task panicked", self.name);
                }
            }
            log::debug!("controller {} closed", self.name);
        }
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

/// Aborts the child task when dropped, including when the owning task is
/// itself aborted.
struct ChildTask(JoinHandle<()>);

impl Drop for ChildTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ActiveLink {
    handle: u16,
    conn: Arc<dyn LinkConnection>,
}

struct Controller {
    name: String,
    bus: Arc<LinkBus>,
    endpoint: Arc<LinkEndpoint>,
    sink: HostSink,
    advertising_interval: Duration,
    advertising_data: Vec<u8>,
    advertiser: Option<ChildTask>,
    scanner: Option<ChildTask>,
    link: Option<ActiveLink>,
    next_handle: u16,
    connected: Arc<AtomicBool>,
    incoming_tx: mpsc::Sender<Box<dyn LinkConnection>>,
    report_tx: mpsc::Sender<LinkAdvertisement>,
}

impl Controller {
    async fn run(
        mut self,
        mut source: HostSource,
        mut incoming_rx: mpsc::Receiver<Box<dyn LinkConnection>>,
        mut report_rx: mpsc::Receiver<LinkAdvertisement>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut decoder = HciDecoder::new();
        loop {
            let link = self.link.as_ref().map(|l| Arc::clone(&l.conn));
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                chunk = source.recv() => match chunk {
                    Some(bytes) => {
                        decoder.push(&bytes);
                        self.drain_host_packets(&mut decoder).await
                    }
                    None => break,
                },
                Some(conn) = incoming_rx.recv() => self.on_incoming(conn).await,
                Some(adv) = report_rx.recv() => self.on_report(adv).await,
                received = recv_link(link), if self.link.is_some() => self.on_link_data(received).await,
            };
            if let Err(e) = step {
                log::debug!("controller {} stopping: {}", self.name, e);
                break;
            }
        }
        self.shutdown().await;
    }

    async fn drain_host_packets(&mut self, decoder: &mut HciDecoder) -> Result<(), TransportError> {
        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => self.on_host_packet(packet).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    log::warn!("Controller {} discarding host bytes: {}", self.name, e);
                    return Ok(());
                }
            }
        }
    }

    async fn on_host_packet(&mut self, packet: HciPacket) -> Result<(), TransportError> {
        match packet {
            HciPacket::Command { opcode, params } => match Command::parse(opcode, &params) {
                Ok(command) => self.on_command(command).await,
                Err(e) => {
                    log::warn!("Controller {} rejected command {:#06x}: {}", self.name, opcode, e);
                    self.complete(opcode, STATUS_UNKNOWN_COMMAND).await
                }
            },
            HciPacket::Acl { handle, data } => {
                match &self.link {
                    Some(link) if link.handle == handle => {
                        if let Err(e) = link.conn.send(&data).await {
                            log::debug!("controller {} ACL send failed: {}", self.name, e);
                        }
                    }
                    _ => log::debug!(
                        "controller {} dropping ACL for unknown handle {}",
                        self.name,
                        handle
                    ),
                }
                Ok(())
            }
            HciPacket::Event { code, .. } => {
                log::debug!("controller {} ignoring event {:#04x} from host", self.name, code);
                Ok(())
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<(), TransportError> {
        let opcode = command.opcode();
        match command {
            Command::SetAdvertisingData(data) => {
                self.advertising_data = data;
                self.complete(opcode, STATUS_SUCCESS).await
            }
            Command::SetAdvertisingEnable(true) => {
                if self.link.is_some() {
                    return self.complete(opcode, STATUS_COMMAND_DISALLOWED).await;
                }
                if self.advertiser.is_none() {
                    self.advertiser = Some(ChildTask(tokio::spawn(advertise(
                        Arc::clone(&self.endpoint),
                        self.advertising_data.clone(),
                        self.advertising_interval,
                        self.incoming_tx.clone(),
                    ))));
                }
                self.complete(opcode, STATUS_SUCCESS).await
            }
            Command::SetAdvertisingEnable(false) => {
                self.stop_advertising().await;
                self.complete(opcode, STATUS_SUCCESS).await
            }
            Command::SetScanEnable(true) => {
                if self.scanner.is_none() {
                    // Subscribe before returning so nothing is missed.
                    let advertisements = self.endpoint.advertisements();
                    self.scanner = Some(ChildTask(tokio::spawn(scan(
                        advertisements,
                        self.endpoint.address(),
                        self.report_tx.clone(),
                    ))));
                }
                self.complete(opcode, STATUS_SUCCESS).await
            }
            Command::SetScanEnable(false) => {
                self.scanner = None;
                self.complete(opcode, STATUS_SUCCESS).await
            }
            Command::SetRandomAddress(address) => {
                if self.advertiser.is_some() || self.scanner.is_some() || self.link.is_some() {
                    return self.complete(opcode, STATUS_COMMAND_DISALLOWED).await;
                }
                self.endpoint.detach().await;
                self.endpoint = Arc::new(self.bus.attach_with_address(address));
                log::debug!("controller {} now at {}", self.name, address);
                self.complete(opcode, STATUS_SUCCESS).await
            }
            Command::CreateConnection(peer) => {
                if self.link.is_some() {
                    return self.complete(opcode, STATUS_COMMAND_DISALLOWED).await;
                }
                self.complete(opcode, STATUS_SUCCESS).await?;
                match self.endpoint.connect(&peer).await {
                    Ok(conn) => self.establish(Arc::from(conn), ConnectionRole::Central).await,
                    Err(e) => {
                        log::debug!("controller {} failed to connect to {}: {}", self.name, peer, e);
                        self.emit(Event::ConnectionComplete {
                            status: STATUS_CONNECTION_FAILED,
                            handle: 0,
                            role: ConnectionRole::Central,
                            peer,
                        })
                        .await
                    }
                }
            }
            Command::Disconnect { handle, reason } => {
                let link = match self.link.take() {
                    Some(link) if link.handle == handle => link,
                    other => {
                        self.link = other;
                        return self.complete(opcode, STATUS_UNKNOWN_CONNECTION).await;
                    }
                };
                log::debug!(
                    "controller {} disconnecting handle {} (reason {:#04x})",
                    self.name,
                    handle,
                    reason
                );
                // Either way the link is gone.
                let _ = link.conn.disconnect().await;
                self.connected.store(false, Ordering::SeqCst);
                self.complete(opcode, STATUS_SUCCESS).await?;
                self.emit(Event::DisconnectionComplete {
                    status: STATUS_SUCCESS,
                    handle,
                    reason: REASON_LOCAL_HOST_TERMINATED,
                })
                .await
            }
            Command::Unknown { opcode } => {
                log::debug!("controller {} unknown command {:#06x}", self.name, opcode);
                self.complete(opcode, STATUS_UNKNOWN_COMMAND).await
            }
        }
    }

    async fn on_incoming(&mut self, conn: Box<dyn LinkConnection>) -> Result<(), TransportError> {
        if self.link.is_some() {
            log::debug!(
                "controller {} already connected; refusing {}",
                self.name,
                conn.peer_address()
            );
            return Ok(());
        }
        self.stop_advertising().await;
        self.establish(Arc::from(conn), ConnectionRole::Peripheral).await
    }

    async fn on_report(&mut self, adv: LinkAdvertisement) -> Result<(), TransportError> {
        if self.scanner.is_none() {
            return Ok(());
        }
        self.emit(Event::AdvertisingReport {
            address: adv.source_address,
            rssi: adv.rssi.unwrap_or(-40).clamp(i8::MIN as i16, i8::MAX as i16) as i8,
            data: adv.data,
        })
        .await
    }

    async fn on_link_data(&mut self, received: Result<Vec<u8>, LinkError>) -> Result<(), TransportError> {
        let Some(handle) = self.link.as_ref().map(|l| l.handle) else {
            return Ok(());
        };
        match received {
            Ok(data) => self.emit_packet(HciPacket::Acl { handle, data }).await,
            Err(e) => {
                log::debug!("controller {} link {} down: {}", self.name, handle, e);
                self.link = None;
                self.connected.store(false, Ordering::SeqCst);
                self.emit(Event::DisconnectionComplete {
                    status: STATUS_SUCCESS,
                    handle,
                    reason: REASON_REMOTE_USER_TERMINATED,
                })
                .await
            }
        }
    }

    async fn establish(
        &mut self,
        conn: Arc<dyn LinkConnection>,
        role: ConnectionRole,
    ) -> Result<(), TransportError> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        let peer = conn.peer_address();
        self.link = Some(ActiveLink { handle, conn });
        self.connected.store(true, Ordering::SeqCst);
        log::debug!(
            "controller {} connected to {} as {:?} (handle {})",
            self.name,
            peer,
            role,
            handle
        );
        self.emit(Event::ConnectionComplete {
            status: STATUS_SUCCESS,
            handle,
            role,
            peer,
        })
        .await
    }

    async fn stop_advertising(&mut self) {
        if self.advertiser.take().is_some() {
            if let Err(e) = self.endpoint.stop_advertising().await {
                log::debug!("controller {} stop advertising: {}", self.name, e);
            }
        }
    }

    async fn complete(&self, opcode: u16, status: u8) -> Result<(), TransportError> {
        self.emit(Event::CommandComplete { opcode, status }).await
    }

    async fn emit(&self, event: Event) -> Result<(), TransportError> {
        self.emit_packet(event.to_packet()).await
    }

    async fn emit_packet(&self, packet: HciPacket) -> Result<(), TransportError> {
        self.sink.send(Bytes::from(packet.to_bytes())).await
    }

    async fn shutdown(&mut self) {
        self.scanner = None;
        self.stop_advertising().await;
        if let Some(link) = self.link.take() {
            let _ = link.conn.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.endpoint.detach().await;
    }
}

async fn recv_link(link: Option<Arc<dyn LinkConnection>>) -> Result<Vec<u8>, LinkError> {
    match link {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn advertise(
    endpoint: Arc<LinkEndpoint>,
    data: Vec<u8>,
    interval: Duration,
    incoming: mpsc::Sender<Box<dyn LinkConnection>>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = endpoint.start_advertising(data.clone()).await {
                    log::warn!("Advertising from {} failed: {}", endpoint.address(), e);
                    return;
                }
            }
            accepted = endpoint.accept() => {
                if let Ok(conn) = accepted {
                    // The controller loop may be shutting down; the link drops with it.
                    let _ = incoming.send(conn).await;
                }
                return;
            }
        }
    }
}

async fn scan(
    mut advertisements: broadcast::Receiver<LinkAdvertisement>,
    own_address: LinkAddress,
    reports: mpsc::Sender<LinkAdvertisement>,
) {
    loop {
        match advertisements.recv().await {
            Ok(adv) if adv.source_address == own_address => {}
            Ok(adv) => {
                if reports.send(adv).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("scanner at {} skipped {} advertisements", own_address, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{OP_LE_CREATE_CONNECTION, OP_LE_SET_RANDOM_ADDRESS};
    use crate::link::AdvertisingData;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct TestHost {
        stream: DuplexStream,
        decoder: HciDecoder,
        _transport: HostTransport,
    }

    impl TestHost {
        async fn send(&mut self, command: Command) {
            self.stream
                .write_all(&command.to_packet().to_bytes())
                .await
                .unwrap();
        }

        async fn send_acl(&mut self, handle: u16, data: &[u8]) {
            let packet = HciPacket::Acl {
                handle,
                data: data.to_vec(),
            };
            self.stream.write_all(&packet.to_bytes()).await.unwrap();
        }

        async fn packet(&mut self) -> HciPacket {
            loop {
                if let Some(packet) = self.decoder.next_packet().unwrap() {
                    return packet;
                }
                let mut buf = [0u8; 512];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "controller closed the host stream");
                self.decoder.push(&buf[..n]);
            }
        }

        /// Next event other than an advertising report.
        async fn event(&mut self) -> Event {
            loop {
                match self.packet().await {
                    HciPacket::Event { code, params } => {
                        let event = Event::parse(code, &params).unwrap();
                        if !matches!(event, Event::AdvertisingReport { .. }) {
                            return event;
                        }
                    }
                    other => panic!("expected event, got {:?}", other),
                }
            }
        }

        async fn command_ok(&mut self, command: Command) {
            let opcode = command.opcode();
            self.send(command).await;
            assert_eq!(
                self.event().await,
                Event::CommandComplete {
                    opcode,
                    status: STATUS_SUCCESS
                }
            );
        }
    }

    fn adapter(bus: &Arc<LinkBus>) -> (ControllerAdapter, TestHost) {
        let (mut transport, stream) = HostTransport::pipe();
        let adapter =
            ControllerAdapter::new(ControllerConfig::new("DUT"), bus, &mut transport).unwrap();
        (
            adapter,
            TestHost {
                stream,
                decoder: HciDecoder::new(),
                _transport: transport,
            },
        )
    }

    #[tokio::test]
    async fn test_second_adapter_on_same_transport_fails() {
        let bus = LinkBus::new();
        let (mut transport, _host) = HostTransport::pipe();
        let _first = ControllerAdapter::new(ControllerConfig::new("A"), &bus, &mut transport).unwrap();
        let second = ControllerAdapter::new(ControllerConfig::new("B"), &bus, &mut transport);
        assert!(matches!(second, Err(ControllerError::SourceTaken)));
    }

    #[tokio::test]
    async fn test_advertise_accept_and_relay_acl() {
        let bus = LinkBus::new();
        let (controller, mut host) = adapter(&bus);
        assert_eq!(controller.address(), DEFAULT_CONTROLLER_ADDRESS);

        let central = bus.attach();
        let mut advertisements = central.advertisements();

        host.command_ok(Command::SetAdvertisingData(
            AdvertisingData::with_name("DUT").to_bytes(),
        ))
        .await;
        host.command_ok(Command::SetAdvertisingEnable(true)).await;

        let adv = advertisements.recv().await.unwrap();
        assert_eq!(adv.local_name().as_deref(), Some("DUT"));
        assert_eq!(adv.source_address, DEFAULT_CONTROLLER_ADDRESS);

        let conn = central.connect(&adv.source_address).await.unwrap();
        let handle = match host.event().await {
            Event::ConnectionComplete {
                status,
                handle,
                role,
                peer,
            } => {
                assert_eq!(status, STATUS_SUCCESS);
                assert_eq!(role, ConnectionRole::Peripheral);
                assert_eq!(peer, central.address());
                handle
            }
            other => panic!("expected connection complete, got {:?}", other),
        };
        assert!(controller.is_connected());

        conn.send(b"to host").await.unwrap();
        assert_eq!(
            host.packet().await,
            HciPacket::Acl {
                handle,
                data: b"to host".to_vec()
            }
        );

        host.send_acl(handle, b"to peer").await;
        assert_eq!(conn.recv().await.unwrap(), b"to peer");

        // Advertising stopped once connected.
        assert_eq!(bus.connectable_count().await, 0);
    }

    #[tokio::test]
    async fn test_scan_and_create_connection() {
        let bus = LinkBus::new();
        let (_controller, mut host) = adapter(&bus);

        let peripheral = bus.attach();
        let peripheral_address = peripheral.address();
        host.command_ok(Command::SetScanEnable(true)).await;

        peripheral
            .start_advertising(AdvertisingData::with_name("TestPeerName").to_bytes())
            .await
            .unwrap();

        let report = loop {
            match host.packet().await {
                HciPacket::Event { code, params } => match Event::parse(code, &params).unwrap() {
                    Event::AdvertisingReport { address, data, .. } => break (address, data),
                    other => panic!("unexpected event {:?}", other),
                },
                other => panic!("unexpected packet {:?}", other),
            }
        };
        assert_eq!(report.0, peripheral_address);
        assert_eq!(
            AdvertisingData::from_bytes(&report.1).local_name().as_deref(),
            Some("TestPeerName")
        );

        host.command_ok(Command::SetScanEnable(false)).await;
        host.send(Command::CreateConnection(peripheral_address)).await;
        assert_eq!(
            host.event().await,
            Event::CommandComplete {
                opcode: OP_LE_CREATE_CONNECTION,
                status: STATUS_SUCCESS
            }
        );
        assert!(matches!(
            host.event().await,
            Event::ConnectionComplete {
                status: STATUS_SUCCESS,
                role: ConnectionRole::Central,
                peer,
                ..
            } if peer == peripheral_address
        ));
        let accepted = peripheral.accept().await.unwrap();
        assert_eq!(accepted.peer_address(), DEFAULT_CONTROLLER_ADDRESS);
    }

    #[tokio::test]
    async fn test_create_connection_to_absent_peer_fails() {
        let bus = LinkBus::new();
        let (_controller, mut host) = adapter(&bus);
        let nobody: LinkAddress = "E0:E0:E0:E0:E0:E0".parse().unwrap();

        host.command_ok(Command::CreateConnection(nobody)).await;
        assert_eq!(
            host.event().await,
            Event::ConnectionComplete {
                status: STATUS_CONNECTION_FAILED,
                handle: 0,
                role: ConnectionRole::Central,
                peer: nobody,
            }
        );
    }

    #[tokio::test]
    async fn test_host_disconnect_and_peer_disconnect() {
        let bus = LinkBus::new();
        let (controller, mut host) = adapter(&bus);
        let central = bus.attach();

        host.command_ok(Command::SetAdvertisingEnable(true)).await;
        while bus.connectable_count().await == 0 {
            tokio::task::yield_now().await;
        }
        let conn = central.connect(&DEFAULT_CONTROLLER_ADDRESS).await.unwrap();
        let handle = match host.event().await {
            Event::ConnectionComplete { handle, .. } => handle,
            other => panic!("unexpected event {:?}", other),
        };

        // Unknown handle is refused.
        host.send(Command::Disconnect {
            handle: handle + 1,
            reason: 0x05,
        })
        .await;
        assert!(matches!(
            host.event().await,
            Event::CommandComplete { status: STATUS_UNKNOWN_CONNECTION, .. }
        ));

        host.command_ok(Command::Disconnect { handle, reason: 0x05 }).await;
        assert_eq!(
            host.event().await,
            Event::DisconnectionComplete {
                status: STATUS_SUCCESS,
                handle,
                reason: REASON_LOCAL_HOST_TERMINATED,
            }
        );
        assert!(!conn.is_connected());
        assert!(!controller.is_connected());

        // Second connection, this time dropped by the peer.
        host.command_ok(Command::SetAdvertisingEnable(true)).await;
        while bus.connectable_count().await == 0 {
            tokio::task::yield_now().await;
        }
        let conn = central.connect(&DEFAULT_CONTROLLER_ADDRESS).await.unwrap();
        let handle = match host.event().await {
            Event::ConnectionComplete { handle, .. } => handle,
            other => panic!("unexpected event {:?}", other),
        };
        conn.disconnect().await.unwrap();
        assert_eq!(
            host.event().await,
            Event::DisconnectionComplete {
                status: STATUS_SUCCESS,
                handle,
                reason: REASON_REMOTE_USER_TERMINATED,
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_command_and_random_address() {
        let bus = LinkBus::new();
        let (_controller, mut host) = adapter(&bus);

        host.send(Command::Unknown { opcode: 0x0C03 }).await;
        assert_eq!(
            host.event().await,
            Event::CommandComplete {
                opcode: 0x0C03,
                status: STATUS_UNKNOWN_COMMAND
            }
        );

        let address: LinkAddress = "C1:C2:C3:C4:C5:C6".parse().unwrap();
        host.command_ok(Command::SetRandomAddress(address)).await;
        host.command_ok(Command::SetAdvertisingEnable(true)).await;
        while bus.connectable_count().await == 0 {
            tokio::task::yield_now().await;
        }
        let central = bus.attach();
        assert!(central.connect(&address).await.is_ok());

        // Changing address while advertising or connected is refused.
        host.send(Command::SetRandomAddress(DEFAULT_CONTROLLER_ADDRESS)).await;
        loop {
            match host.event().await {
                Event::ConnectionComplete { .. } => continue,
                Event::CommandComplete { opcode, status } => {
                    assert_eq!(status, STATUS_COMMAND_DISALLOWED);
                    assert_eq!(opcode, OP_LE_SET_RANDOM_ADDRESS);
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_leaves_bus() {
        let bus = LinkBus::new();
        let (mut controller, mut host) = adapter(&bus);
        host.command_ok(Command::SetAdvertisingEnable(true)).await;
        while bus.connectable_count().await == 0 {
            tokio::task::yield_now().await;
        }

        controller.close().await;
        controller.close().await;
        assert_eq!(bus.connectable_count().await, 0);

        let central = bus.attach();
        assert!(central.connect(&DEFAULT_CONTROLLER_ADDRESS).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_ignores_own_advertisements() {
        let bus = LinkBus::new();
        let (_controller, mut host) = adapter(&bus);
        host.command_ok(Command::SetScanEnable(true)).await;
        host.send(Command::SetAdvertisingEnable(true)).await;

        // Only the command completion arrives; our own advertisements are
        // not reported back.
        assert!(matches!(host.packet().await, HciPacket::Event { .. }));
        let next = tokio::time::timeout(Duration::from_millis(50), host.packet()).await;
        assert!(next.is_err());
    }
}
