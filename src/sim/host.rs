//! Simulated DUT host stack
//!
//! Speaks HCI to a controller adapter through its host transport, the same
//! way DUT firmware does, and reports milestones on a console in the
//! firmware's own wording (`bt_conn_loop: Paired. bonded=1`,
//! `PK<654321>`, ...). Pointing the console at a DUT process that echoes
//! its input makes those lines appear on the DUT's standard output, where a
//! line monitor can pick them up.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::hci::{
    Command, ConnectionRole, Event, HciDecoder, HciPacket, REASON_AUTHENTICATION_FAILURE,
    REASON_REMOTE_USER_TERMINATED, STATUS_SUCCESS,
};
use crate::link::{AdvertisingData, LinkAddress, LinkConnection, LinkError};
use crate::markers::{BONDED_MARKER, DISCONNECTED_MARKER, PEER_NAME_WRONG_MARKER};
use crate::pairing::{IoCapability, PairingDelegate, PairingError, PairingResult};
use crate::process::StdinWriter;
use crate::relay::Relay;

use super::protocol::{initiate, respond};

const READ_CHUNK: usize = 1024;
const STASH_LIMIT: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Host transport error: {0}")]
    Transport(String),

    #[error("Command {opcode:#06x} failed with status {status:#04x}")]
    CommandFailed { opcode: u16, status: u8 },

    #[error("Connection failed with status {0:#04x}")]
    ConnectionFailed(u8),

    #[error("Controller went away")]
    Closed,
}

enum Inbound {
    Data(Vec<u8>),
    Disconnected,
}

struct EventQueue {
    rx: mpsc::Receiver<Event>,
    stash: VecDeque<Event>,
}

struct HostInner {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    events: Mutex<EventQueue>,
    acl: Mutex<mpsc::Receiver<Inbound>>,
}

impl HostInner {
    async fn write(&self, packet: HciPacket) -> Result<(), HostError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&packet.to_bytes())
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| HostError::Transport(e.to_string()))
    }

    /// Wait for the first event `pick` accepts. Events it passes over are
    /// kept for later callers.
    async fn next_event<T>(&self, mut pick: impl FnMut(&Event) -> Option<T>) -> Result<T, HostError> {
        let mut queue = self.events.lock().await;
        for i in 0..queue.stash.len() {
            if let Some(value) = pick(&queue.stash[i]) {
                queue.stash.remove(i);
                return Ok(value);
            }
        }
        loop {
            let event = queue.rx.recv().await.ok_or(HostError::Closed)?;
            if let Some(value) = pick(&event) {
                return Ok(value);
            }
            if queue.stash.len() == STASH_LIMIT {
                queue.stash.pop_front();
            }
            queue.stash.push_back(event);
        }
    }

    async fn command(&self, command: Command) -> Result<(), HostError> {
        let opcode = command.opcode();
        self.write(command.to_packet()).await?;
        let status = self
            .next_event(|event| match event {
                Event::CommandComplete { opcode: done, status } if *done == opcode => Some(*status),
                _ => None,
            })
            .await?;
        if status != STATUS_SUCCESS {
            return Err(HostError::CommandFailed { opcode, status });
        }
        Ok(())
    }
}

/// Host side of one HCI transport.
pub struct SimHost {
    name: String,
    inner: Arc<HostInner>,
    console: Option<StdinWriter>,
    passkey_timeout: Duration,
    reader: JoinHandle<()>,
}

impl SimHost {
    /// Dial a TCP host transport, as a DUT given `--bt-dev=<addr>` would.
    pub async fn connect(addr: SocketAddr, name: &str) -> Result<Self, HostError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HostError::Transport(format!("{}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("host {} could not set TCP_NODELAY: {}", name, e);
        }
        Ok(Self::from_stream(stream, name))
    }

    pub fn from_stream<S>(stream: S, name: &str) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (acl_tx, acl_rx) = mpsc::channel(64);
        let reader = tokio::spawn(read_packets(name.to_string(), reader, event_tx, acl_tx));

        Self {
            name: name.to_string(),
            inner: Arc::new(HostInner {
                writer: Mutex::new(Box::new(writer)),
                events: Mutex::new(EventQueue {
                    rx: event_rx,
                    stash: VecDeque::new(),
                }),
                acl: Mutex::new(acl_rx),
            }),
            console: None,
            passkey_timeout: Duration::from_secs(10),
            reader,
        }
    }

    /// Report milestones on `console` as well as in the log.
    pub fn with_console(mut self, console: StdinWriter) -> Self {
        self.console = Some(console);
        self
    }

    pub fn with_passkey_timeout(mut self, timeout: Duration) -> Self {
        self.passkey_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn set_random_address(&self, address: LinkAddress) -> Result<(), HostError> {
        self.inner.command(Command::SetRandomAddress(address)).await
    }

    /// Advertise as `name` and wait for a central to connect.
    pub async fn advertise(&self, name: &str) -> Result<HostConnection, HostError> {
        let data = AdvertisingData::with_name(name).to_bytes();
        self.inner.command(Command::SetAdvertisingData(data)).await?;
        self.inner.command(Command::SetAdvertisingEnable(true)).await?;
        log::debug!("host {} advertising as {}", self.name, name);
        self.await_connection().await
    }

    /// Scan until a device named `name` advertises, then connect to it.
    /// Every other advertiser is reported once as a wrong peer name.
    pub async fn connect_to_named(&self, name: &str) -> Result<HostConnection, HostError> {
        self.inner.command(Command::SetScanEnable(true)).await?;
        let mut reported = HashSet::new();
        let target = loop {
            let (address, data) = self
                .inner
                .next_event(|event| match event {
                    Event::AdvertisingReport { address, data, .. } => Some((*address, data.clone())),
                    _ => None,
                })
                .await?;
            match AdvertisingData::from_bytes(&data).local_name() {
                Some(found) if found == name => break address,
                found => {
                    if reported.insert(address) {
                        log::debug!("host {} skipping {} ({:?})", self.name, address, found);
                        self.say(&format!("bt_conn_loop: device_found: {}", PEER_NAME_WRONG_MARKER))
                            .await;
                    }
                }
            }
        };
        self.inner.command(Command::SetScanEnable(false)).await?;
        self.inner.command(Command::CreateConnection(target)).await?;
        self.await_connection().await
    }

    /// Pair over `conn` as the DUT firmware would: as responder (asking for
    /// security first) when connected to, as initiator when connecting out.
    /// Success prints the bonded marker; a failed pairing disconnects with
    /// an authentication failure and prints the disconnect reason.
    pub async fn pair(
        &self,
        conn: &HostConnection,
        delegate: &dyn PairingDelegate,
        passkey: Option<u32>,
    ) -> Result<PairingResult, PairingError> {
        let result = match conn.role() {
            ConnectionRole::Peripheral => {
                respond(conn, delegate, passkey, true, self.passkey_timeout).await
            }
            ConnectionRole::Central => initiate(conn, delegate, false, self.passkey_timeout).await,
        };

        match &result {
            Ok(outcome) if outcome.bonded => {
                self.say(&format!("bt_conn_loop: {}", BONDED_MARKER)).await;
            }
            Ok(_) => {}
            Err(PairingError::Transport(_)) => {
                self.report_disconnect(REASON_REMOTE_USER_TERMINATED).await;
            }
            Err(e) => {
                log::debug!("host {} pairing failed: {}", self.name, e);
                if let Err(e) = conn.disconnect_with(REASON_AUTHENTICATION_FAILURE).await {
                    log::debug!("host {} disconnect failed: {}", self.name, e);
                }
                self.report_disconnect(REASON_AUTHENTICATION_FAILURE).await;
            }
        }
        result
    }

    /// Print a console line.
    pub async fn say(&self, line: &str) {
        log::info!("[{}] {}", self.name, line);
        if let Some(console) = &self.console {
            if let Err(e) = console.write_line(line).await {
                log::warn!("Host {} console write failed: {}", self.name, e);
            }
        }
    }

    /// A pairing delegate that shows passkeys on this host's console.
    pub fn console_delegate(&self, io_capability: IoCapability) -> ConsoleDelegate {
        ConsoleDelegate {
            console: self.console.clone(),
            io_capability,
            input: None,
        }
    }

    async fn report_disconnect(&self, reason: u8) {
        self.say(&format!("bt_conn_loop: reason {}: {}", reason, DISCONNECTED_MARKER))
            .await;
    }

    async fn await_connection(&self) -> Result<HostConnection, HostError> {
        let (status, handle, role, peer) = self
            .inner
            .next_event(|event| match event {
                Event::ConnectionComplete {
                    status,
                    handle,
                    role,
                    peer,
                } => Some((*status, *handle, *role, *peer)),
                _ => None,
            })
            .await?;
        if status != STATUS_SUCCESS {
            return Err(HostError::ConnectionFailed(status));
        }
        log::debug!("host {} connected to {} as {:?}", self.name, peer, role);
        Ok(HostConnection {
            handle,
            peer,
            role,
            inner: Arc::clone(&self.inner),
            up: AtomicBool::new(true),
        })
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_packets<R>(
    name: String,
    mut reader: R,
    events: mpsc::Sender<Event>,
    acl: mpsc::Sender<Inbound>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = HciDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("host {} read failed: {}", name, e);
                break;
            }
        };
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_packet() {
                Ok(Some(HciPacket::Event { code, params })) => match Event::parse(code, &params) {
                    Ok(event) => {
                        if matches!(event, Event::DisconnectionComplete { .. }) {
                            // Nobody may be reading ACL data any more.
                            let _ = acl.try_send(Inbound::Disconnected);
                        }
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::debug!("host {} dropped event {:#04x}: {}", name, code, e),
                },
                Ok(Some(HciPacket::Acl { data, .. })) => {
                    if acl.send(Inbound::Data(data)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(HciPacket::Command { opcode, .. })) => {
                    log::debug!("host {} ignoring command {:#06x} from controller", name, opcode);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Host {} discarding controller bytes: {}", name, e);
                    break;
                }
            }
        }
    }
    log::debug!("host {} transport closed", name);
}

/// A connection established through the controller.
pub struct HostConnection {
    handle: u16,
    peer: LinkAddress,
    role: ConnectionRole,
    inner: Arc<HostInner>,
    up: AtomicBool,
}

impl HostConnection {
    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Ask the controller to drop the link, citing `reason`.
    pub async fn disconnect_with(&self, reason: u8) -> Result<(), HostError> {
        if !self.up.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .command(Command::Disconnect {
                handle: self.handle,
                reason,
            })
            .await
    }
}

#[async_trait]
impl LinkConnection for HostConnection {
    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        self.inner
            .write(HciPacket::Acl {
                handle: self.handle,
                data: data.to_vec(),
            })
            .await
            .map_err(|e| LinkError::ConnectionError(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        match self.inner.acl.lock().await.recv().await {
            Some(Inbound::Data(data)) => Ok(data),
            Some(Inbound::Disconnected) | None => {
                self.up.store(false, Ordering::SeqCst);
                Err(LinkError::Disconnected)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.disconnect_with(REASON_REMOTE_USER_TERMINATED)
            .await
            .map_err(|e| LinkError::ConnectionError(e.to_string()))
    }

    fn peer_address(&self) -> LinkAddress {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// Pairing delegate for the simulated DUT: displayed passkeys go to the
/// console as `PK<digits>`; passkeys to enter come from a relay.
pub struct ConsoleDelegate {
    console: Option<StdinWriter>,
    io_capability: IoCapability,
    input: Option<Relay<u32>>,
}

impl ConsoleDelegate {
    pub fn with_input(mut self, input: Relay<u32>) -> Self {
        self.input = Some(input);
        self
    }
}

#[async_trait]
impl PairingDelegate for ConsoleDelegate {
    fn io_capability(&self) -> IoCapability {
        self.io_capability
    }

    async fn provide_number(&self) -> Option<u32> {
        self.input.as_ref()?.wait().await.ok()
    }

    async fn display_number(&self, value: u32, digits: usize) {
        let line = format!("PK<{:0width$}>", value, width = digits);
        log::info!("{}", line);
        if let Some(console) = &self.console {
            if let Err(e) = console.write_line(&line).await {
                log::warn!("Failed to display passkey: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerAdapter, ControllerConfig};
    use crate::link::LinkBus;
    use crate::pairing::{AcceptAll, PairingMethod};
    use crate::sim::{SimPeer, SimPeerConfig};
    use crate::transport::HostTransport;

    struct Rig {
        bus: Arc<LinkBus>,
        host: SimHost,
        _controller: ControllerAdapter,
        _transport: HostTransport,
    }

    fn rig() -> Rig {
        let bus = LinkBus::new();
        let (mut transport, host_end) = HostTransport::pipe();
        let controller =
            ControllerAdapter::new(ControllerConfig::new("DUT"), &bus, &mut transport).unwrap();
        Rig {
            bus,
            host: SimHost::from_stream(host_end, "DUT"),
            _controller: controller,
            _transport: transport,
        }
    }

    #[tokio::test]
    async fn test_peer_connects_to_advertising_host_and_pairs() {
        let rig = rig();
        let peer = SimPeer::power_on(
            SimPeerConfig::default().with_delegate(AcceptAll::default()),
            &rig.bus,
        );

        let (conn, connected) = tokio::join!(
            rig.host.advertise("DUT"),
            peer.scan_and_connect("DUT", false),
        );
        let conn = conn.unwrap();
        assert_eq!(connected.unwrap(), crate::controller::DEFAULT_CONTROLLER_ADDRESS);
        assert_eq!(conn.role(), ConnectionRole::Peripheral);
        assert_eq!(conn.peer_address(), peer.address());

        let delegate = rig.host.console_delegate(IoCapability::NoOutputNoInput);
        let (hosted, paired) = tokio::join!(rig.host.pair(&conn, &delegate, None), peer.pair());
        assert_eq!(hosted.unwrap().method, PairingMethod::JustWorks);
        assert!(paired.unwrap().bonded);
    }

    #[tokio::test]
    async fn test_host_connects_to_named_peer_and_reads_passkey() {
        let rig = rig();
        let decoy = SimPeer::power_on(
            SimPeerConfig::new("WRONG_TestPeerName").with_address(LinkAddress([0xC2; 6])),
            &rig.bus,
        );
        let peer = SimPeer::power_on(SimPeerConfig::default().with_passkey(123456), &rig.bus);
        let decoy_task = tokio::spawn(async move { decoy.advertise_until_connected().await });

        let (conn, accepted) = tokio::join!(
            rig.host.connect_to_named("TestPeerName"),
            peer.advertise_until_connected(),
        );
        let conn = conn.unwrap();
        assert_eq!(conn.role(), ConnectionRole::Central);
        assert_eq!(accepted.unwrap(), crate::controller::DEFAULT_CONTROLLER_ADDRESS);

        // The peer displays 123456 and the host types it.
        let typed = Relay::new();
        typed.resolve(123456);
        let delegate = rig
            .host
            .console_delegate(IoCapability::KeyboardInputOnly)
            .with_input(typed);
        let (hosted, paired) = tokio::join!(rig.host.pair(&conn, &delegate, None), peer.pair());
        assert_eq!(hosted.unwrap().method, PairingMethod::InitiatorEntersPasskey);
        assert!(paired.unwrap().bonded);
        decoy_task.abort();
    }

    #[tokio::test]
    async fn test_failed_pairing_disconnects_peer() {
        let rig = rig();
        let peer = SimPeer::power_on(
            SimPeerConfig::default().with_delegate(crate::pairing::FixedPasskey { value: 111111 }),
            &rig.bus,
        );

        let (conn, connected) = tokio::join!(
            rig.host.advertise("DUT"),
            peer.scan_and_connect("DUT", false),
        );
        let conn = conn.unwrap();
        connected.unwrap();

        let delegate = rig.host.console_delegate(IoCapability::DisplayOutputOnly);
        let (hosted, paired) = tokio::join!(
            rig.host.pair(&conn, &delegate, Some(654321)),
            peer.pair()
        );
        assert!(matches!(hosted, Err(PairingError::AuthenticationFailed { .. })));
        assert!(matches!(paired, Err(PairingError::AuthenticationFailed { .. })));
        assert!(!conn.is_connected());

        while peer.is_connected().await {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_commands_fail_cleanly() {
        let rig = rig();
        let peer = SimPeer::power_on(SimPeerConfig::default(), &rig.bus);
        let (conn, connected) = tokio::join!(
            rig.host.advertise("DUT"),
            peer.scan_and_connect("DUT", false),
        );
        let _conn = conn.unwrap();
        connected.unwrap();

        // Address changes are refused while connected.
        assert_eq!(
            rig.host.set_random_address(LinkAddress([0xC4; 6])).await,
            Err(HostError::CommandFailed {
                opcode: crate::hci::OP_LE_SET_RANDOM_ADDRESS,
                status: crate::hci::STATUS_COMMAND_DISALLOWED,
            })
        );
    }
}
