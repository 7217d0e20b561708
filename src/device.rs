//! Device process supervisor
//!
//! A [`ManagedDevice`] owns everything one DUT needs: the host transport
//! the DUT dials into, the controller adapter that bridges that transport
//! onto the link bus, and the DUT process itself. Setup happens once, in
//! that order, the first time anyone calls [`ManagedDevice::enter`]; every
//! later caller sees the same outcome. Teardown runs in reverse order,
//! releases only what was actually acquired, and is safe to repeat.
//!
//! If a scope is abandoned without an explicit close (for example an outer
//! timeout drops the future), the held resources still go away on drop:
//! the process is killed and the transport and controller tasks stop.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::process::ChildStdout;
use tokio::sync::{Mutex, OnceCell};

use crate::controller::{ControllerAdapter, ControllerConfig};
use crate::link::LinkBus;
use crate::process::{DutCommand, DutProcess, ProcessError, StdinWriter};
use crate::transport::{HciEndpoint, HostTransport, TransportError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("DUT process failed to start: {0}")]
    ProcessStart(String),

    #[error("Controller adapter failed: {0}")]
    Controller(String),

    #[error("Device already released")]
    Released,
}

/// Produces the host transport.
pub type TransportFuture = BoxFuture<'static, Result<HostTransport, TransportError>>;

/// Starts the DUT. Receives the address the transport actually bound, so
/// a transport on an ephemeral port can still be handed to the DUT.
pub type ProcessFactory =
    Box<dyn FnOnce(Option<SocketAddr>) -> BoxFuture<'static, Result<DutProcess, ProcessError>> + Send>;

struct Factories {
    transport: TransportFuture,
    process: ProcessFactory,
}

#[derive(Default)]
struct Held {
    transport: Option<HostTransport>,
    controller: Option<ControllerAdapter>,
    process: Option<DutProcess>,
}

impl Held {
    fn summary(&self) -> HeldResources {
        HeldResources {
            transport: self.transport.is_some(),
            controller: self.controller.is_some(),
            process: self.process.is_some(),
        }
    }
}

/// Which resources a device holds (or just released).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldResources {
    pub transport: bool,
    pub controller: bool,
    pub process: bool,
}

impl HeldResources {
    pub fn is_empty(&self) -> bool {
        !(self.transport || self.controller || self.process)
    }
}

pub struct ManagedDevice {
    config: ControllerConfig,
    bus: Arc<LinkBus>,
    factories: std::sync::Mutex<Option<Factories>>,
    init: OnceCell<Result<(), DeviceError>>,
    held: Mutex<Held>,
    transport_addr: std::sync::Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl ManagedDevice {
    /// Describe a device. Nothing starts until [`ManagedDevice::enter`].
    pub fn new(
        config: ControllerConfig,
        bus: &Arc<LinkBus>,
        transport: TransportFuture,
        process: ProcessFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus: Arc::clone(bus),
            factories: std::sync::Mutex::new(Some(Factories { transport, process })),
            init: OnceCell::new(),
            held: Mutex::new(Held::default()),
            transport_addr: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn bus(&self) -> &Arc<LinkBus> {
        &self.bus
    }

    /// Where the transport is listening, once it is up.
    pub fn transport_addr(&self) -> Option<SocketAddr> {
        *self.transport_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bring the device up, or observe the outcome of an earlier attempt.
    /// Concurrent callers wait for the first one to finish. On failure the
    /// partial setup has already been released when this returns.
    pub async fn enter(&self) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Released);
        }
        self.init.get_or_init(|| self.initialize()).await.clone()
    }

    /// Release the device. Only the first call does anything; it returns
    /// what it released.
    pub async fn close(&self) -> HeldResources {
        if self.closed.swap(true, Ordering::SeqCst) {
            return HeldResources::default();
        }
        // Factories that never ran never will.
        self.factories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let released = self.release().await;
        log::debug!("device {} closed ({:?})", self.name(), released);
        released
    }

    /// Run `body` against the device between `enter` and `close`. The
    /// device is closed on every exit path, including a panic in `body`,
    /// which is resumed once teardown is done.
    pub async fn scope<F, Fut, T, E>(self: &Arc<Self>, body: F) -> Result<T, E>
    where
        F: FnOnce(Arc<ManagedDevice>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DeviceError>,
    {
        if let Err(e) = self.enter().await {
            self.close().await;
            return Err(e.into());
        }
        let outcome = AssertUnwindSafe(body(Arc::clone(self)))
            .catch_unwind()
            .await;
        self.close().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Which resources are currently held.
    pub async fn held(&self) -> HeldResources {
        self.held.lock().await.summary()
    }

    /// The DUT's standard output. Only the first call returns it.
    pub async fn take_stdout(&self) -> Option<ChildStdout> {
        self.held.lock().await.process.as_mut()?.take_stdout()
    }

    pub async fn stdin(&self) -> Option<StdinWriter> {
        self.held.lock().await.process.as_ref().map(DutProcess::stdin)
    }

    pub async fn is_connected(&self) -> bool {
        self.held
            .lock()
            .await
            .controller
            .as_ref()
            .map_or(false, ControllerAdapter::is_connected)
    }

    /// Whether the DUT has exited. A device without a process counts as exited.
    pub async fn has_exited(&self) -> bool {
        self.held
            .lock()
            .await
            .process
            .as_mut()
            .map_or(true, DutProcess::has_exited)
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        let factories = self
            .factories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Factories { transport, process }) = factories else {
            return Err(DeviceError::Released);
        };

        let result = self.acquire(transport, process).await;
        match &result {
            Ok(()) => log::debug!("device {} ready", self.name()),
            Err(e) => {
                log::warn!("Device {} setup failed: {}", self.name(), e);
                let released = self.release().await;
                log::debug!("device {} released after failed setup ({:?})", self.name(), released);
            }
        }
        result
    }

    async fn acquire(
        &self,
        transport: TransportFuture,
        process: ProcessFactory,
    ) -> Result<(), DeviceError> {
        log::debug!("device {}: opening transport", self.name());
        let transport = transport
            .await
            .map_err(|e| DeviceError::TransportUnavailable(e.to_string()))?;
        let bound = transport.local_addr();
        *self.transport_addr.lock().unwrap_or_else(|e| e.into_inner()) = bound;

        {
            let mut held = self.held.lock().await;
            let transport = held.transport.insert(transport);
            log::debug!("device {}: attaching controller to {}", self.name(), transport.description());
            let controller = ControllerAdapter::new(self.config.clone(), &self.bus, transport)
                .map_err(|e| DeviceError::Controller(e.to_string()))?;
            held.controller = Some(controller);
        }
        self.ensure_open()?;

        log::debug!("device {}: starting process", self.name());
        let process = process(bound)
            .await
            .map_err(|e| DeviceError::ProcessStart(e.to_string()))?;
        self.held.lock().await.process = Some(process);
        self.ensure_open()
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Released);
        }
        Ok(())
    }

    /// Process, then controller, then transport. Missing pieces are skipped.
    async fn release(&self) -> HeldResources {
        let mut held = self.held.lock().await;
        let released = held.summary();

        if let Some(mut process) = held.process.take() {
            if let Err(e) = process.terminate().await {
                log::warn!("Device {}: failed to terminate {}: {}", self.name(), process.program(), e);
            }
        }
        if let Some(mut controller) = held.controller.take() {
            controller.close().await;
        }
        if let Some(mut transport) = held.transport.take() {
            transport.close().await;
        }
        released
    }
}

/// A DUT reached over a TCP host transport on `port` (0 for ephemeral),
/// started as `<program> --bt-dev=<addr> <extra_args...>`.
pub fn dut_device(
    name: &str,
    port: u16,
    bus: &Arc<LinkBus>,
    program: impl AsRef<Path>,
    extra_args: Vec<String>,
) -> Arc<ManagedDevice> {
    let endpoint = HciEndpoint::localhost(port);
    let program: PathBuf = program.as_ref().to_path_buf();
    let transport: TransportFuture =
        Box::pin(async move { HostTransport::open_tcp_server(&endpoint).await });
    let process: ProcessFactory = Box::new(move |bound| {
        Box::pin(async move {
            let endpoint = match bound {
                Some(addr) => HciEndpoint::new(addr.ip().to_string(), addr.port()),
                None => HciEndpoint::localhost(port),
            };
            DutCommand::new(&program, endpoint).args(extra_args).spawn()
        })
    });
    ManagedDevice::new(ControllerConfig::new(name), bus, transport, process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pipe_transport() -> TransportFuture {
        Box::pin(async {
            let (transport, _host) = HostTransport::pipe();
            Ok(transport)
        })
    }

    fn failing_process(calls: Arc<AtomicUsize>) -> ProcessFactory {
        Box::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(ProcessError::SpawnFailed {
                    program: "zephyr.exe".to_string(),
                    reason: "No such file or directory".to_string(),
                })
            })
        })
    }

    #[tokio::test]
    async fn test_transport_failure_skips_everything_else() {
        let bus = LinkBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let transport: TransportFuture = Box::pin(async {
            Err(TransportError::Unavailable {
                endpoint: "127.0.0.1:23458".to_string(),
                reason: "Address in use".to_string(),
            })
        });
        let device = ManagedDevice::new(
            ControllerConfig::new("DUT"),
            &bus,
            transport,
            failing_process(Arc::clone(&calls)),
        );

        let err = device.enter().await.unwrap_err();
        assert!(matches!(err, DeviceError::TransportUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(device.held().await.is_empty());
        assert_eq!(bus.connectable_count().await, 0);
    }

    #[tokio::test]
    async fn test_process_failure_releases_transport_and_controller() {
        let bus = LinkBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let device = ManagedDevice::new(
            ControllerConfig::new("DUT"),
            &bus,
            pipe_transport(),
            failing_process(Arc::clone(&calls)),
        );

        let err = device.enter().await.unwrap_err();
        assert!(matches!(err, DeviceError::ProcessStart(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(device.held().await.is_empty());

        // Same outcome for every later awaiter, without rerunning setup.
        assert_eq!(device.enter().await, Err(err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(device.close().await.is_empty());
        assert!(device.close().await.is_empty());
    }

    #[tokio::test]
    async fn test_enter_after_close_is_released() {
        let bus = LinkBus::new();
        let device = ManagedDevice::new(
            ControllerConfig::new("DUT"),
            &bus,
            pipe_transport(),
            failing_process(Arc::new(AtomicUsize::new(0))),
        );
        assert!(device.close().await.is_empty());
        assert_eq!(device.enter().await, Err(DeviceError::Released));
    }

    #[tokio::test]
    async fn test_scope_reports_setup_failure() {
        let bus = LinkBus::new();
        let device = ManagedDevice::new(
            ControllerConfig::new("DUT"),
            &bus,
            pipe_transport(),
            failing_process(Arc::new(AtomicUsize::new(0))),
        );
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result: Result<(), DeviceError> = device
            .scope(|_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DeviceError::ProcessStart(_))));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(device.is_closed());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_scope_runs_body_and_closes() {
        use crate::test_support::{script_dut, script_factory};

        let (_dir, program) = script_dut("echo \"$1\"\nexec cat\n");
        let bus = LinkBus::new();
        let transport: TransportFuture =
            Box::pin(async { HostTransport::open_tcp_server(&HciEndpoint::localhost(0)).await });
        let device = ManagedDevice::new(
            ControllerConfig::new("DUT"),
            &bus,
            transport,
            script_factory(program),
        );

        let flag: Result<String, DeviceError> = device
            .scope(|device| async move {
                let held = device.held().await;
                assert!(held.transport && held.controller && held.process);
                assert!(!device.has_exited().await);

                let stdout = device.take_stdout().await.unwrap();
                assert!(device.take_stdout().await.is_none());
                let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdout));
                Ok(lines.next_line().await.unwrap().unwrap())
            })
            .await;

        let port = device.transport_addr().unwrap().port();
        assert_eq!(flag.unwrap(), format!("--bt-dev=127.0.0.1:{}", port));
        assert!(device.is_closed());
        assert!(device.held().await.is_empty());
        assert!(device.close().await.is_empty());
    }
}
