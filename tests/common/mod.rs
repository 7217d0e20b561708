#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use bluet::controller::ControllerConfig;
use bluet::device::{ManagedDevice, ProcessFactory, TransportFuture};
use bluet::link::LinkBus;
use bluet::monitor::MonitorTask;
use bluet::process::{DutCommand, DutProcess, ProcessError};
use bluet::scenario::MarkerWatch;
use bluet::sim::SimHost;
use bluet::transport::{HciEndpoint, HostTransport};

pub const WAIT: Duration = Duration::from_secs(10);

/// Prints its `--bt-dev` argument, then echoes stdin to stdout.
pub const ECHO_DUT: &str = "echo \"$1\"\nexec cat\n";

pub fn script_dut(body: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zephyr.exe");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    (dir, path)
}

/// Spawn, retrying while a concurrently written script is still open for
/// writing in another test (ETXTBSY).
pub fn spawn_retrying(command: &DutCommand) -> Result<DutProcess, ProcessError> {
    for _ in 0..50 {
        match command.spawn() {
            Err(ProcessError::SpawnFailed { reason, .. }) if reason.contains("busy") => {
                std::thread::sleep(Duration::from_millis(10));
            }
            other => return other,
        }
    }
    command.spawn()
}

pub fn tcp_transport() -> TransportFuture {
    Box::pin(async { HostTransport::open_tcp_server(&HciEndpoint::localhost(0)).await })
}

pub fn script_factory(program: &Path) -> ProcessFactory {
    let program = program.to_path_buf();
    Box::new(move |bound| {
        Box::pin(async move {
            let port = bound.map_or(0, |addr| addr.port());
            spawn_retrying(&DutCommand::new(&program, HciEndpoint::localhost(port)))
        })
    })
}

pub fn script_device(bus: &Arc<LinkBus>, program: &Path) -> Arc<ManagedDevice> {
    ManagedDevice::new(
        ControllerConfig::new("DUT"),
        bus,
        tcp_transport(),
        script_factory(program),
    )
}

/// An echoing DUT with its output watched and a simulated firmware host
/// attached to its transport, speaking on its console.
pub struct Bench {
    pub bus: Arc<LinkBus>,
    pub device: Arc<ManagedDevice>,
    pub watch: MarkerWatch,
    pub host: SimHost,
    _monitor: MonitorTask,
    _dir: TempDir,
}

impl Bench {
    pub async fn start() -> Self {
        bluet::logging::init_for_tests();
        let (dir, program) = script_dut(ECHO_DUT);
        let bus = LinkBus::new();
        let device = script_device(&bus, &program);
        device.enter().await.unwrap();

        let watch = MarkerWatch::new(8);
        let monitor = watch.attach("dut", device.take_stdout().await.unwrap());
        let host = SimHost::connect(device.transport_addr().unwrap(), "DUT")
            .await
            .unwrap()
            .with_console(device.stdin().await.unwrap());

        Self {
            bus,
            device,
            watch,
            host,
            _monitor: monitor,
            _dir: dir,
        }
    }

    pub async fn stop(self) {
        self.watch.close();
        let released = self.device.close().await;
        assert!(released.process);
    }
}
