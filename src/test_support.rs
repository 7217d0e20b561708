//! Helpers shared by unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use crate::process::{DutCommand, DutProcess, ProcessError};

/// Write an executable `/bin/sh` script standing in for a DUT binary. The
/// directory must outlive the process.
pub fn script_dut(body: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dut.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    (dir, path)
}

/// Spawn, retrying while another test thread still holds a freshly
/// written script open (ETXTBSY).
pub fn spawn_retrying(command: &DutCommand) -> DutProcess {
    for _ in 0..50 {
        match command.spawn() {
            Err(ProcessError::SpawnFailed { reason, .. }) if reason.contains("busy") => {
                std::thread::sleep(Duration::from_millis(10));
            }
            other => return other.unwrap(),
        }
    }
    panic!("{} stayed busy", command.program().display());
}

/// Process factory for a [`crate::device::ManagedDevice`] that starts
/// `program` against whatever address the transport bound.
pub fn script_factory(program: PathBuf) -> crate::device::ProcessFactory {
    Box::new(move |bound| {
        Box::pin(async move {
            let port = bound.map_or(0, |addr| addr.port());
            let command = DutCommand::new(&program, crate::transport::HciEndpoint::localhost(port));
            Ok(spawn_retrying(&command))
        })
    })
}
