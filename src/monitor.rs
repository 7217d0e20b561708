//! Line event monitor
//!
//! Reads a DUT output stream line by line in a background task and hands
//! each line to an optional handler, in stream order, one at a time. The
//! monitor does no matching of its own; classification belongs to the
//! handler (see [`crate::markers`]).
//!
//! End of stream and read errors both end the task normally: the DUT
//! exiting is an expected way for a scenario to finish.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One decoded line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    /// Position in the stream, starting at 0.
    pub seq: u64,
    /// Line text without its terminator. Invalid UTF-8 is replaced.
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Called synchronously for every line before the next one is read. A
/// handler that blocks stalls the monitor.
pub type LineHandler = Box<dyn FnMut(&LineEvent) + Send>;

/// Start monitoring `stream`. `label` only appears in logs.
pub fn monitor<R>(label: &str, stream: R, on_line: Option<LineHandler>) -> MonitorTask
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let handle = tokio::spawn(read_lines(label.to_string(), stream, on_line, cancel_rx));
    MonitorTask {
        label: label.to_string(),
        cancel: Some(cancel_tx),
        handle: Some(handle),
    }
}

async fn read_lines<R>(
    label: String,
    stream: R,
    mut on_line: Option<LineHandler>,
    mut cancel: oneshot::Receiver<()>,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut seq = 0u64;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = &mut cancel => {
                log::debug!("[{}] monitor cancelled after {} lines", label, seq);
                return seq;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let event = LineEvent {
                    seq,
                    text: decode_line(&buf),
                    received_at: Utc::now(),
                };
                log::debug!("[{}] {}", label, event.text);
                if let Some(handler) = on_line.as_mut() {
                    handler(&event);
                }
                seq += 1;
            }
            Err(e) => {
                log::debug!("[{}] stream read failed, ending monitor: {}", label, e);
                break;
            }
        }
    }

    log::debug!("[{}] stream closed after {} lines", label, seq);
    seq
}

fn decode_line(raw: &[u8]) -> String {
    let mut line = raw;
    if let Some(rest) = line.strip_suffix(b"\n") {
        line = rest;
    }
    if let Some(rest) = line.strip_suffix(b"\r") {
        line = rest;
    }
    String::from_utf8_lossy(line).into_owned()
}

/// Handle to a running monitor.
pub struct MonitorTask {
    label: String,
    cancel: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl MonitorTask {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop the monitor and wait for it to wind down. The handler is never
    /// invoked after this returns. Safe to call on a finished monitor, and
    /// more than once.
    pub async fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The task may already be gone; that is fine.
            let _ = cancel.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::warn!("[{}] line handler panicked", self.label);
                }
            }
        }
    }

    /// Wait for the stream to end on its own. Returns the number of lines
    /// delivered, or `None` if the monitor was already cancelled or joined,
    /// or its handler panicked.
    pub async fn join(&mut self) -> Option<u64> {
        // The cancel sender stays alive; dropping it would read as a cancel.
        let handle = self.handle.take()?;
        match handle.await {
            Ok(count) => Some(count),
            Err(e) => {
                if e.is_panic() {
                    log::warn!("[{}] line handler panicked", self.label);
                }
                None
            }
        }
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
