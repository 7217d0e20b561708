//! Scenario composition
//!
//! Glue for scripting one exchange against a DUT: a [`MarkerWatch`] turns
//! the DUT's output into relays (the passkey it printed, the terminal
//! outcome it reached), and [`with_deadline`] bounds every wait so a silent
//! DUT shows up as a timeout naming what was expected rather than a hang.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;

use crate::device::DeviceError;
use crate::markers::{classify, Marker};
use crate::monitor::{monitor, LineEvent, LineHandler, MonitorTask};
use crate::pairing::PairingError;
use crate::process::ProcessError;
use crate::relay::{Relay, RelayError, RelayQueue};
use crate::sim::HostError;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Protocol failure: {0}")]
    Protocol(String),

    #[error("Timed out after {after:?} waiting for {expected}")]
    Timeout { expected: String, after: Duration },

    #[error("Output monitor stopped before {0}")]
    Monitor(String),
}

impl From<DeviceError> for ScenarioError {
    fn from(e: DeviceError) -> Self {
        ScenarioError::Setup(e.to_string())
    }
}

impl From<TransportError> for ScenarioError {
    fn from(e: TransportError) -> Self {
        ScenarioError::Setup(e.to_string())
    }
}

impl From<ProcessError> for ScenarioError {
    fn from(e: ProcessError) -> Self {
        ScenarioError::Setup(e.to_string())
    }
}

impl From<PairingError> for ScenarioError {
    fn from(e: PairingError) -> Self {
        ScenarioError::Protocol(e.to_string())
    }
}

impl From<HostError> for ScenarioError {
    fn from(e: HostError) -> Self {
        ScenarioError::Protocol(e.to_string())
    }
}

/// Await `fut` for at most `after`. On expiry the future is dropped and the
/// error names `expected`.
pub async fn with_deadline<F, T>(fut: F, after: Duration, expected: &str) -> Result<T, ScenarioError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| ScenarioError::Timeout {
            expected: expected.to_string(),
            after,
        })
}

/// Where a scenario ended up, as announced by the DUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Bonded,
    Disconnected { reason: Option<u8> },
}

/// Routes classified DUT output lines into relays.
///
/// The first bonded or disconnect line settles the [`Outcome`]; the first
/// `PK<digits>` line settles the displayed passkey and every one of them is
/// also queued in order; the first typed `PK<digits>PK` echo settles the
/// typed passkey. Dropping or closing the watch turns any later lines into
/// no-ops.
pub struct MarkerWatch {
    outcome: Relay<Outcome>,
    passkey: Relay<u32>,
    typed_passkey: Relay<u32>,
    peer_name_wrong: Relay<()>,
    passkeys: Arc<RelayQueue<u32>>,
    history: Arc<Mutex<Vec<Marker>>>,
}

impl MarkerWatch {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            outcome: Relay::new(),
            passkey: Relay::new(),
            typed_passkey: Relay::new(),
            peer_name_wrong: Relay::new(),
            passkeys: Arc::new(RelayQueue::bounded(queue_capacity)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A line handler feeding this watch.
    pub fn handler(&self) -> LineHandler {
        let outcome = self.outcome.resolver();
        let passkey = self.passkey.resolver();
        let typed_passkey = self.typed_passkey.resolver();
        let peer_name_wrong = self.peer_name_wrong.resolver();
        let passkeys = self.passkeys.resolver();
        let history = Arc::clone(&self.history);

        Box::new(move |event: &LineEvent| {
            let Some(marker) = classify(&event.text) else {
                return;
            };
            log::debug!("line {}: {:?}", event.seq, marker);
            history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(marker);
            match marker {
                Marker::Bonded => {
                    outcome.resolve(Outcome::Bonded);
                }
                Marker::Disconnected { reason } => {
                    outcome.resolve(Outcome::Disconnected { reason });
                }
                Marker::Passkey(value) => {
                    passkey.resolve(value);
                    if let Some(queue) = &passkeys {
                        queue.resolve(value);
                    }
                }
                Marker::PasskeyTyped(value) => {
                    typed_passkey.resolve(value);
                }
                Marker::PeerNameWrong => {
                    peer_name_wrong.resolve(());
                }
            }
        })
    }

    /// Monitor `stream` into this watch.
    pub fn attach<R>(&self, label: &str, stream: R) -> MonitorTask
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        monitor(label, stream, Some(self.handler()))
    }

    /// The passkey the DUT displays. Hand it to a pairing delegate.
    pub fn passkey(&self) -> Relay<u32> {
        self.passkey.clone()
    }

    /// The passkey typed into the DUT, as echoed on its console.
    pub fn typed_passkey(&self) -> Relay<u32> {
        self.typed_passkey.clone()
    }

    /// Next displayed passkey in output order.
    pub async fn next_passkey(&self, after: Duration) -> Result<u32, ScenarioError> {
        with_deadline(self.passkeys.next(), after, "a passkey")
            .await?
            .ok_or_else(|| ScenarioError::Monitor("a passkey".to_string()))
    }

    pub async fn outcome(&self, after: Duration) -> Result<Outcome, ScenarioError> {
        settle(&self.outcome, after, "a bonded or disconnect marker").await
    }

    /// Succeeds on the bonded marker; a disconnect line instead is a
    /// protocol failure.
    pub async fn expect_bonded(&self, after: Duration) -> Result<(), ScenarioError> {
        match self.outcome(after).await? {
            Outcome::Bonded => Ok(()),
            Outcome::Disconnected { reason } => Err(ScenarioError::Protocol(format!(
                "DUT disconnected (reason {:?}) instead of bonding",
                reason
            ))),
        }
    }

    /// Succeeds on a disconnect line, yielding its reason; the bonded
    /// marker instead is a protocol failure.
    pub async fn expect_disconnect(&self, after: Duration) -> Result<Option<u8>, ScenarioError> {
        match self.outcome(after).await? {
            Outcome::Disconnected { reason } => Ok(reason),
            Outcome::Bonded => Err(ScenarioError::Protocol(
                "DUT bonded instead of disconnecting".to_string(),
            )),
        }
    }

    pub async fn expect_peer_name_wrong(&self, after: Duration) -> Result<(), ScenarioError> {
        settle(&self.peer_name_wrong, after, "a wrong peer name marker").await
    }

    /// Every marker seen so far, in output order.
    pub fn history(&self) -> Vec<Marker> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, wanted: impl Fn(&Marker) -> bool) -> usize {
        self.history().iter().filter(|m| wanted(*m)).count()
    }

    /// Stop waiting. Pending waits end with [`ScenarioError::Monitor`].
    pub fn close(&self) {
        self.outcome.close();
        self.passkey.close();
        self.typed_passkey.close();
        self.peer_name_wrong.close();
        self.passkeys.close();
    }
}

async fn settle<T>(relay: &Relay<T>, after: Duration, expected: &str) -> Result<T, ScenarioError>
where
    T: Clone + Send + Sync + 'static,
{
    with_deadline(relay.wait(), after, expected)
        .await?
        .map_err(|RelayError::Closed| ScenarioError::Monitor(expected.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn watch_lines(lines: &str) -> (MarkerWatch, MonitorTask) {
        let watch = MarkerWatch::new(4);
        let task = watch.attach("dut", Cursor::new(lines.as_bytes().to_vec()));
        (watch, task)
    }

    #[tokio::test]
    async fn test_passkey_then_bonded() {
        let (watch, mut task) = watch_lines(
            "booting\nPK<654321>\nbt_conn_loop: Paired. bonded=1\nbt_conn_loop: reason 19: Disconnected.\n",
        );
        assert_eq!(task.join().await, Some(4));

        assert_eq!(watch.passkey().wait().await, Ok(654321));
        assert_eq!(watch.next_passkey(Duration::from_secs(1)).await, Ok(654321));
        watch.expect_bonded(Duration::from_secs(1)).await.unwrap();
        // The later disconnect does not change the outcome.
        assert_eq!(watch.outcome(Duration::from_secs(1)).await, Ok(Outcome::Bonded));
        assert_eq!(watch.count(|m| matches!(m, Marker::Passkey(_))), 1);
        assert_eq!(watch.history().len(), 3);
    }

    #[tokio::test]
    async fn test_passkeys_end_with_the_stream() {
        let (watch, mut task) = watch_lines("PK<000001>\n");
        assert_eq!(task.join().await, Some(1));

        assert_eq!(watch.next_passkey(Duration::from_secs(5)).await, Ok(1));
        assert!(matches!(
            watch.next_passkey(Duration::from_secs(5)).await,
            Err(ScenarioError::Monitor(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_not_bonded() {
        let (watch, mut task) = watch_lines("bt_conn_loop: reason 5: Disconnected.\n");
        task.join().await;

        assert_eq!(watch.expect_disconnect(Duration::from_secs(1)).await, Ok(Some(5)));
        assert!(matches!(
            watch.expect_bonded(Duration::from_secs(1)).await,
            Err(ScenarioError::Protocol(_))
        ));
        assert_eq!(watch.count(|m| *m == Marker::Bonded), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out_naming_expectation() {
        let (watch, mut task) = watch_lines("nothing to see\n");
        task.join().await;

        match watch.expect_bonded(Duration::from_secs(10)).await {
            Err(ScenarioError::Timeout { expected, after }) => {
                assert!(expected.contains("bonded"));
                assert_eq!(after, Duration::from_secs(10));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_ends_waits() {
        let watch = MarkerWatch::new(1);
        watch.close();
        assert!(matches!(
            watch.expect_peer_name_wrong(Duration::from_secs(1)).await,
            Err(ScenarioError::Monitor(_))
        ));
        assert!(matches!(
            watch.next_passkey(Duration::from_secs(1)).await,
            Err(ScenarioError::Monitor(_))
        ));
    }

    #[tokio::test]
    async fn test_lines_after_drop_are_ignored() {
        let watch = MarkerWatch::new(1);
        let mut handler = watch.handler();
        drop(watch);
        handler(&LineEvent {
            seq: 0,
            text: "PK<1>".to_string(),
            received_at: chrono::Utc::now(),
        });
    }

    #[test]
    fn test_error_conversions_keep_categories() {
        let setup: ScenarioError = DeviceError::Released.into();
        assert!(matches!(setup, ScenarioError::Setup(_)));
        let protocol: ScenarioError = PairingError::MissingNumber.into();
        assert!(matches!(protocol, ScenarioError::Protocol(_)));
    }
}
