//! Pairing exchange
//!
//! A compact passkey-entry pairing protocol run over any
//! [`LinkConnection`]. The central initiates, the peripheral responds; the
//! method follows from both sides' I/O capabilities. Whichever side
//! displays the passkey also checks what the other side typed and
//! announces the verdict.
//!
//! ```text
//!   initiator                      responder
//!      |  <--- SecurityRequest ------  |   (optional)
//!      |  ---- PairingRequest ------>  |
//!      |  <--- PairingResponse ------  |
//!      |  ---- PasskeyEntry -------->  |   (initiator types)
//!      |  <--- PasskeyEntry ---------  |   (or responder types)
//!      |  <--- PairingComplete ------  |   (or PairingFailed, either way)
//! ```

use std::time::Duration;

use crate::link::LinkConnection;
use crate::pairing::{
    random_passkey, PairingDelegate, PairingError, PairingMethod, PairingResult,
    PendingAuthRequest, REASON_CONFIRM_VALUE_FAILED, REASON_PAIRING_NOT_SUPPORTED,
    REASON_PASSKEY_ENTRY_FAILED,
};

use super::messages::{recv_msg, send_msg, SmpMessage};

/// Drive pairing from the central side.
pub async fn initiate(
    conn: &dyn LinkConnection,
    delegate: &dyn PairingDelegate,
    wait_for_security_request: bool,
    passkey_timeout: Duration,
) -> Result<PairingResult, PairingError> {
    if wait_for_security_request {
        loop {
            match recv_msg(conn).await? {
                SmpMessage::SecurityRequest => break,
                other => log::debug!("waiting for security request; ignoring {:?}", other),
            }
        }
        log::debug!("security request from {}", conn.peer_address());
    }

    if !delegate.should_accept().await {
        return decline(conn).await;
    }

    let io = delegate.io_capability();
    send_msg(conn, &SmpMessage::PairingRequest { io }).await?;
    let remote_io = loop {
        match recv_msg(conn).await? {
            SmpMessage::PairingResponse { io } => break io,
            SmpMessage::SecurityRequest => continue,
            other => return Err(unexpected(other)),
        }
    };

    let method = PairingMethod::select(io, remote_io);
    log::debug!("pairing with {} as initiator using {:?}", conn.peer_address(), method);
    match method {
        PairingMethod::JustWorks => {}
        PairingMethod::InitiatorEntersPasskey => enter_passkey(conn, delegate, passkey_timeout).await?,
        PairingMethod::ResponderEntersPasskey => {
            return display_and_verify(conn, delegate, None, method).await;
        }
    }
    await_verdict(conn, method).await
}

/// Answer pairing from the peripheral side. `passkey` fixes the number
/// shown when this side displays; otherwise a random one is drawn.
pub async fn respond(
    conn: &dyn LinkConnection,
    delegate: &dyn PairingDelegate,
    passkey: Option<u32>,
    send_security_request: bool,
    passkey_timeout: Duration,
) -> Result<PairingResult, PairingError> {
    if send_security_request {
        send_msg(conn, &SmpMessage::SecurityRequest).await?;
    }

    let remote_io = match recv_msg(conn).await? {
        SmpMessage::PairingRequest { io } => io,
        other => return Err(unexpected(other)),
    };

    if !delegate.should_accept().await {
        return decline(conn).await;
    }

    let io = delegate.io_capability();
    send_msg(conn, &SmpMessage::PairingResponse { io }).await?;

    let method = PairingMethod::select(remote_io, io);
    log::debug!("pairing with {} as responder using {:?}", conn.peer_address(), method);
    match method {
        PairingMethod::JustWorks => {
            send_msg(conn, &SmpMessage::PairingComplete { bonded: true }).await?;
            Ok(PairingResult { method, bonded: true })
        }
        PairingMethod::InitiatorEntersPasskey => {
            display_and_verify(conn, delegate, passkey, method).await
        }
        PairingMethod::ResponderEntersPasskey => {
            enter_passkey(conn, delegate, passkey_timeout).await?;
            await_verdict(conn, method).await
        }
    }
}

async fn decline(conn: &dyn LinkConnection) -> Result<PairingResult, PairingError> {
    log::debug!("declining to pair with {}", conn.peer_address());
    send_msg(
        conn,
        &SmpMessage::PairingFailed {
            reason: REASON_PAIRING_NOT_SUPPORTED,
        },
    )
    .await?;
    Err(PairingError::Rejected {
        reason: "declined locally".to_string(),
    })
}

/// Ask the delegate for the passkey and send it. A delegate that cannot
/// come up with one aborts pairing on both ends.
async fn enter_passkey(
    conn: &dyn LinkConnection,
    delegate: &dyn PairingDelegate,
    passkey_timeout: Duration,
) -> Result<(), PairingError> {
    let request = PendingAuthRequest::passkey(conn.peer_address());
    match request.resolve(delegate, passkey_timeout).await {
        Ok(value) => send_msg(conn, &SmpMessage::PasskeyEntry { value }).await,
        Err(e) => {
            // Best effort; the local error is what matters.
            let _ = send_msg(
                conn,
                &SmpMessage::PairingFailed {
                    reason: REASON_PASSKEY_ENTRY_FAILED,
                },
            )
            .await;
            Err(e)
        }
    }
}

async fn display_and_verify(
    conn: &dyn LinkConnection,
    delegate: &dyn PairingDelegate,
    passkey: Option<u32>,
    method: PairingMethod,
) -> Result<PairingResult, PairingError> {
    let expected = passkey.unwrap_or_else(random_passkey);
    delegate
        .display_number(expected, crate::markers::PASSKEY_DIGITS)
        .await;

    let entered = loop {
        match recv_msg(conn).await? {
            SmpMessage::PasskeyEntry { value } => break value,
            SmpMessage::SecurityRequest => continue,
            SmpMessage::PairingFailed { reason } => return Err(remote_failure(reason)),
            other => return Err(unexpected(other)),
        }
    };

    if entered != expected {
        log::debug!(
            "passkey mismatch from {}: expected {}, got {}",
            conn.peer_address(),
            expected,
            entered
        );
        send_msg(
            conn,
            &SmpMessage::PairingFailed {
                reason: REASON_CONFIRM_VALUE_FAILED,
            },
        )
        .await?;
        return Err(PairingError::AuthenticationFailed {
            reason_code: REASON_CONFIRM_VALUE_FAILED,
        });
    }

    send_msg(conn, &SmpMessage::PairingComplete { bonded: true }).await?;
    Ok(PairingResult { method, bonded: true })
}

async fn await_verdict(
    conn: &dyn LinkConnection,
    method: PairingMethod,
) -> Result<PairingResult, PairingError> {
    loop {
        match recv_msg(conn).await? {
            SmpMessage::PairingComplete { bonded } => return Ok(PairingResult { method, bonded }),
            SmpMessage::PairingFailed { reason } => return Err(remote_failure(reason)),
            SmpMessage::SecurityRequest => continue,
            other => return Err(unexpected(other)),
        }
    }
}

fn remote_failure(reason: u8) -> PairingError {
    if reason == REASON_PAIRING_NOT_SUPPORTED {
        PairingError::Rejected {
            reason: "declined by peer".to_string(),
        }
    } else {
        PairingError::AuthenticationFailed { reason_code: reason }
    }
}

fn unexpected(msg: SmpMessage) -> PairingError {
    match msg {
        SmpMessage::PairingFailed { reason } => remote_failure(reason),
        other => PairingError::Protocol(format!("unexpected {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkBus, LinkCentral, LinkPeripheral};
    use crate::pairing::{
        AcceptAll, FixedPasskey, IoCapability, PasskeyFn, Rejecting, RelayDelegate,
    };
    use crate::relay::Relay;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn link() -> (Box<dyn LinkConnection>, Box<dyn LinkConnection>) {
        let bus = LinkBus::new();
        let central = bus.attach();
        let peripheral = bus.attach();
        peripheral.start_advertising(Vec::new()).await.unwrap();
        let conn = central.connect(&peripheral.address()).await.unwrap();
        let accepted = peripheral.accept().await.unwrap();
        (conn, accepted)
    }

    /// Records the number it was asked to display.
    struct Display {
        shown: Relay<u32>,
    }

    #[async_trait::async_trait]
    impl PairingDelegate for Display {
        fn io_capability(&self) -> IoCapability {
            IoCapability::DisplayOutputOnly
        }

        async fn display_number(&self, value: u32, _digits: usize) {
            self.shown.resolve(value);
        }
    }

    #[tokio::test]
    async fn test_just_works_with_security_request() {
        let (central, peripheral) = link().await;
        let delegate = AcceptAll::default();

        let (initiated, responded) = tokio::join!(
            initiate(central.as_ref(), &delegate, true, TIMEOUT),
            respond(peripheral.as_ref(), &delegate, None, true, TIMEOUT),
        );
        let expected = PairingResult {
            method: PairingMethod::JustWorks,
            bonded: true,
        };
        assert_eq!(initiated, Ok(expected));
        assert_eq!(responded, Ok(expected));
    }

    #[tokio::test]
    async fn test_initiator_enters_displayed_passkey() {
        let (central, peripheral) = link().await;
        let shown = Relay::new();
        let display = Display {
            shown: shown.clone(),
        };
        let keyboard = RelayDelegate::new(shown.clone());

        let (initiated, responded) = tokio::join!(
            initiate(central.as_ref(), &keyboard, false, TIMEOUT),
            respond(peripheral.as_ref(), &display, Some(654321), false, TIMEOUT),
        );
        assert_eq!(initiated.unwrap().method, PairingMethod::InitiatorEntersPasskey);
        assert!(responded.unwrap().bonded);
        assert_eq!(shown.peek(), Some(654321));
    }

    #[tokio::test]
    async fn test_wrong_passkey_fails_both_sides() {
        let (central, peripheral) = link().await;
        let display = Display { shown: Relay::new() };
        let keyboard = PasskeyFn::new(IoCapability::KeyboardInputOnly, || Some(111111));

        let (initiated, responded) = tokio::join!(
            initiate(central.as_ref(), &keyboard, false, TIMEOUT),
            respond(peripheral.as_ref(), &display, Some(654321), false, TIMEOUT),
        );
        let failed = PairingError::AuthenticationFailed {
            reason_code: REASON_CONFIRM_VALUE_FAILED,
        };
        assert_eq!(initiated, Err(failed.clone()));
        assert_eq!(responded, Err(failed));
    }

    #[tokio::test]
    async fn test_responder_enters_passkey() {
        let (central, peripheral) = link().await;
        let shown = Relay::new();
        let display = Display {
            shown: shown.clone(),
        };
        let keyboard = RelayDelegate::new(shown.clone());

        let (initiated, responded) = tokio::join!(
            initiate(central.as_ref(), &display, false, TIMEOUT),
            respond(peripheral.as_ref(), &keyboard, None, false, TIMEOUT),
        );
        assert_eq!(initiated.unwrap().method, PairingMethod::ResponderEntersPasskey);
        assert!(responded.unwrap().bonded);
        assert!(shown.is_resolved());
    }

    #[tokio::test]
    async fn test_rejection_is_distinguishable() {
        let (central, peripheral) = link().await;
        let rejecting = Rejecting::default();
        let accepting = AcceptAll::default();

        let (initiated, responded) = tokio::join!(
            initiate(central.as_ref(), &rejecting, true, TIMEOUT),
            respond(peripheral.as_ref(), &accepting, None, true, TIMEOUT),
        );
        assert!(matches!(initiated, Err(PairingError::Rejected { .. })));
        assert!(matches!(responded, Err(PairingError::Rejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_passkey_times_out() {
        let (central, peripheral) = link().await;
        let display = Display { shown: Relay::new() };
        let never = RelayDelegate::new(Relay::new());

        let (initiated, responded) = tokio::join!(
            initiate(central.as_ref(), &never, false, Duration::from_secs(1)),
            respond(peripheral.as_ref(), &display, Some(1), false, TIMEOUT),
        );
        assert!(matches!(initiated, Err(PairingError::Timeout(_))));
        assert_eq!(
            responded,
            Err(PairingError::AuthenticationFailed {
                reason_code: REASON_PASSKEY_ENTRY_FAILED
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_link_is_transport_error() {
        let (central, peripheral) = link().await;
        drop(peripheral);
        let result = initiate(central.as_ref(), &FixedPasskey { value: 1 }, false, TIMEOUT).await;
        assert!(matches!(result, Err(PairingError::Transport(_))));
    }
}
