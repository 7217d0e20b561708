//! Pairing messages exchanged over an established link.

use serde::{Deserialize, Serialize};

use crate::link::LinkConnection;
use crate::pairing::{IoCapability, PairingError};

/// One pairing protocol message. Every message travels CBOR-encoded as a
/// single link payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmpMessage {
    /// Sent by the peripheral to ask the central to start pairing.
    SecurityRequest,
    PairingRequest { io: IoCapability },
    PairingResponse { io: IoCapability },
    /// The passkey typed by whichever side has the keyboard.
    PasskeyEntry { value: u32 },
    PairingFailed { reason: u8 },
    PairingComplete { bonded: bool },
}

fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, PairingError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PairingError::Protocol(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, PairingError> {
    ciborium::from_reader(data).map_err(|e| PairingError::Protocol(e.to_string()))
}

pub async fn send_msg(conn: &dyn LinkConnection, msg: &SmpMessage) -> Result<(), PairingError> {
    let bytes = cbor_serialize(msg)?;
    conn.send(&bytes).await?;
    Ok(())
}

pub async fn recv_msg(conn: &dyn LinkConnection) -> Result<SmpMessage, PairingError> {
    let bytes = conn.recv().await?;
    cbor_deserialize(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkBus, LinkCentral, LinkPeripheral};

    #[tokio::test]
    async fn test_messages_cross_the_bus() {
        let bus = LinkBus::new();
        let central = bus.attach();
        let peripheral = bus.attach();
        peripheral.start_advertising(Vec::new()).await.unwrap();

        let conn = central.connect(&peripheral.address()).await.unwrap();
        let accepted = peripheral.accept().await.unwrap();

        let msg = SmpMessage::PairingRequest {
            io: IoCapability::DisplayOutputAndKeyboardInput,
        };
        send_msg(conn.as_ref(), &msg).await.unwrap();
        assert_eq!(recv_msg(accepted.as_ref()).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_protocol_error() {
        let bus = LinkBus::new();
        let central = bus.attach();
        let peripheral = bus.attach();
        peripheral.start_advertising(Vec::new()).await.unwrap();

        let conn = central.connect(&peripheral.address()).await.unwrap();
        let accepted = peripheral.accept().await.unwrap();

        conn.send(&[0xFF, 0x00]).await.unwrap();
        assert!(matches!(
            recv_msg(accepted.as_ref()).await,
            Err(PairingError::Protocol(_))
        ));
    }
}
