//! Host-controller framing
//!
//! A compact H4-style framing for the bytes carried by a
//! [`HostTransport`](crate::transport::HostTransport). Every packet starts
//! with an indicator byte:
//!
//! | indicator | packet  | header                                  |
//! |-----------|---------|-----------------------------------------|
//! | `0x01`    | command | opcode (u16 LE), parameter length (u8)  |
//! | `0x02`    | ACL     | handle (u16 LE), data length (u16 LE)   |
//! | `0x04`    | event   | event code (u8), parameter length (u8)  |
//!
//! Only the commands and events the controller adapter understands are
//! given typed forms; anything else decodes as [`Command::Unknown`].
//! Addresses travel least-significant byte first.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::link::LinkAddress;

pub const INDICATOR_COMMAND: u8 = 0x01;
pub const INDICATOR_ACL: u8 = 0x02;
pub const INDICATOR_EVENT: u8 = 0x04;

pub const OP_DISCONNECT: u16 = 0x0406;
pub const OP_LE_SET_RANDOM_ADDRESS: u16 = 0x2005;
pub const OP_LE_SET_ADVERTISING_DATA: u16 = 0x2008;
pub const OP_LE_SET_ADVERTISING_ENABLE: u16 = 0x200A;
pub const OP_LE_SET_SCAN_ENABLE: u16 = 0x200C;
pub const OP_LE_CREATE_CONNECTION: u16 = 0x200D;

pub const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;
pub const EVT_LE_META: u8 = 0x3E;
pub const SUBEVT_CONNECTION_COMPLETE: u8 = 0x01;
pub const SUBEVT_ADVERTISING_REPORT: u8 = 0x02;

pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_UNKNOWN_COMMAND: u8 = 0x01;
pub const STATUS_UNKNOWN_CONNECTION: u8 = 0x02;
pub const STATUS_COMMAND_DISALLOWED: u8 = 0x0C;
pub const STATUS_CONNECTION_FAILED: u8 = 0x3E;

pub const REASON_AUTHENTICATION_FAILURE: u8 = 0x05;
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;
pub const REASON_LOCAL_HOST_TERMINATED: u8 = 0x16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Unknown packet indicator: {0:#04x}")]
    UnknownIndicator(u8),

    #[error("Malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

/// One framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    Command { opcode: u16, params: Vec<u8> },
    Acl { handle: u16, data: Vec<u8> },
    Event { code: u8, params: Vec<u8> },
}

impl HciPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        match self {
            HciPacket::Command { opcode, params } => {
                out.put_u8(INDICATOR_COMMAND);
                out.put_u16_le(*opcode);
                out.put_u8(params.len() as u8);
                out.put_slice(params);
            }
            HciPacket::Acl { handle, data } => {
                out.put_u8(INDICATOR_ACL);
                out.put_u16_le(*handle);
                out.put_u16_le(data.len() as u16);
                out.put_slice(data);
            }
            HciPacket::Event { code, params } => {
                out.put_u8(INDICATOR_EVENT);
                out.put_u8(*code);
                out.put_u8(params.len() as u8);
                out.put_slice(params);
            }
        }
        out.to_vec()
    }
}

/// Reassembles packets from an arbitrarily chunked byte stream.
#[derive(Debug, Default)]
pub struct HciDecoder {
    buf: BytesMut,
}

impl HciDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete packet, `Ok(None)` if more bytes are needed. After an
    /// error the buffered bytes are discarded so decoding can resume on the
    /// next chunk.
    pub fn next_packet(&mut self) -> Result<Option<HciPacket>, HciError> {
        let Some(&indicator) = self.buf.first() else {
            return Ok(None);
        };
        let (header_len, body_len) = match indicator {
            INDICATOR_COMMAND => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (4, self.buf[3] as usize)
            }
            INDICATOR_EVENT => {
                if self.buf.len() < 3 {
                    return Ok(None);
                }
                (3, self.buf[2] as usize)
            }
            INDICATOR_ACL => {
                if self.buf.len() < 5 {
                    return Ok(None);
                }
                (5, u16::from_le_bytes([self.buf[3], self.buf[4]]) as usize)
            }
            other => {
                self.buf.clear();
                return Err(HciError::UnknownIndicator(other));
            }
        };
        if self.buf.len() < header_len + body_len {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(header_len + body_len);
        frame.advance(1);
        let packet = match indicator {
            INDICATOR_COMMAND => {
                let opcode = frame.get_u16_le();
                frame.advance(1);
                HciPacket::Command {
                    opcode,
                    params: frame.to_vec(),
                }
            }
            INDICATOR_ACL => {
                let handle = frame.get_u16_le();
                frame.advance(2);
                HciPacket::Acl {
                    handle,
                    data: frame.to_vec(),
                }
            }
            _ => {
                let code = frame.get_u8();
                frame.advance(1);
                HciPacket::Event {
                    code,
                    params: frame.to_vec(),
                }
            }
        };
        Ok(Some(packet))
    }
}

// ---------------------------------------------------------------------------
// Typed commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Disconnect { handle: u16, reason: u8 },
    SetRandomAddress(LinkAddress),
    SetAdvertisingData(Vec<u8>),
    SetAdvertisingEnable(bool),
    SetScanEnable(bool),
    CreateConnection(LinkAddress),
    Unknown { opcode: u16 },
}

impl Command {
    pub fn opcode(&self) -> u16 {
        match self {
            Command::Disconnect { .. } => OP_DISCONNECT,
            Command::SetRandomAddress(_) => OP_LE_SET_RANDOM_ADDRESS,
            Command::SetAdvertisingData(_) => OP_LE_SET_ADVERTISING_DATA,
            Command::SetAdvertisingEnable(_) => OP_LE_SET_ADVERTISING_ENABLE,
            Command::SetScanEnable(_) => OP_LE_SET_SCAN_ENABLE,
            Command::CreateConnection(_) => OP_LE_CREATE_CONNECTION,
            Command::Unknown { opcode } => *opcode,
        }
    }

    pub fn to_packet(&self) -> HciPacket {
        let mut params = BytesMut::new();
        match self {
            Command::Disconnect { handle, reason } => {
                params.put_u16_le(*handle);
                params.put_u8(*reason);
            }
            Command::SetRandomAddress(addr) | Command::CreateConnection(addr) => {
                put_address(&mut params, addr);
            }
            Command::SetAdvertisingData(data) => {
                params.put_u8(data.len() as u8);
                params.put_slice(data);
            }
            Command::SetAdvertisingEnable(on) => params.put_u8(u8::from(*on)),
            Command::SetScanEnable(on) => {
                params.put_u8(u8::from(*on));
                // Filter duplicates: off.
                params.put_u8(0);
            }
            Command::Unknown { .. } => {}
        }
        HciPacket::Command {
            opcode: self.opcode(),
            params: params.to_vec(),
        }
    }

    pub fn parse(opcode: u16, params: &[u8]) -> Result<Self, HciError> {
        let mut p = params;
        let command = match opcode {
            OP_DISCONNECT => {
                need(p, 3, "Disconnect")?;
                Command::Disconnect {
                    handle: p.get_u16_le(),
                    reason: p.get_u8(),
                }
            }
            OP_LE_SET_RANDOM_ADDRESS => {
                Command::SetRandomAddress(get_address(&mut p, "LE Set Random Address")?)
            }
            OP_LE_SET_ADVERTISING_DATA => {
                need(p, 1, "LE Set Advertising Data")?;
                let len = p.get_u8() as usize;
                need(p, len, "LE Set Advertising Data")?;
                Command::SetAdvertisingData(p[..len].to_vec())
            }
            OP_LE_SET_ADVERTISING_ENABLE => {
                need(p, 1, "LE Set Advertising Enable")?;
                Command::SetAdvertisingEnable(p.get_u8() != 0)
            }
            OP_LE_SET_SCAN_ENABLE => {
                need(p, 1, "LE Set Scan Enable")?;
                Command::SetScanEnable(p.get_u8() != 0)
            }
            OP_LE_CREATE_CONNECTION => {
                Command::CreateConnection(get_address(&mut p, "LE Create Connection")?)
            }
            other => Command::Unknown { opcode: other },
        };
        Ok(command)
    }
}

// ---------------------------------------------------------------------------
// Typed events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CommandComplete {
        opcode: u16,
        status: u8,
    },
    ConnectionComplete {
        status: u8,
        handle: u16,
        role: ConnectionRole,
        peer: LinkAddress,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    AdvertisingReport {
        address: LinkAddress,
        rssi: i8,
        data: Vec<u8>,
    },
}

impl Event {
    pub fn to_packet(&self) -> HciPacket {
        let mut params = BytesMut::new();
        let code = match self {
            Event::CommandComplete { opcode, status } => {
                // Number of command packets the host may send.
                params.put_u8(1);
                params.put_u16_le(*opcode);
                params.put_u8(*status);
                EVT_COMMAND_COMPLETE
            }
            Event::ConnectionComplete {
                status,
                handle,
                role,
                peer,
            } => {
                params.put_u8(SUBEVT_CONNECTION_COMPLETE);
                params.put_u8(*status);
                params.put_u16_le(*handle);
                params.put_u8(match role {
                    ConnectionRole::Central => 0,
                    ConnectionRole::Peripheral => 1,
                });
                put_address(&mut params, peer);
                EVT_LE_META
            }
            Event::DisconnectionComplete {
                status,
                handle,
                reason,
            } => {
                params.put_u8(*status);
                params.put_u16_le(*handle);
                params.put_u8(*reason);
                EVT_DISCONNECTION_COMPLETE
            }
            Event::AdvertisingReport {
                address,
                rssi,
                data,
            } => {
                params.put_u8(SUBEVT_ADVERTISING_REPORT);
                put_address(&mut params, address);
                params.put_i8(*rssi);
                params.put_u8(data.len() as u8);
                params.put_slice(data);
                EVT_LE_META
            }
        };
        HciPacket::Event {
            code,
            params: params.to_vec(),
        }
    }

    pub fn parse(code: u8, params: &[u8]) -> Result<Self, HciError> {
        let mut p = params;
        match code {
            EVT_COMMAND_COMPLETE => {
                need(p, 4, "Command Complete")?;
                p.advance(1);
                Ok(Event::CommandComplete {
                    opcode: p.get_u16_le(),
                    status: p.get_u8(),
                })
            }
            EVT_DISCONNECTION_COMPLETE => {
                need(p, 4, "Disconnection Complete")?;
                Ok(Event::DisconnectionComplete {
                    status: p.get_u8(),
                    handle: p.get_u16_le(),
                    reason: p.get_u8(),
                })
            }
            EVT_LE_META => {
                need(p, 1, "LE Meta")?;
                match p.get_u8() {
                    SUBEVT_CONNECTION_COMPLETE => {
                        need(p, 4, "Connection Complete")?;
                        let status = p.get_u8();
                        let handle = p.get_u16_le();
                        let role = if p.get_u8() == 0 {
                            ConnectionRole::Central
                        } else {
                            ConnectionRole::Peripheral
                        };
                        let peer = get_address(&mut p, "Connection Complete")?;
                        Ok(Event::ConnectionComplete {
                            status,
                            handle,
                            role,
                            peer,
                        })
                    }
                    SUBEVT_ADVERTISING_REPORT => {
                        let address = get_address(&mut p, "Advertising Report")?;
                        need(p, 2, "Advertising Report")?;
                        let rssi = p.get_i8();
                        let len = p.get_u8() as usize;
                        need(p, len, "Advertising Report")?;
                        Ok(Event::AdvertisingReport {
                            address,
                            rssi,
                            data: p[..len].to_vec(),
                        })
                    }
                    other => Err(HciError::Malformed {
                        what: "LE Meta",
                        detail: format!("unsupported subevent {:#04x}", other),
                    }),
                }
            }
            other => Err(HciError::Malformed {
                what: "event",
                detail: format!("unsupported event code {:#04x}", other),
            }),
        }
    }
}

fn need(p: &[u8], len: usize, what: &'static str) -> Result<(), HciError> {
    if p.len() < len {
        return Err(HciError::Malformed {
            what,
            detail: format!("expected {} more bytes, got {}", len, p.len()),
        });
    }
    Ok(())
}

fn put_address(out: &mut BytesMut, addr: &LinkAddress) {
    let mut bytes = addr.bytes();
    bytes.reverse();
    out.put_slice(&bytes);
}

fn get_address(p: &mut &[u8], what: &'static str) -> Result<LinkAddress, HciError> {
    need(*p, 6, what)?;
    let mut bytes = [0u8; 6];
    p.copy_to_slice(&mut bytes);
    bytes.reverse();
    Ok(LinkAddress(bytes))
}
