use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::state::StateCode;
use crate::Serial;

pub const PACKET_TYPE_DATA: u8 = 0x01;
pub const PACKET_TYPE_STATE: u8 = 0x02;
pub const PACKET_TYPE_INFO: u8 = 0x03;

/// Telemetry carried by an INFO packet: the sender's wall-clock second,
/// reassembly progress, and byte counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoPayload {
    pub timestamp: u32,
    pub incoming_serial: Serial,
    pub max_incoming_serial: Serial,
    pub bytes_read: u64,
    pub bytes_sent: u64,
}

/// A session packet body as handed to / received from the pool.
///
/// All integers are big-endian. The pool adds its own length framing on the
/// wire; a `Packet` is always a complete body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data { serial: Serial, payload: Bytes },
    State { code: StateCode, finish_at: Option<Serial> },
    Info(InfoPayload),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown state code {0:#04x}")]
    UnknownState(u8),
    #[error("truncated {kind} packet ({len} bytes after type)")]
    Truncated { kind: &'static str, len: usize },
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        match self {
            Packet::Data { serial, payload } => {
                let mut buf = BytesMut::with_capacity(5 + payload.len());
                buf.put_u8(PACKET_TYPE_DATA);
                buf.put_u32(*serial);
                buf.extend_from_slice(payload);
                buf.freeze()
            }
            Packet::State { code, finish_at } => {
                let mut buf = BytesMut::with_capacity(6);
                buf.put_u8(PACKET_TYPE_STATE);
                buf.put_u8(*code as u8);
                if let Some(serial) = finish_at {
                    buf.put_u32(*serial);
                }
                buf.freeze()
            }
            Packet::Info(info) => {
                let mut buf = BytesMut::with_capacity(29);
                buf.put_u8(PACKET_TYPE_INFO);
                buf.put_u32(info.timestamp);
                buf.put_u32(info.incoming_serial);
                buf.put_u32(info.max_incoming_serial);
                buf.put_u64(info.bytes_read);
                buf.put_u64(info.bytes_sent);
                buf.freeze()
            }
        }
    }

    pub fn decode(mut body: Bytes) -> Result<Packet, PacketError> {
        if body.is_empty() {
            return Err(PacketError::Empty);
        }
        match body.get_u8() {
            PACKET_TYPE_DATA => {
                if body.len() < 4 {
                    return Err(PacketError::Truncated { kind: "data", len: body.len() });
                }
                let serial = body.get_u32();
                Ok(Packet::Data { serial, payload: body })
            }
            PACKET_TYPE_STATE => {
                if body.is_empty() {
                    return Err(PacketError::Truncated { kind: "state", len: 0 });
                }
                let raw = body.get_u8();
                let code = StateCode::from_u8(raw).ok_or(PacketError::UnknownState(raw))?;
                let finish_at = if code.carries_serial() {
                    if body.len() < 4 {
                        return Err(PacketError::Truncated { kind: "state", len: body.len() + 1 });
                    }
                    Some(body.get_u32())
                } else {
                    None
                };
                Ok(Packet::State { code, finish_at })
            }
            PACKET_TYPE_INFO => {
                if body.len() < 28 {
                    return Err(PacketError::Truncated { kind: "info", len: body.len() });
                }
                Ok(Packet::Info(InfoPayload {
                    timestamp: body.get_u32(),
                    incoming_serial: body.get_u32(),
                    max_incoming_serial: body.get_u32(),
                    bytes_read: body.get_u64(),
                    bytes_sent: body.get_u64(),
                }))
            }
            other => Err(PacketError::UnknownType(other)),
        }
    }
}
