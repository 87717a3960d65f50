//! On-the-wire layout: KCP header geometry for the 64-bit conversation
//! variants, the fixed 20-byte control datagram, and the handshake response.

use bytes::{BufMut, Bytes, BytesMut};

/// Base KCP header with an 8-byte conversation id.
pub const KCP_HEADER_BASE: usize = 28;
/// Extended header variant carrying an extra 4-byte token.
pub const KCP_HEADER_EXT: usize = 32;

/// Offset of the little-endian segment sequence number inside a KCP header:
/// conv(8) + cmd(1) + frg(1) + wnd(2) + ts(4).
pub const SN_OFFSET: usize = 16;

/// Bytes the FEC framing prepends ahead of the KCP header when enabled.
pub const FEC_HEADER_SIZE_PLUS_2: usize = 8;

/// Exact length of a control datagram.
pub const CONTROL_LEN: usize = 20;

pub const CODE_CONNECT: i32 = 255;
pub const CODE_DISCONNECT: i32 = 404;
pub const CODE_HANDSHAKE_RSP: i32 = 325;

const HANDSHAKE_RSP_TRAILER: u32 = 0x1451_4545;

/// A decoded 20-byte control datagram.
///
/// Layout, offsets in bytes: code (i32 BE) at 0, two reserved u32 LE at 4
/// and 8, enet token (i32 BE) at 12, reserved u32 BE at 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Connect { enet: i32 },
    Disconnect,
    Unknown { code: i32 },
}

impl Control {
    /// Decode a control datagram. Anything that is not exactly 20 bytes is
    /// not a control datagram.
    pub fn decode(payload: &[u8]) -> Option<Control> {
        if payload.len() != CONTROL_LEN {
            return None;
        }
        let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        // Bytes 4..12 and 16..20 are reserved and discarded.
        let enet = i32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]);
        Some(match code {
            CODE_CONNECT => Control::Connect { enet },
            CODE_DISCONNECT => Control::Disconnect,
            _ => Control::Unknown { code },
        })
    }

    /// Encode a connect request (used by tests and client tooling).
    pub fn encode_connect(enet: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_LEN);
        buf.put_i32(CODE_CONNECT);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_i32(enet);
        buf.put_u32(0);
        buf.freeze()
    }

    /// Encode a disconnect request.
    pub fn encode_disconnect() -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_LEN);
        buf.put_i32(CODE_DISCONNECT);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_i32(0);
        buf.put_u32(0);
        buf.freeze()
    }
}

/// The 20-byte handshake response sent in reply to a CONNECT: code 325 BE,
/// conversation id split into two big-endian u32 halves, the echoed enet
/// token, and a fixed trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRsp {
    pub conv: u64,
    pub enet: i32,
}

impl HandshakeRsp {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_LEN);
        buf.put_i32(CODE_HANDSHAKE_RSP);
        buf.put_u32((self.conv >> 32) as u32);
        buf.put_u32(self.conv as u32);
        buf.put_i32(self.enet);
        buf.put_u32(HANDSHAKE_RSP_TRAILER);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Option<HandshakeRsp> {
        if payload.len() != CONTROL_LEN {
            return None;
        }
        let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if code != CODE_HANDSHAKE_RSP {
            return None;
        }
        let hi = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let lo = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
        let enet = i32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]);
        Some(HandshakeRsp {
            conv: (u64::from(hi) << 32) | u64::from(lo),
            enet,
        })
    }
}

/// Conversation id of a data datagram: big-endian u64 at offset 0.
pub fn conv_of(payload: &[u8]) -> Option<u64> {
    let head: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

/// Segment sequence number: little-endian u32 at the given offset.
pub fn sn_at(payload: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = payload.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_roundtrip() {
        let raw = Control::encode_connect(7);
        assert_eq!(raw.len(), CONTROL_LEN);
        assert_eq!(Control::decode(&raw), Some(Control::Connect { enet: 7 }));
    }

    #[test]
    fn disconnect_roundtrip() {
        let raw = Control::encode_disconnect();
        assert_eq!(Control::decode(&raw), Some(Control::Disconnect));
    }

    #[test]
    fn unknown_code_is_reported_not_dropped() {
        let mut raw = Control::encode_connect(0).to_vec();
        raw[0..4].copy_from_slice(&77i32.to_be_bytes());
        assert_eq!(Control::decode(&raw), Some(Control::Unknown { code: 77 }));
    }

    #[test]
    fn wrong_length_is_not_control() {
        assert_eq!(Control::decode(&[0u8; 19]), None);
        assert_eq!(Control::decode(&[0u8; 21]), None);
    }

    #[test]
    fn handshake_rsp_roundtrip() {
        let rsp = HandshakeRsp {
            conv: 0xDEAD_BEEF_CAFE_BABE,
            enet: 9,
        };
        let raw = rsp.encode();
        assert_eq!(raw.len(), CONTROL_LEN);
        assert_eq!(HandshakeRsp::decode(&raw), Some(rsp));
    }

    #[test]
    fn conv_is_big_endian_at_zero() {
        let mut payload = vec![0u8; KCP_HEADER_BASE];
        payload[..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(conv_of(&payload), Some(0x0102_0304_0506_0708));
        assert_eq!(conv_of(&payload[..7]), None);
    }

    #[test]
    fn sn_is_little_endian_at_offset() {
        let mut payload = vec![0u8; KCP_HEADER_BASE];
        payload[SN_OFFSET..SN_OFFSET + 4].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(sn_at(&payload, SN_OFFSET), Some(3));
        assert_eq!(sn_at(&payload, KCP_HEADER_BASE - 3), None);
    }
}
