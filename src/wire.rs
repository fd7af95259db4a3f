//! Link-local wire framing.
//!
//! Every datagram on the mesh carries a fixed 14-byte header followed by an
//! opaque payload (UTF-8 JSON for every packet type the agent emits):
//!
//! ```text
//! byte 0      packet type
//! bytes 1..7  source MAC (raw)
//! bytes 7..13 destination MAC (raw, all-0xFF for broadcast)
//! byte 13     TTL (decremented per forward, 0 drops)
//! bytes 14..  payload
//! ```
//!
//! Decoding keeps the payload bytes verbatim; JSON parsing happens at
//! dispatch so that a malformed payload drops the payload, not the frame.

use std::fmt;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 14;

/// 6-byte hardware address used to address frames on the broadcast medium.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

/// All-ones destination address accepted by every receiver.
pub const BROADCAST_MAC: MacAddr = MacAddr([0xFF; 6]);

impl MacAddr {
    /// Parse the canonical colon-separated form, e.g. `b8:27:eb:01:02:03`.
    /// Case-insensitive; separators `:` and `-` are both accepted.
    pub fn parse(text: &str) -> Option<MacAddr> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in text.split(|c| c == ':' || c == '-') {
            if count == 6 || part.len() != 2 {
                return None;
            }
            bytes[count] = u8::from_str_radix(part, 16).ok()?;
            count += 1;
        }
        if count != 6 {
            return None;
        }
        Some(MacAddr(bytes))
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Wire packet types. Values 5 and 6 existed in earlier deployments as
/// dedicated metric packets and are not part of this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0,
    Rreq = 1,
    Rrep = 2,
    Data = 3,
    Rerr = 4,
    Ack = 7,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<PacketType> {
        match value {
            0 => Some(PacketType::Hello),
            1 => Some(PacketType::Rreq),
            2 => Some(PacketType::Rrep),
            3 => Some(PacketType::Data),
            4 => Some(PacketType::Rerr),
            7 => Some(PacketType::Ack),
            _ => None,
        }
    }
}

/// A decoded link-local frame: header fields plus the raw payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.src_mac.0);
        buf.extend_from_slice(&self.dst_mac.0);
        buf.push(self.ttl);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a datagram. Returns `None` for frames shorter than the header
    /// or with an unknown type byte; such frames are dropped silently by the
    /// receive path.
    pub fn decode(buf: &[u8]) -> Option<Frame> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let packet_type = PacketType::from_u8(buf[0])?;
        let mut src = [0u8; 6];
        src.copy_from_slice(&buf[1..7]);
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&buf[7..13]);
        Some(Frame {
            packet_type,
            src_mac: MacAddr(src),
            dst_mac: MacAddr(dst),
            ttl: buf[13],
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }

    /// Interpret the payload as JSON. Any decoding error yields `None`: the
    /// caller treats the frame as carrying no usable payload.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        if self.payload.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }
}
