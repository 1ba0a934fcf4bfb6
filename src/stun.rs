//! STUN binding codec
//!
//! The session runs ice-lite: it answers binding requests and never probes.
//! Messages follow RFC 5389 — magic cookie, 12-byte transaction id,
//! MESSAGE-INTEGRITY keyed with the local ICE password and a trailing
//! FINGERPRINT. Only the attributes the responder needs are modeled.

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};
use ring::hmac;

use crate::error::{ErrorKind, Result, RtcError};

/// STUN magic cookie
const MAGIC_COOKIE: u32 = 0x2112_A442;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

/// STUN message classes the responder handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request (0x0001)
    BindingRequest,
    /// Binding success response (0x0101)
    BindingResponse,
}

impl StunMessageType {
    fn wire(self) -> u16 {
        match self {
            StunMessageType::BindingRequest => 0x0001,
            StunMessageType::BindingResponse => 0x0101,
        }
    }
}

/// A decoded (or to-be-encoded) STUN binding message
#[derive(Debug, Clone)]
pub struct StunPacket {
    /// Message class
    pub message_type: StunMessageType,
    /// Our ufrag, first half of USERNAME
    pub local_ufrag: String,
    /// Peer ufrag, second half of USERNAME
    pub remote_ufrag: String,
    /// Transaction id
    pub transaction_id: [u8; 12],
    /// MAPPED-ADDRESS for responses
    pub mapped_address: Option<SocketAddr>,
    /// Peer claims the ice-controlled role
    pub ice_controlled: bool,
    /// Peer claims the ice-controlling role
    pub ice_controlling: bool,
    /// Peer nominated this candidate pair
    pub use_candidate: bool,
}

impl StunPacket {
    /// Build a binding request (used by tests and diagnostics; the server
    /// itself never probes)
    pub fn binding_request(
        local_ufrag: impl Into<String>,
        remote_ufrag: impl Into<String>,
        transaction_id: [u8; 12],
    ) -> Self {
        Self {
            message_type: StunMessageType::BindingRequest,
            local_ufrag: local_ufrag.into(),
            remote_ufrag: remote_ufrag.into(),
            transaction_id,
            mapped_address: None,
            ice_controlled: false,
            ice_controlling: false,
            use_candidate: false,
        }
    }

    /// Build the binding response answering a request
    pub fn binding_response(request: &StunPacket, mapped: SocketAddr) -> Self {
        Self {
            message_type: StunMessageType::BindingResponse,
            local_ufrag: request.remote_ufrag.clone(),
            remote_ufrag: request.local_ufrag.clone(),
            transaction_id: request.transaction_id,
            mapped_address: Some(mapped),
            ice_controlled: false,
            ice_controlling: false,
            use_candidate: false,
        }
    }

    /// Whether this is a binding request
    pub fn is_binding_request(&self) -> bool {
        self.message_type == StunMessageType::BindingRequest
    }

    /// The USERNAME attribute value
    pub fn username(&self) -> String {
        format!("{}:{}", self.local_ufrag, self.remote_ufrag)
    }

    /// Decode a STUN message
    ///
    /// Integrity is not verified here; the demultiplexer hands the core
    /// already-accepted packets.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(RtcError::new(
                ErrorKind::Stun,
                format!("message requires 20 bytes, got {}", data.len()),
            ));
        }

        let message_type = match u16::from_be_bytes([data[0], data[1]]) {
            0x0001 => StunMessageType::BindingRequest,
            0x0101 => StunMessageType::BindingResponse,
            other => {
                return Err(RtcError::new(
                    ErrorKind::Stun,
                    format!("unsupported message type={:#06x}", other),
                ))
            }
        };
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(RtcError::new(ErrorKind::Stun, "bad magic cookie"));
        }
        if data.len() < 20 + length {
            return Err(RtcError::new(ErrorKind::Stun, "attributes overrun packet"));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut packet = StunPacket {
            message_type,
            local_ufrag: String::new(),
            remote_ufrag: String::new(),
            transaction_id,
            mapped_address: None,
            ice_controlled: false,
            ice_controlling: false,
            use_candidate: false,
        };

        let mut at = 20usize;
        let end = 20 + length;
        while at + 4 <= end {
            let attr_type = u16::from_be_bytes([data[at], data[at + 1]]);
            let attr_len = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
            at += 4;
            if at + attr_len > end {
                return Err(RtcError::new(ErrorKind::Stun, "attribute overruns packet"));
            }
            let value = &data[at..at + attr_len];
            match attr_type {
                ATTR_USERNAME => {
                    let username = String::from_utf8_lossy(value);
                    let mut parts = username.splitn(2, ':');
                    packet.local_ufrag = parts.next().unwrap_or("").to_string();
                    packet.remote_ufrag = parts.next().unwrap_or("").to_string();
                }
                ATTR_MAPPED_ADDRESS => {
                    if attr_len >= 8 && value[1] == 0x01 {
                        let port = u16::from_be_bytes([value[2], value[3]]);
                        let ip = IpAddr::from([value[4], value[5], value[6], value[7]]);
                        packet.mapped_address = Some(SocketAddr::new(ip, port));
                    }
                }
                ATTR_ICE_CONTROLLED => packet.ice_controlled = true,
                ATTR_ICE_CONTROLLING => packet.ice_controlling = true,
                ATTR_USE_CANDIDATE => packet.use_candidate = true,
                ATTR_PRIORITY | ATTR_MESSAGE_INTEGRITY | ATTR_FINGERPRINT => {}
                _ => {}
            }
            at += attr_len + ((4 - attr_len % 4) % 4);
        }

        Ok(packet)
    }

    /// Encode the message, appending MESSAGE-INTEGRITY keyed with `pwd`
    /// and a FINGERPRINT
    ///
    /// Encoding is deterministic: the same packet and password always yield
    /// identical bytes, so retransmitted requests get byte-identical
    /// responses.
    pub fn encode(&self, pwd: &str, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        buf.put_u16(self.message_type.wire());
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        if !self.local_ufrag.is_empty() || !self.remote_ufrag.is_empty() {
            put_attr(buf, ATTR_USERNAME, self.username().as_bytes());
        }
        if let Some(addr) = self.mapped_address {
            let mut value = Vec::with_capacity(8);
            value.push(0);
            match addr.ip() {
                IpAddr::V4(ip) => {
                    value.push(0x01);
                    value.extend_from_slice(&addr.port().to_be_bytes());
                    value.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    value.push(0x02);
                    value.extend_from_slice(&addr.port().to_be_bytes());
                    value.extend_from_slice(&ip.octets());
                }
            }
            put_attr(buf, ATTR_MAPPED_ADDRESS, &value);
        }
        if self.ice_controlled {
            put_attr(buf, ATTR_ICE_CONTROLLED, &[0u8; 8]);
        }
        if self.ice_controlling {
            put_attr(buf, ATTR_ICE_CONTROLLING, &[0u8; 8]);
        }
        if self.use_candidate {
            put_attr(buf, ATTR_USE_CANDIDATE, &[]);
        }

        // MESSAGE-INTEGRITY covers everything before it, with the length
        // field already counting the attribute itself.
        patch_length(buf, start, buf.len() - start - 20 + 24);
        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, pwd.as_bytes());
        let tag = hmac::sign(&key, &buf[start..]);
        put_attr(buf, ATTR_MESSAGE_INTEGRITY, tag.as_ref());

        // FINGERPRINT is computed the same way over the message so far.
        patch_length(buf, start, buf.len() - start - 20 + 8);
        let crc = crc32_ieee(&buf[start..]) ^ 0x5354_554E;
        put_attr(buf, ATTR_FINGERPRINT, &crc.to_be_bytes());

        Ok(())
    }
}

fn put_attr(buf: &mut BytesMut, attr_type: u16, value: &[u8]) {
    buf.put_u16(attr_type);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    let pad = (4 - value.len() % 4) % 4;
    for _ in 0..pad {
        buf.put_u8(0);
    }
}

fn patch_length(buf: &mut BytesMut, start: usize, length: usize) {
    let bytes = (length as u16).to_be_bytes();
    buf[start + 2] = bytes[0];
    buf[start + 3] = bytes[1];
}

/// CRC-32 (IEEE, reflected), bitwise
fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
