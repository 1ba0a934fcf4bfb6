//! RTCP wire codec
//!
//! Compound packet iteration plus the report and feedback formats the
//! session core speaks: SR/RR (RFC 3550), XR RRTR/DLRR (RFC 3611), Generic
//! NACK and PLI (RFC 4585), and transport-wide congestion control feedback.

pub mod feedback;
pub mod report;
pub mod twcc;

pub use feedback::{encode_nack, encode_pli, nack_sequences, nack_words, parse_fb_header};
pub use report::{encode_rr, encode_xr_rrtr, parse_rr, parse_sr, parse_xr_dlrr, rtt_millis};
pub use twcc::TwccReceiver;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ErrorKind, Result, RtcError};

/// Sender report
pub const PT_SR: u8 = 200;
/// Receiver report
pub const PT_RR: u8 = 201;
/// Source description
pub const PT_SDES: u8 = 202;
/// Goodbye
pub const PT_BYE: u8 = 203;
/// Application-defined
pub const PT_APP: u8 = 204;
/// Transport layer feedback
pub const PT_RTPFB: u8 = 205;
/// Payload-specific feedback
pub const PT_PSFB: u8 = 206;
/// Extended report
pub const PT_XR: u8 = 207;

/// RTPFB format: Generic NACK
pub const RTPFB_FMT_NACK: u8 = 1;
/// RTPFB format: transport-wide congestion control feedback
pub const RTPFB_FMT_TWCC: u8 = 15;

/// PSFB format: picture loss indication
pub const PSFB_FMT_PLI: u8 = 1;
/// PSFB format: slice loss indication
pub const PSFB_FMT_SLI: u8 = 2;
/// PSFB format: reference picture selection indication
pub const PSFB_FMT_RPSI: u8 = 3;
/// PSFB format: application layer feedback
pub const PSFB_FMT_AFB: u8 = 15;

/// One packet inside a compound RTCP datagram
#[derive(Debug, Clone, Copy)]
pub struct RtcpPacketRef<'a> {
    /// RTCP payload type
    pub payload_type: u8,
    /// The full packet, header included
    pub data: &'a [u8],
}

/// Split a compound RTCP datagram into its packets
///
/// The length of each packet is taken from bytes [2..4]; a length that
/// overruns the buffer aborts the whole compound.
pub fn split_compound(data: &[u8]) -> Result<Vec<RtcpPacketRef<'_>>> {
    let mut packets = Vec::new();
    let mut at = 0usize;

    while at < data.len() {
        if data.len() - at < 4 {
            return Err(RtcError::new(
                ErrorKind::RtcpCheck,
                format!("trailing {} bytes are not a packet", data.len() - at),
            ));
        }
        let payload_type = data[at + 1];
        let words = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
        let length = (words + 1) * 4;
        if at + length > data.len() {
            return Err(RtcError::new(
                ErrorKind::RtcpCheck,
                format!("invalid rtcp packet, length={}", length),
            ));
        }

        packets.push(RtcpPacketRef {
            payload_type,
            data: &data[at..at + length],
        });
        at += length;
    }

    Ok(packets)
}

/// Microseconds since the unix epoch
pub fn unix_micros_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Seconds between the NTP era and the unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// NTP timestamp, 32.32 fixed point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTime {
    /// Whole seconds
    pub seconds: u32,
    /// Fractional seconds, 1/2^32 units
    pub fractions: u32,
}

impl NtpTime {
    /// Convert a unix timestamp in microseconds
    pub fn from_unix_micros(us: u64) -> Self {
        let seconds = (us / 1_000_000 + NTP_UNIX_OFFSET) as u32;
        let fractions = ((us % 1_000_000) << 32) / 1_000_000;
        Self {
            seconds,
            fractions: fractions as u32,
        }
    }

    /// Current time
    pub fn now() -> Self {
        Self::from_unix_micros(unix_micros_now())
    }

    /// Rebuild from the 64-bit wire value
    pub fn from_u64(v: u64) -> Self {
        Self {
            seconds: (v >> 32) as u32,
            fractions: v as u32,
        }
    }

    /// The 64-bit wire value
    pub fn as_u64(self) -> u64 {
        ((self.seconds as u64) << 32) | self.fractions as u64
    }

    /// NTP short format: middle 32 bits
    pub fn compact(self) -> u32 {
        (self.seconds << 16) | (self.fractions >> 16)
    }
}

/// Convert an NTP short-format interval (16.16 seconds) to milliseconds
pub fn ntp_short_to_millis(v: u32) -> u64 {
    let seconds = (v >> 16) as u64;
    let fractions = (v & 0xFFFF) as u64;
    seconds * 1000 + (fractions * 1000 + 32_768) / 65_536
}

/// Encode a millisecond delay as NTP short format (used for DLSR)
pub fn millis_to_ntp_short(ms: u64) -> u32 {
    (((ms / 1000) << 16) as u32) | (((ms % 1000) * 65_536 / 1000) as u32)
}
