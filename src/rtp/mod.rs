//! RTP wire codec
//!
//! RTP headers per RFC 3550 with one-byte header extensions per RFC 8285
//! (transport-wide-cc sequence and picture-id), plus the H.264 payload
//! shapes the ingest path demultiplexes: STAP-A, FU-A and raw NAL units.
//!
//! The header codec is deliberately usable on still-encrypted packets: the
//! ingest pipeline parses the header (and the TWCC extension) before SRTP
//! unprotect, because padding probes and duplicated ARQ replies fail SRTP
//! while still counting for congestion feedback.

pub mod extension;
pub mod header;
pub mod packet;

pub use extension::{ExtensionKind, ExtensionMap, EXT_URI_PICTURE_ID, EXT_URI_TWCC};
pub use header::RtpHeader;
pub use packet::{RtpPacket, RtpPayload};

/// Maximum datagram the data plane handles
pub const RTP_PACKET_MAX: usize = 1500;

/// Media kind of a track or packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Audio (opus)
    Audio,
    /// Video (H.264)
    Video,
}

impl MediaKind {
    /// SDP media name
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
