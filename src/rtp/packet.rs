//! RTP packet codec and H.264 payload shapes
//!
//! The ingest path picks the payload parser by the owning track kind and,
//! for video, the NAL unit type in the first payload byte: STAP-A (24),
//! FU-A (28), anything else raw. Payloads keep their wire bytes (indicator
//! and FU header included) so a decode/encode round trip is exact.

use bytes::{BufMut, Bytes, BytesMut};

use super::extension::ExtensionMap;
use super::header::RtpHeader;
use super::MediaKind;
use crate::error::{ErrorKind, Result, RtcError};

/// NAL unit type: IDR slice (keyframe)
pub const NALU_TYPE_IDR: u8 = 5;
/// NAL unit type: sequence parameter set
pub const NALU_TYPE_SPS: u8 = 7;
/// NAL unit type: picture parameter set
pub const NALU_TYPE_PPS: u8 = 8;
/// Aggregation packet
pub const NALU_TYPE_STAP_A: u8 = 24;
/// Fragmentation unit
pub const NALU_TYPE_FU_A: u8 = 28;

/// Payload of one RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtpPayload {
    /// Opaque payload (audio, or a single video NAL unit)
    Raw(Bytes),
    /// STAP-A aggregation: indicator byte plus length-prefixed NAL units
    StapA {
        /// STAP-A indicator byte as received
        indicator: u8,
        /// Aggregated NAL units
        nalus: Vec<Bytes>,
    },
    /// FU-A fragment: indicator and FU header kept verbatim
    FuA {
        /// FU indicator byte
        indicator: u8,
        /// FU header byte (start/end flags and original NALU type)
        fu_header: u8,
        /// Fragment data
        data: Bytes,
    },
}

impl RtpPayload {
    /// Encoded size in bytes
    pub fn wire_len(&self) -> usize {
        match self {
            RtpPayload::Raw(data) => data.len(),
            RtpPayload::StapA { nalus, .. } => {
                1 + nalus.iter().map(|n| 2 + n.len()).sum::<usize>()
            }
            RtpPayload::FuA { data, .. } => 2 + data.len(),
        }
    }
}

/// One RTP packet with its decoded payload
#[derive(Debug, Clone)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Media kind of the owning track
    pub kind: MediaKind,
    /// Decoded payload
    pub payload: RtpPayload,
}

impl RtpPacket {
    /// Build a packet from parts
    pub fn new(header: RtpHeader, kind: MediaKind, payload: RtpPayload) -> Self {
        Self {
            header,
            kind,
            payload,
        }
    }

    /// Decode a full packet
    pub fn decode(data: &[u8], exts: &ExtensionMap, kind: MediaKind) -> Result<Self> {
        let (header, offset) = RtpHeader::decode(data, exts, false)?;
        let end = data.len() - header.padding_len as usize;
        let payload = &data[offset..end];

        let payload = match kind {
            MediaKind::Audio => RtpPayload::Raw(Bytes::copy_from_slice(payload)),
            MediaKind::Video => Self::decode_video_payload(payload)?,
        };

        Ok(RtpPacket {
            header,
            kind,
            payload,
        })
    }

    fn decode_video_payload(payload: &[u8]) -> Result<RtpPayload> {
        if payload.is_empty() {
            return Ok(RtpPayload::Raw(Bytes::new()));
        }

        match payload[0] & 0x1F {
            NALU_TYPE_STAP_A => {
                let indicator = payload[0];
                let mut nalus = Vec::new();
                let mut at = 1usize;
                while at < payload.len() {
                    if at + 2 > payload.len() {
                        return Err(RtcError::new(ErrorKind::Rtp, "truncated stap-a size"));
                    }
                    let size = u16::from_be_bytes([payload[at], payload[at + 1]]) as usize;
                    at += 2;
                    if at + size > payload.len() {
                        return Err(RtcError::new(
                            ErrorKind::Rtp,
                            format!("stap-a nalu size={} overruns payload", size),
                        ));
                    }
                    nalus.push(Bytes::copy_from_slice(&payload[at..at + size]));
                    at += size;
                }
                Ok(RtpPayload::StapA { indicator, nalus })
            }
            NALU_TYPE_FU_A => {
                if payload.len() < 2 {
                    return Err(RtcError::new(ErrorKind::Rtp, "truncated fu-a header"));
                }
                Ok(RtpPayload::FuA {
                    indicator: payload[0],
                    fu_header: payload[1],
                    data: Bytes::copy_from_slice(&payload[2..]),
                })
            }
            _ => Ok(RtpPayload::Raw(Bytes::copy_from_slice(payload))),
        }
    }

    /// Encode header and payload into `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.header.encode(buf);
        match &self.payload {
            RtpPayload::Raw(data) => buf.extend_from_slice(data),
            RtpPayload::StapA { indicator, nalus } => {
                buf.put_u8(*indicator);
                for nalu in nalus {
                    if nalu.len() > u16::MAX as usize {
                        return Err(RtcError::new(ErrorKind::Rtp, "stap-a nalu too large"));
                    }
                    buf.put_u16(nalu.len() as u16);
                    buf.extend_from_slice(nalu);
                }
            }
            RtpPayload::FuA {
                indicator,
                fu_header,
                data,
            } => {
                buf.put_u8(*indicator);
                buf.put_u8(*fu_header);
                buf.extend_from_slice(data);
            }
        }
        Ok(())
    }

    /// Whether this packet starts a decodable video keyframe
    pub fn is_keyframe(&self) -> bool {
        if self.kind != MediaKind::Video {
            return false;
        }
        match &self.payload {
            RtpPayload::Raw(data) => {
                !data.is_empty() && matches!(data[0] & 0x1F, NALU_TYPE_IDR | NALU_TYPE_SPS)
            }
            RtpPayload::StapA { nalus, .. } => nalus.iter().any(|n| {
                !n.is_empty()
                    && matches!(n[0] & 0x1F, NALU_TYPE_IDR | NALU_TYPE_SPS | NALU_TYPE_PPS)
            }),
            RtpPayload::FuA {
                fu_header, ..
            } => (fu_header & 0x80) != 0 && (fu_header & 0x1F) == NALU_TYPE_IDR,
        }
    }

    /// Payload size on the wire
    pub fn payload_len(&self) -> usize {
        self.payload.wire_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_header(seq: u16, ssrc: u32) -> RtpHeader {
        RtpHeader {
            payload_type: 102,
            sequence: seq,
            timestamp: 3000,
            ssrc,
            ..Default::default()
        }
    }

    #[test]
    fn test_raw_roundtrip() {
        let pkt = RtpPacket::new(
            video_header(1, 100),
            MediaKind::Video,
            RtpPayload::Raw(Bytes::from_static(&[0x65, 0x88, 0x84])),
        );

        let mut buf = BytesMut::new();
        pkt.encode(&mut buf).unwrap();

        let decoded = RtpPacket::decode(&buf, &ExtensionMap::new(), MediaKind::Video).unwrap();
        assert_eq!(decoded.header, pkt.header);
        assert_eq!(decoded.payload, pkt.payload);
        assert!(decoded.is_keyframe());
    }

    #[test]
    fn test_stap_a_roundtrip_and_keyframe() {
        let pkt = RtpPacket::new(
            video_header(2, 100),
            MediaKind::Video,
            RtpPayload::StapA {
                indicator: 0x18 | 0x60,
                nalus: vec![
                    Bytes::from_static(&[0x67, 0x42]),
                    Bytes::from_static(&[0x68, 0xCE]),
                    Bytes::from_static(&[0x65, 0x88]),
                ],
            },
        );

        let mut buf = BytesMut::new();
        pkt.encode(&mut buf).unwrap();

        let decoded = RtpPacket::decode(&buf, &ExtensionMap::new(), MediaKind::Video).unwrap();
        match &decoded.payload {
            RtpPayload::StapA { nalus, .. } => assert_eq!(nalus.len(), 3),
            other => panic!("expected stap-a, got {:?}", other),
        }
        assert!(decoded.is_keyframe());

        let mut reencoded = BytesMut::new();
        decoded.encode(&mut reencoded).unwrap();
        assert_eq!(&reencoded[..], &buf[..]);
    }

    #[test]
    fn test_fu_a_start_flag_gates_keyframe() {
        let start = RtpPacket::new(
            video_header(3, 100),
            MediaKind::Video,
            RtpPayload::FuA {
                indicator: 0x7C,
                fu_header: 0x80 | NALU_TYPE_IDR,
                data: Bytes::from_static(&[1, 2, 3]),
            },
        );
        assert!(start.is_keyframe());

        let middle = RtpPacket::new(
            video_header(4, 100),
            MediaKind::Video,
            RtpPayload::FuA {
                indicator: 0x7C,
                fu_header: NALU_TYPE_IDR,
                data: Bytes::from_static(&[4, 5, 6]),
            },
        );
        assert!(!middle.is_keyframe());
    }

    #[test]
    fn test_audio_payload_is_always_raw() {
        let mut buf = BytesMut::new();
        let header = RtpHeader {
            payload_type: 111,
            sequence: 7,
            ssrc: 200,
            ..Default::default()
        };
        header.encode(&mut buf);
        // First byte would look like STAP-A if treated as video.
        buf.extend_from_slice(&[0x18, 0xFF, 0xEE]);

        let decoded = RtpPacket::decode(&buf, &ExtensionMap::new(), MediaKind::Audio).unwrap();
        assert!(matches!(decoded.payload, RtpPayload::Raw(_)));
        assert!(!decoded.is_keyframe());
    }

    #[test]
    fn test_truncated_stap_a_rejected() {
        let mut buf = BytesMut::new();
        video_header(5, 100).encode(&mut buf);
        buf.extend_from_slice(&[0x18, 0x00, 0x09, 0x65]);

        let err = RtpPacket::decode(&buf, &ExtensionMap::new(), MediaKind::Video).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rtp);
    }

    #[test]
    fn test_twcc_sn_roundtrip_through_packet() {
        let mut header = video_header(8, 100);
        header.set_twcc_sequence_number(3, 512);
        let pkt = RtpPacket::new(
            header,
            MediaKind::Video,
            RtpPayload::Raw(Bytes::from_static(&[0x41, 0x00])),
        );

        let mut buf = BytesMut::new();
        pkt.encode(&mut buf).unwrap();

        let mut exts = ExtensionMap::new();
        exts.register(3, crate::rtp::ExtensionKind::TransportCc);
        let decoded = RtpPacket::decode(&buf, &exts, MediaKind::Video).unwrap();
        assert_eq!(decoded.header.twcc_sequence_number(), Some(512));
    }
}
