//! RTP header codec
//!
//! Fixed header per RFC 3550 §5.1, one-byte header extensions per RFC 8285.
//! Decoding is side-effect free and works on encrypted packets, since SRTP
//! leaves the header in the clear.

use bytes::{BufMut, BytesMut};

use super::extension::{ExtensionKind, ExtensionMap};
use crate::error::{ErrorKind, Result, RtcError};

/// RTP protocol version
pub const RTP_VERSION: u8 = 2;

/// Fixed header size without CSRCs and extension
pub const RTP_FIXED_HEADER_SIZE: usize = 12;

/// Profile word selecting the one-byte extension format
const ONE_BYTE_EXT_PROFILE: u16 = 0xBEDE;

/// Decoded RTP header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Media timestamp
    pub timestamp: u32,
    /// Synchronization source
    pub ssrc: u32,
    /// Contributing sources
    pub csrcs: Vec<u32>,
    /// Trailing padding length (0 when absent)
    pub padding_len: u8,
    pub(crate) twcc: Option<(u8, u16)>,
    pub(crate) picture_id: Option<(u8, u16)>,
}

impl RtpHeader {
    /// Decode a header from the front of a datagram
    ///
    /// Returns the header and the payload offset. The payload ends
    /// `padding_len` bytes before the end of the datagram; with
    /// `ignore_padding` the padding bit is left unresolved (used when
    /// parsing headers of packets that may not survive SRTP).
    pub fn decode(
        data: &[u8],
        exts: &ExtensionMap,
        ignore_padding: bool,
    ) -> Result<(RtpHeader, usize)> {
        if data.len() < RTP_FIXED_HEADER_SIZE {
            return Err(RtcError::new(
                ErrorKind::Rtp,
                format!("header requires 12 bytes, got {}", data.len()),
            ));
        }

        let b0 = data[0];
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(RtcError::new(
                ErrorKind::Rtp,
                format!("bad version={}", version),
            ));
        }
        let has_padding = (b0 & 0x20) != 0;
        let has_extension = (b0 & 0x10) != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let b1 = data[1];
        let mut header = RtpHeader {
            marker: (b1 & 0x80) != 0,
            payload_type: b1 & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            ..Default::default()
        };

        let mut pos = RTP_FIXED_HEADER_SIZE;
        if data.len() < pos + csrc_count * 4 {
            return Err(RtcError::new(
                ErrorKind::Rtp,
                format!("csrc count={} overruns packet", csrc_count),
            ));
        }
        for _ in 0..csrc_count {
            header.csrcs.push(u32::from_be_bytes([
                data[pos],
                data[pos + 1],
                data[pos + 2],
                data[pos + 3],
            ]));
            pos += 4;
        }

        if has_extension {
            pos = header.decode_extension(data, pos, exts)?;
        }

        if has_padding && !ignore_padding {
            let pad = *data.last().unwrap();
            if pad == 0 || pos + pad as usize > data.len() {
                return Err(RtcError::new(
                    ErrorKind::Rtp,
                    format!("bad padding={}", pad),
                ));
            }
            header.padding_len = pad;
        }

        Ok((header, pos))
    }

    fn decode_extension(&mut self, data: &[u8], mut pos: usize, exts: &ExtensionMap) -> Result<usize> {
        if data.len() < pos + 4 {
            return Err(RtcError::new(ErrorKind::Rtp, "truncated extension header"));
        }
        let profile = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let words = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        let ext_end = pos + words * 4;
        if data.len() < ext_end {
            return Err(RtcError::new(
                ErrorKind::Rtp,
                format!("extension words={} overrun packet", words),
            ));
        }

        // Only the one-byte format is negotiated; other profiles are
        // skipped wholesale.
        if profile == ONE_BYTE_EXT_PROFILE {
            let mut at = pos;
            while at < ext_end {
                let b = data[at];
                if b == 0 {
                    at += 1;
                    continue;
                }
                let id = b >> 4;
                let len = (b & 0x0F) as usize + 1;
                if id == 15 {
                    break;
                }
                at += 1;
                if at + len > ext_end {
                    return Err(RtcError::new(
                        ErrorKind::Rtp,
                        format!("extension id={} len={} overruns block", id, len),
                    ));
                }
                if len == 2 {
                    let value = u16::from_be_bytes([data[at], data[at + 1]]);
                    match exts.kind_of(id) {
                        Some(ExtensionKind::TransportCc) => self.twcc = Some((id, value)),
                        Some(ExtensionKind::PictureId) => self.picture_id = Some((id, value)),
                        None => {}
                    }
                }
                at += len;
            }
        }

        Ok(ext_end)
    }

    /// Encode the header, including the extension block when present
    pub fn encode(&self, buf: &mut BytesMut) {
        let has_extension = self.twcc.is_some() || self.picture_id.is_some();

        let mut b0 = RTP_VERSION << 6;
        if self.padding_len > 0 {
            b0 |= 0x20;
        }
        if has_extension {
            b0 |= 0x10;
        }
        b0 |= self.csrcs.len() as u8 & 0x0F;
        buf.put_u8(b0);

        let mut b1 = self.payload_type & 0x7F;
        if self.marker {
            b1 |= 0x80;
        }
        buf.put_u8(b1);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }

        if has_extension {
            self.encode_extension(buf);
        }
    }

    fn encode_extension(&self, buf: &mut BytesMut) {
        let mut elements = 0usize;
        if self.twcc.is_some() {
            elements += 1;
        }
        if self.picture_id.is_some() {
            elements += 1;
        }
        // Each element is 1 id/len byte plus a 2-byte value.
        let raw = elements * 3;
        let words = (raw + 3) / 4;

        buf.put_u16(ONE_BYTE_EXT_PROFILE);
        buf.put_u16(words as u16);

        let mut written = 0usize;
        if let Some((id, sn)) = self.twcc {
            buf.put_u8((id << 4) | 0x01);
            buf.put_u16(sn);
            written += 3;
        }
        if let Some((id, pid)) = self.picture_id {
            buf.put_u8((id << 4) | 0x01);
            buf.put_u16(pid);
            written += 3;
        }
        while written < words * 4 {
            buf.put_u8(0);
            written += 1;
        }
    }

    /// The TWCC sequence number carried in the extension, if any
    pub fn twcc_sequence_number(&self) -> Option<u16> {
        self.twcc.map(|(_, sn)| sn)
    }

    /// Set (or overwrite) the TWCC sequence extension
    pub fn set_twcc_sequence_number(&mut self, id: u8, sn: u16) {
        self.twcc = Some((id, sn));
    }

    /// The picture id carried in the extension, if any
    pub fn picture_id(&self) -> Option<u16> {
        self.picture_id.map(|(_, v)| v)
    }

    /// Set the picture-id extension
    pub fn set_picture_id(&mut self, id: u8, value: u16) {
        self.picture_id = Some((id, value));
    }

    /// Short header description used when wrapping errors
    pub fn describe(&self) -> String {
        format!(
            "marker={}, pt={}, seq={}, ts={}, ssrc={}, pad={}",
            self.marker as u8,
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.padding_len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twcc_map() -> ExtensionMap {
        let mut map = ExtensionMap::new();
        map.register(3, ExtensionKind::TransportCc);
        map
    }

    #[test]
    fn test_roundtrip_plain() {
        let header = RtpHeader {
            marker: true,
            payload_type: 111,
            sequence: 4242,
            timestamp: 160_000,
            ssrc: 0xDEADBEEF,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), RTP_FIXED_HEADER_SIZE);

        let (decoded, offset) = RtpHeader::decode(&buf, &ExtensionMap::new(), false).unwrap();
        assert_eq!(offset, RTP_FIXED_HEADER_SIZE);
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_roundtrip_twcc_extension() {
        let mut header = RtpHeader {
            payload_type: 102,
            sequence: 9,
            timestamp: 90_000,
            ssrc: 77,
            ..Default::default()
        };
        header.set_twcc_sequence_number(3, 0x1234);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let (decoded, offset) = RtpHeader::decode(&buf, &twcc_map(), false).unwrap();
        assert_eq!(decoded.twcc_sequence_number(), Some(0x1234));
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_unregistered_extension_id_is_skipped() {
        let mut header = RtpHeader::default();
        header.set_twcc_sequence_number(7, 99);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        // The id is 7 on the wire but the map only knows id 3.
        let (decoded, _) = RtpHeader::decode(&buf, &twcc_map(), false).unwrap();
        assert_eq!(decoded.twcc_sequence_number(), None);
    }

    #[test]
    fn test_padding_decode() {
        let header = RtpHeader {
            payload_type: 96,
            sequence: 1,
            ssrc: 5,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[0] |= 0x20;
        buf.extend_from_slice(&[0xAA, 0, 0, 3]);

        let (decoded, offset) = RtpHeader::decode(&buf, &ExtensionMap::new(), false).unwrap();
        assert_eq!(decoded.padding_len, 3);
        assert_eq!(buf.len() - offset - decoded.padding_len as usize, 1);

        // Pre-unprotect parsing ignores the padding bit entirely.
        let (lenient, _) = RtpHeader::decode(&buf, &ExtensionMap::new(), true).unwrap();
        assert_eq!(lenient.padding_len, 0);
    }

    #[test]
    fn test_rejects_short_and_bad_version() {
        assert!(RtpHeader::decode(&[0x80, 0, 0], &ExtensionMap::new(), false).is_err());

        let mut buf = BytesMut::new();
        RtpHeader::default().encode(&mut buf);
        buf[0] = 0x40;
        assert!(RtpHeader::decode(&buf, &ExtensionMap::new(), false).is_err());
    }
}
