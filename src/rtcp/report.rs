//! RTCP report codecs: SR, RR, XR RRTR and DLRR

use bytes::{BufMut, BytesMut};

use super::{ntp_short_to_millis, NtpTime, PT_RR, PT_SR, PT_XR};
use crate::error::{ErrorKind, Result, RtcError};

/// XR block type: receiver reference time
const XR_BT_RRTR: u8 = 4;
/// XR block type: delay since last receiver report
const XR_BT_DLRR: u8 = 5;

/// Sender info parsed from an SR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    /// SSRC of the sender
    pub ssrc: u32,
    /// NTP timestamp of the report
    pub ntp: NtpTime,
    /// RTP timestamp aligned with the NTP timestamp
    pub rtp_time: u32,
    /// Sender's packet count
    pub packet_count: u32,
    /// Sender's octet count
    pub octet_count: u32,
}

/// One report block of an SR or RR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    /// Reported source
    pub ssrc: u32,
    /// Fraction lost since the previous report
    pub fraction_lost: u8,
    /// Cumulative packets lost
    pub cumulative_lost: u32,
    /// Extended highest sequence received
    pub highest_sequence: u32,
    /// Interarrival jitter
    pub jitter: u32,
    /// Last SR timestamp, NTP short format
    pub lsr: u32,
    /// Delay since last SR, NTP short format
    pub dlsr: u32,
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_block(data: &[u8], at: usize) -> ReportBlock {
    ReportBlock {
        ssrc: read_u32(data, at),
        fraction_lost: data[at + 4],
        cumulative_lost: u32::from_be_bytes([0, data[at + 5], data[at + 6], data[at + 7]]),
        highest_sequence: read_u32(data, at + 8),
        jitter: read_u32(data, at + 12),
        lsr: read_u32(data, at + 16),
        dlsr: read_u32(data, at + 20),
    }
}

/// Parse a sender report
pub fn parse_sr(data: &[u8]) -> Result<(SenderInfo, Vec<ReportBlock>)> {
    if data.len() < 28 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid sender report, {} bytes", data.len()),
        ));
    }
    let rc = (data[0] & 0x1F) as usize;
    if data[1] != PT_SR {
        return Err(RtcError::new(ErrorKind::RtcpCheck, "not a sender report"));
    }
    let words = u16::from_be_bytes([data[2], data[3]]) as usize;
    if (words + 1) * 4 != rc * 24 + 28 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid sender report, length={}, rc={}", words, rc),
        ));
    }

    let info = SenderInfo {
        ssrc: read_u32(data, 4),
        ntp: NtpTime::from_u64(
            ((read_u32(data, 8) as u64) << 32) | read_u32(data, 12) as u64,
        ),
        rtp_time: read_u32(data, 16),
        packet_count: read_u32(data, 20),
        octet_count: read_u32(data, 24),
    };

    let mut blocks = Vec::with_capacity(rc);
    for i in 0..rc {
        blocks.push(read_block(data, 28 + i * 24));
    }

    Ok((info, blocks))
}

/// Parse a receiver report
pub fn parse_rr(data: &[u8]) -> Result<Vec<ReportBlock>> {
    if data.len() < 8 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid receiver report, {} bytes", data.len()),
        ));
    }
    let rc = (data[0] & 0x1F) as usize;
    if data[1] != PT_RR {
        return Err(RtcError::new(ErrorKind::RtcpCheck, "not a receiver report"));
    }
    let words = u16::from_be_bytes([data[2], data[3]]) as usize;
    if (words + 1) * 4 != rc * 24 + 8 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid receiver report, length={}, rc={}", words, rc),
        ));
    }

    let mut blocks = Vec::with_capacity(rc);
    for i in 0..rc {
        blocks.push(read_block(data, 8 + i * 24));
    }

    Ok(blocks)
}

/// Inputs for one outbound RR with a single report block
#[derive(Debug, Clone, Copy, Default)]
pub struct RrInfo {
    /// Reception SSRC the block reports on
    pub ssrc: u32,
    /// Extended highest sequence received
    pub extended_highest_sequence: u32,
    /// Last SR timestamp, 0 when no SR seen yet
    pub lsr: u32,
    /// Delay since last SR, 0 when no SR seen yet
    pub dlsr: u32,
}

/// Encode a receiver report with one report block
///
/// Loss and jitter fields are reported as zero; the block exists to carry
/// the extended highest sequence and the LSR/DLSR pair used for RTT.
pub fn encode_rr(buf: &mut BytesMut, info: RrInfo) {
    buf.put_u8(0x81);
    buf.put_u8(PT_RR);
    buf.put_u16(7);
    buf.put_u32(info.ssrc);

    buf.put_u32(info.ssrc);
    buf.put_u8(0);
    buf.put_uint(0, 3);
    buf.put_u32(info.extended_highest_sequence);
    buf.put_u32(0);
    buf.put_u32(info.lsr);
    buf.put_u32(info.dlsr);
}

/// Encode an XR packet carrying one receiver-reference-time block
pub fn encode_xr_rrtr(buf: &mut BytesMut, ssrc: u32, ntp: NtpTime) {
    buf.put_u8(0x80);
    buf.put_u8(PT_XR);
    buf.put_u16(4);
    buf.put_u32(ssrc);
    buf.put_u8(XR_BT_RRTR);
    buf.put_u8(0);
    buf.put_u16(2);
    buf.put_u32(ntp.seconds);
    buf.put_u32(ntp.fractions);
}

/// One DLRR sub-block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlrrEntry {
    /// SSRC the delay is reported for
    pub ssrc: u32,
    /// Last RR timestamp, NTP short format
    pub lrr: u32,
    /// Delay since that RR, NTP short format
    pub dlrr: u32,
}

/// Parse the DLRR blocks of an XR packet
pub fn parse_xr_dlrr(data: &[u8]) -> Result<Vec<DlrrEntry>> {
    if data.len() < 8 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid XR packet, {} bytes", data.len()),
        ));
    }
    let words = u16::from_be_bytes([data[2], data[3]]) as usize;
    let length = (words + 1) * 4;
    if length != data.len() {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid XR packet, length={}, got {}", length, data.len()),
        ));
    }

    let mut entries = Vec::new();
    let mut at = 8usize;
    while at + 4 <= data.len() {
        let bt = data[at];
        let block_words = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
        let block_len = (block_words + 1) * 4;
        if at + block_len > data.len() {
            return Err(RtcError::new(
                ErrorKind::RtcpCheck,
                format!("invalid XR block, block_length={}", block_len),
            ));
        }
        if bt == XR_BT_DLRR {
            let mut sub = at + 4;
            while sub + 12 <= at + block_len {
                entries.push(DlrrEntry {
                    ssrc: read_u32(data, sub),
                    lrr: read_u32(data, sub + 4),
                    dlrr: read_u32(data, sub + 8),
                });
                sub += 12;
            }
        }
        at += block_len;
    }

    Ok(entries)
}

/// Round-trip time from a DLRR entry, in milliseconds
///
/// `compact_now - lrr - dlrr` in NTP short format is the interval the
/// packet spent in flight, mapped from 16.16 seconds to milliseconds.
pub fn rtt_millis(compact_now: u32, lrr: u32, dlrr: u32) -> u64 {
    let rtt_ntp = compact_now.wrapping_sub(lrr).wrapping_sub(dlrr);
    ntp_short_to_millis(rtt_ntp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rr_roundtrip() {
        let mut buf = BytesMut::new();
        encode_rr(
            &mut buf,
            RrInfo {
                ssrc: 0x1234,
                extended_highest_sequence: 0x0001_0400,
                lsr: 7,
                dlsr: 9,
            },
        );
        assert_eq!(buf.len(), 32);

        let blocks = parse_rr(&buf).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].ssrc, 0x1234);
        assert_eq!(blocks[0].highest_sequence, 0x0001_0400);
        assert_eq!(blocks[0].lsr, 7);
        assert_eq!(blocks[0].dlsr, 9);
    }

    #[test]
    fn test_sr_parse_and_length_check() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        buf.put_u8(PT_SR);
        buf.put_u16(6);
        buf.put_u32(0xAA);
        buf.put_u64(NtpTime::from_unix_micros(1_000_000).as_u64());
        buf.put_u32(90_000);
        buf.put_u32(10);
        buf.put_u32(1000);

        let (info, blocks) = parse_sr(&buf).unwrap();
        assert_eq!(info.ssrc, 0xAA);
        assert_eq!(info.rtp_time, 90_000);
        assert_eq!(info.packet_count, 10);
        assert!(blocks.is_empty());

        // Corrupt the length field.
        buf[3] = 9;
        assert!(parse_sr(&buf).is_err());
    }

    #[test]
    fn test_xr_rrtr_shape() {
        let ntp = NtpTime {
            seconds: 100,
            fractions: 0x8000_0000,
        };
        let mut buf = BytesMut::new();
        encode_xr_rrtr(&mut buf, 55, ntp);

        assert_eq!(buf.len(), 20);
        assert_eq!(buf[1], PT_XR);
        assert_eq!(buf[8], XR_BT_RRTR);
        assert_eq!(read_u32(&buf, 12), 100);
        assert_eq!(read_u32(&buf, 16), 0x8000_0000);
    }

    #[test]
    fn test_xr_dlrr_parse() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        buf.put_u8(PT_XR);
        buf.put_u16(5);
        buf.put_u32(1);
        buf.put_u8(XR_BT_DLRR);
        buf.put_u8(0);
        buf.put_u16(3);
        buf.put_u32(42);
        buf.put_u32(0x10);
        buf.put_u32(0x20);

        let entries = parse_xr_dlrr(&buf).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0],
            DlrrEntry {
                ssrc: 42,
                lrr: 0x10,
                dlrr: 0x20
            }
        );
    }

    #[test]
    fn test_rtt_mapping() {
        // compact_now - lrr - dlrr == 0x00010000 -> exactly one second.
        assert_eq!(rtt_millis(0x0003_0000, 0x0001_0000, 0x0001_0000), 1000);
        // Half a second.
        assert_eq!(rtt_millis(0x0000_8000, 0, 0), 500);
    }
}
