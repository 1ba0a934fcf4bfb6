//! RTCP feedback codecs: Generic NACK and PLI

use bytes::{BufMut, BytesMut};

use super::{PT_PSFB, PT_RTPFB};
use crate::error::{ErrorKind, Result, RtcError};

/// Common feedback packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackHeader {
    /// Feedback message type
    pub fmt: u8,
    /// RTCP payload type (RTPFB or PSFB)
    pub payload_type: u8,
    /// SSRC of the packet sender
    pub sender_ssrc: u32,
    /// SSRC of the media source the feedback is about
    pub media_ssrc: u32,
}

/// Parse the common feedback header, returning it and the FCI bytes
pub fn parse_fb_header(data: &[u8]) -> Result<(FeedbackHeader, &[u8])> {
    if data.len() < 12 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid feedback packet, {} bytes", data.len()),
        ));
    }

    let header = FeedbackHeader {
        fmt: data[0] & 0x1F,
        payload_type: data[1],
        sender_ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
    };

    Ok((header, &data[12..]))
}

/// Parse the first PID/BLP word of a Generic NACK FCI
pub fn parse_nack_fci(fci: &[u8]) -> Result<(u16, u16)> {
    if fci.len() < 4 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid nack fci, {} bytes", fci.len()),
        ));
    }
    let pid = u16::from_be_bytes([fci[0], fci[1]]);
    let blp = u16::from_be_bytes([fci[2], fci[3]]);
    Ok((pid, blp))
}

/// The set of sequences a PID/BLP word requests
///
/// PID itself, plus `pid + i` for every bit `i - 1` set in the mask,
/// `1 <= i <= 16`.
pub fn nack_sequences(pid: u16, blp: u16) -> Vec<u16> {
    let mut seqs = vec![pid];
    for i in 1..=16u16 {
        if blp & (1 << (i - 1)) != 0 {
            seqs.push(pid.wrapping_add(i));
        }
    }
    seqs
}

/// Batch sorted lost sequences into PID/BLP words
///
/// Consecutive sequences within 16 of the word's PID fold into its mask;
/// anything further starts a new word.
pub fn nack_words(seqs: &[u16]) -> Vec<(u16, u16)> {
    let mut words = Vec::new();
    let mut iter = seqs.iter().copied().peekable();

    while let Some(pid) = iter.next() {
        let mut blp = 0u16;
        while let Some(&next) = iter.peek() {
            let diff = next.wrapping_sub(pid);
            if diff == 0 {
                iter.next();
                continue;
            }
            if diff > 16 {
                break;
            }
            blp |= 1 << (diff - 1);
            iter.next();
        }
        words.push((pid, blp));
    }

    words
}

/// Encode one Generic NACK packet for a single PID/BLP word
pub fn encode_nack(buf: &mut BytesMut, media_ssrc: u32, pid: u16, blp: u16) {
    buf.put_u8(0x81);
    buf.put_u8(PT_RTPFB);
    buf.put_u16(3);
    buf.put_u32(media_ssrc);
    buf.put_u32(media_ssrc);
    buf.put_u16(pid);
    buf.put_u16(blp);
}

/// Encode a PLI requesting a keyframe for the given SSRC
pub fn encode_pli(buf: &mut BytesMut, media_ssrc: u32) {
    buf.put_u8(0x81);
    buf.put_u8(PT_PSFB);
    buf.put_u16(2);
    buf.put_u32(media_ssrc);
    buf.put_u32(media_ssrc);
}
