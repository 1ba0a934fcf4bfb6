//! Transport-wide congestion control feedback
//!
//! Receive-side accounting for the publish path: every ingest packet with a
//! TWCC sequence number is recorded (including packets that later fail
//! SRTP), and a feedback packet (PT=205, FMT=15) is emitted periodically
//! with a monotonically increasing feedback count.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use super::{PT_RTPFB, RTPFB_FMT_TWCC};
use crate::error::{ErrorKind, Result, RtcError};

/// Delta resolution of the feedback format, microseconds
const DELTA_UNIT_US: i64 = 250;
/// Reference time resolution, microseconds
const REF_UNIT_US: u64 = 64_000;
/// Largest sequence span one feedback packet covers
const MAX_STATUS_COUNT: usize = 0x7FFF;

/// Two-bit packet status symbols
const SYMBOL_NOT_RECEIVED: u16 = 0;
const SYMBOL_SMALL_DELTA: u16 = 1;
const SYMBOL_LARGE_DELTA: u16 = 2;

/// Receive-side TWCC accounting for one session
#[derive(Debug, Default)]
pub struct TwccReceiver {
    media_ssrc: u32,
    pending: BTreeMap<u16, u64>,
    fb_count: u8,
}

impl TwccReceiver {
    /// Create an empty receiver
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the media SSRC written into feedback packets
    pub fn set_media_ssrc(&mut self, ssrc: u32) {
        self.media_ssrc = ssrc;
    }

    /// Record the arrival of a transport-wide sequence number
    ///
    /// Duplicates (ARQ replies) keep their first arrival time.
    pub fn on_received(&mut self, sn: u16, arrival_us: u64) {
        self.pending.entry(sn).or_insert(arrival_us);
    }

    /// Whether any received-sequence deltas are queued
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The next feedback count to be emitted
    pub fn feedback_count(&self) -> u8 {
        self.fb_count
    }

    /// Encode one feedback packet from the queued arrivals and clear them
    pub fn encode_feedback(&mut self, buf: &mut BytesMut) -> Result<()> {
        if self.pending.is_empty() {
            return Err(RtcError::new(ErrorKind::Rtcp, "no twcc deltas pending"));
        }

        let received = self.take_ordered();
        let base_sn = received[0].0;
        let last_sn = received[received.len() - 1].0;
        let status_count = last_sn.wrapping_sub(base_sn) as usize + 1;
        if status_count > MAX_STATUS_COUNT {
            return Err(RtcError::new(
                ErrorKind::Rtcp,
                format!("twcc span {} too large", status_count),
            ));
        }

        let ref_units = received[0].1 / REF_UNIT_US;
        let mut prev_us = (ref_units * REF_UNIT_US) as i64;

        // Walk the sequence range once, producing a status symbol per
        // sequence and a delta per received packet.
        let mut symbols = Vec::with_capacity(status_count);
        let mut deltas: Vec<i64> = Vec::with_capacity(received.len());
        let mut idx = 0usize;
        for offset in 0..status_count {
            let sn = base_sn.wrapping_add(offset as u16);
            if idx < received.len() && received[idx].0 == sn {
                let arrival = received[idx].1 as i64;
                idx += 1;
                let units = (arrival - prev_us + DELTA_UNIT_US / 2) / DELTA_UNIT_US;
                let units = units.clamp(i16::MIN as i64, i16::MAX as i64);
                prev_us += units * DELTA_UNIT_US;
                if (0..=255).contains(&units) {
                    symbols.push(SYMBOL_SMALL_DELTA);
                } else {
                    symbols.push(SYMBOL_LARGE_DELTA);
                }
                deltas.push(units);
            } else {
                symbols.push(SYMBOL_NOT_RECEIVED);
            }
        }

        let start = buf.len();
        buf.put_u8(0x80 | RTPFB_FMT_TWCC);
        buf.put_u8(PT_RTPFB);
        buf.put_u16(0); // patched below
        buf.put_u32(self.media_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_u16(base_sn);
        buf.put_u16(status_count as u16);
        buf.put_uint(ref_units & 0xFF_FFFF, 3);
        buf.put_u8(self.fb_count);

        // Two-bit status vector chunks, seven symbols per chunk.
        for chunk in symbols.chunks(7) {
            let mut word = 0xC000u16;
            for (i, symbol) in chunk.iter().enumerate() {
                word |= symbol << (12 - 2 * i);
            }
            buf.put_u16(word);
        }

        let mut delta_idx = 0usize;
        for symbol in &symbols {
            match *symbol {
                SYMBOL_SMALL_DELTA => {
                    buf.put_u8(deltas[delta_idx] as u8);
                    delta_idx += 1;
                }
                SYMBOL_LARGE_DELTA => {
                    buf.put_i16(deltas[delta_idx] as i16);
                    delta_idx += 1;
                }
                _ => {}
            }
        }

        // Pad to a word boundary; the pad count lands in the last byte.
        let unpadded = buf.len() - start;
        let pad = (4 - unpadded % 4) % 4;
        if pad > 0 {
            for _ in 0..pad - 1 {
                buf.put_u8(0);
            }
            buf.put_u8(pad as u8);
            buf[start] |= 0x20;
        }

        let words = ((buf.len() - start) / 4 - 1) as u16;
        buf[start + 2] = (words >> 8) as u8;
        buf[start + 3] = words as u8;

        self.fb_count = self.fb_count.wrapping_add(1);
        Ok(())
    }

    /// Drain pending arrivals in wrap-aware sequence order
    fn take_ordered(&mut self) -> Vec<(u16, u64)> {
        let pending = std::mem::take(&mut self.pending);
        let mut items: Vec<(u16, u64)> = pending.into_iter().collect();

        let spread = items[items.len() - 1].0.wrapping_sub(items[0].0);
        if items.len() > 1 && spread > 0x8000 {
            // The window straddles the wrap point; high sequences come first.
            items.sort_by_key(|(sn, _)| if *sn >= 0x8000 { *sn as u32 } else { *sn as u32 + 0x10000 });
        }
        items
    }
}

/// Summary fields parsed from a TWCC feedback header, enough for the
/// egress congestion controller to account the report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSummary {
    /// SSRC of the media source the report covers
    pub media_ssrc: u32,
    /// First sequence covered
    pub base_sn: u16,
    /// Number of sequence statuses
    pub status_count: u16,
    /// Reference time in 64 ms units
    pub reference_time: u32,
    /// Feedback packet count
    pub fb_count: u8,
}

/// Parse the fixed part of a TWCC feedback packet
pub fn parse_feedback_summary(data: &[u8]) -> Result<FeedbackSummary> {
    if data.len() < 20 {
        return Err(RtcError::new(
            ErrorKind::RtcpCheck,
            format!("invalid twcc feedback, {} bytes", data.len()),
        ));
    }
    if data[0] & 0x1F != RTPFB_FMT_TWCC || data[1] != PT_RTPFB {
        return Err(RtcError::new(ErrorKind::RtcpCheck, "not twcc feedback"));
    }

    Ok(FeedbackSummary {
        media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        base_sn: u16::from_be_bytes([data[12], data[13]]),
        status_count: u16::from_be_bytes([data[14], data[15]]),
        reference_time: u32::from_be_bytes([0, data[16], data[17], data[18]]),
        fb_count: data[19],
    })
}
