//! Per-SSRC ingress track
//!
//! Owns the reception SSRC set, keeps the counters behind RR and XR
//! reports, tracks the last sender report for LSR/DLSR, stores the RTT
//! derived from XR-DLRR and detects sequence gaps for NACK emission.

use std::collections::BTreeSet;

use super::description::TrackDescription;
use super::ring::SeqTracker;
use crate::rtcp::report::RrInfo;
use crate::rtcp::{millis_to_ntp_short, NtpTime};
use crate::rtp::RtpPacket;

/// Outstanding-loss bound; older entries are forgotten first
const NACK_MAX_OUTSTANDING: usize = 64;
/// A forward jump beyond this is treated as a stream discontinuity
const NACK_MAX_GAP: u16 = 128;

/// Gap detector feeding receiver-side NACK emission
#[derive(Debug, Default)]
struct NackGenerator {
    expected: Option<u16>,
    missing: BTreeSet<u16>,
}

impl NackGenerator {
    /// Account one sequence; returns sequences newly detected as lost
    fn on_sequence(&mut self, seq: u16) -> Vec<u16> {
        let Some(expected) = self.expected else {
            self.expected = Some(seq.wrapping_add(1));
            return Vec::new();
        };

        let dist = seq.wrapping_sub(expected);
        if dist == 0 {
            self.expected = Some(seq.wrapping_add(1));
            return Vec::new();
        }

        if dist < 0x8000 {
            if dist > NACK_MAX_GAP {
                self.missing.clear();
                self.expected = Some(seq.wrapping_add(1));
                return Vec::new();
            }
            let lost: Vec<u16> = (0..dist).map(|i| expected.wrapping_add(i)).collect();
            for s in &lost {
                self.missing.insert(*s);
            }
            while self.missing.len() > NACK_MAX_OUTSTANDING {
                let oldest = *self.missing.iter().next().unwrap();
                self.missing.remove(&oldest);
            }
            self.expected = Some(seq.wrapping_add(1));
            lost
        } else {
            // Late or retransmitted packet closes its gap.
            self.missing.remove(&seq);
            Vec::new()
        }
    }
}

/// One ingress track
#[derive(Debug)]
pub struct RecvTrack {
    desc: TrackDescription,
    seq: SeqTracker,
    nn_packets: u64,
    nn_bytes: u64,
    last_sr_ntp: Option<NtpTime>,
    last_sr_arrival_us: u64,
    rtt_ms: u64,
    keyframe_requested: bool,
    nack: Option<NackGenerator>,
}

impl RecvTrack {
    /// Create a track; `nack_enabled` arms the gap detector
    pub fn new(desc: TrackDescription, nack_enabled: bool) -> Self {
        Self {
            desc,
            seq: SeqTracker::new(),
            nn_packets: 0,
            nn_bytes: 0,
            last_sr_ntp: None,
            last_sr_arrival_us: 0,
            rtt_ms: 0,
            keyframe_requested: false,
            nack: nack_enabled.then(NackGenerator::default),
        }
    }

    /// The negotiated description
    pub fn desc(&self) -> &TrackDescription {
        &self.desc
    }

    /// Whether the track owns this SSRC
    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.desc.has_ssrc(ssrc)
    }

    /// Account one received packet; returns sequences to NACK
    pub fn on_rtp(&mut self, pkt: &RtpPacket) -> Vec<u16> {
        self.nn_packets += 1;
        self.nn_bytes += pkt.payload_len() as u64;
        self.seq.update(pkt.header.sequence);

        match &mut self.nack {
            Some(nack) => nack.on_sequence(pkt.header.sequence),
            None => Vec::new(),
        }
    }

    /// Store the RTT computed from an XR-DLRR block
    pub fn update_rtt(&mut self, rtt_ms: u64) {
        self.rtt_ms = rtt_ms;
    }

    /// Last known RTT in milliseconds
    pub fn rtt(&self) -> u64 {
        self.rtt_ms
    }

    /// Record the NTP timestamp of a sender report
    pub fn update_send_report_time(&mut self, ntp: NtpTime, arrival_us: u64) {
        self.last_sr_ntp = Some(ntp);
        self.last_sr_arrival_us = arrival_us;
    }

    /// Mark that a keyframe should be solicited for this track
    pub fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    /// Consume a pending keyframe request
    pub fn take_keyframe_request(&mut self) -> bool {
        std::mem::take(&mut self.keyframe_requested)
    }

    /// Packets received so far
    pub fn packets_received(&self) -> u64 {
        self.nn_packets
    }

    /// The report block inputs for the next RR
    pub fn rr_info(&self, now_us: u64) -> RrInfo {
        let (lsr, dlsr) = match self.last_sr_ntp {
            Some(ntp) if self.last_sr_arrival_us > 0 => {
                let delay_ms = now_us.saturating_sub(self.last_sr_arrival_us) / 1000;
                (ntp.compact(), millis_to_ntp_short(delay_ms))
            }
            _ => (0, 0),
        };

        RrInfo {
            ssrc: self.desc.ssrc,
            extended_highest_sequence: self.seq.extended_highest(),
            lsr,
            dlsr,
        }
    }
}
