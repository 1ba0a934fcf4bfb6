//! Egress congestion controller facade
//!
//! Bandwidth estimation itself lives outside the core; what the data plane
//! owes the controller is exact accounting: a fresh transport-wide sequence
//! per outbound packet (assigned before encoding), a pre-send registration
//! carrying the wire size, a post-send timestamp, and the inbound feedback
//! packets the peer returns.

use std::collections::{HashMap, VecDeque};

use crate::error::Result;
use crate::rtcp::twcc::parse_feedback_summary;

/// Bound on the pre-send table
const PRE_SEND_CAP: usize = 2048;

/// Accounting record for one outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreSendRecord {
    /// SSRC the packet was sent on
    pub ssrc: u32,
    /// RTP sequence number
    pub rtp_sequence: u16,
    /// Encoded wire size before encryption
    pub size: usize,
    /// Post-send timestamp, unix microseconds
    pub sent_at_us: Option<u64>,
}

/// Per-connection TWCC sequence allocator and send table
#[derive(Debug)]
pub struct GccController {
    twcc_id: u8,
    next_sn: u16,
    records: HashMap<u16, PreSendRecord>,
    order: VecDeque<u16>,
    nn_feedback: u64,
}

impl GccController {
    /// Create a controller bound to the negotiated extension id
    pub fn new(twcc_id: u8) -> Self {
        Self {
            twcc_id,
            next_sn: 0,
            records: HashMap::new(),
            order: VecDeque::new(),
            nn_feedback: 0,
        }
    }

    /// The negotiated TWCC extension id
    pub fn twcc_id(&self) -> u8 {
        self.twcc_id
    }

    /// Allocate the next transport-wide sequence number
    ///
    /// Strictly increasing per connection (modulo the 16-bit wrap).
    pub fn allocate_sn(&mut self) -> u16 {
        let sn = self.next_sn;
        self.next_sn = self.next_sn.wrapping_add(1);
        sn
    }

    /// Register a packet after encoding, before encryption and transmit
    pub fn on_pre_send(&mut self, ssrc: u32, rtp_sequence: u16, twcc_sn: u16, size: usize) {
        if self.order.len() >= PRE_SEND_CAP {
            if let Some(old) = self.order.pop_front() {
                self.records.remove(&old);
            }
        }
        self.order.push_back(twcc_sn);
        self.records.insert(
            twcc_sn,
            PreSendRecord {
                ssrc,
                rtp_sequence,
                size,
                sent_at_us: None,
            },
        );
    }

    /// Mark a packet as written to the socket
    pub fn on_sent(&mut self, twcc_sn: u16, now_us: u64) {
        if let Some(record) = self.records.get_mut(&twcc_sn) {
            record.sent_at_us = Some(now_us);
        }
    }

    /// Account one inbound TWCC feedback packet
    pub fn on_feedback(&mut self, data: &[u8]) -> Result<()> {
        let summary = parse_feedback_summary(data)?;
        self.nn_feedback += 1;
        tracing::debug!(
            base_sn = summary.base_sn,
            count = summary.status_count,
            fb_count = summary.fb_count,
            "twcc feedback"
        );
        Ok(())
    }

    /// Number of feedback packets accounted so far
    pub fn feedback_packets(&self) -> u64 {
        self.nn_feedback
    }

    /// Look up the accounting record of a sequence
    pub fn record(&self, twcc_sn: u16) -> Option<&PreSendRecord> {
        self.records.get(&twcc_sn)
    }
}
