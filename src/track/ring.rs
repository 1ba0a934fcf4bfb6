//! Bounded packet cache and sequence tracking

use crate::rtp::RtpPacket;

/// Ring of recently sent packets keyed by sequence number, serving NACK
/// retransmission requests
///
/// Insertion silently evicts whatever occupied the slot; a fetch for an
/// evicted sequence simply yields nothing.
#[derive(Debug)]
pub struct PacketRing {
    slots: Vec<Option<RtpPacket>>,
}

impl PacketRing {
    /// Create a ring with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
        }
    }

    /// Cache a packet under its sequence number
    pub fn insert(&mut self, pkt: RtpPacket) {
        let at = pkt.header.sequence as usize % self.slots.len();
        self.slots[at] = Some(pkt);
    }

    /// Fetch a cached packet by sequence number
    pub fn fetch(&self, sequence: u16) -> Option<RtpPacket> {
        let at = sequence as usize % self.slots.len();
        self.slots[at]
            .as_ref()
            .filter(|pkt| pkt.header.sequence == sequence)
            .cloned()
    }
}

/// Tracks the extended highest sequence of one reception SSRC
#[derive(Debug, Default)]
pub struct SeqTracker {
    started: bool,
    highest: u16,
    cycles: u16,
}

impl SeqTracker {
    /// Create an idle tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one received sequence number
    pub fn update(&mut self, sequence: u16) {
        if !self.started {
            self.started = true;
            self.highest = sequence;
            return;
        }

        let forward = sequence.wrapping_sub(self.highest);
        if forward != 0 && forward < 0x8000 {
            if sequence < self.highest {
                self.cycles = self.cycles.wrapping_add(1);
            }
            self.highest = sequence;
        }
    }

    /// Extended highest sequence: cycle count in the upper 16 bits
    pub fn extended_highest(&self) -> u32 {
        ((self.cycles as u32) << 16) | self.highest as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{MediaKind, RtpHeader, RtpPayload};
    use bytes::Bytes;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::new(
            RtpHeader {
                sequence: seq,
                ssrc: 1,
                ..Default::default()
            },
            MediaKind::Video,
            RtpPayload::Raw(Bytes::from_static(&[0x41])),
        )
    }

    #[test]
    fn test_ring_fetch_hit_and_miss() {
        let mut ring = PacketRing::new(8);
        for seq in [42u16, 43, 44, 45] {
            ring.insert(packet(seq));
        }

        assert_eq!(ring.fetch(42).unwrap().header.sequence, 42);
        assert_eq!(ring.fetch(45).unwrap().header.sequence, 45);
        assert!(ring.fetch(46).is_none());
    }

    #[test]
    fn test_ring_eviction_is_silent() {
        let mut ring = PacketRing::new(4);
        ring.insert(packet(0));
        // Sequence 4 lands in the same slot and evicts 0.
        ring.insert(packet(4));

        assert!(ring.fetch(0).is_none());
        assert_eq!(ring.fetch(4).unwrap().header.sequence, 4);
    }

    #[test]
    fn test_seq_tracker_wrap() {
        let mut tracker = SeqTracker::new();
        tracker.update(65_533);
        tracker.update(65_535);
        assert_eq!(tracker.extended_highest(), 65_535);

        tracker.update(1);
        assert_eq!(tracker.extended_highest(), 0x0001_0001);

        // An old duplicate does not move the high-water mark.
        tracker.update(65_534);
        assert_eq!(tracker.extended_highest(), 0x0001_0001);
    }
}
