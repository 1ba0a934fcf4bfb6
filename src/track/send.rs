//! Per-SSRC egress track
//!
//! Owns the outbound SSRC, rewrites routed packets onto it and keeps a
//! bounded ring of recently sent packets for NACK service.

use super::description::TrackDescription;
use super::ring::PacketRing;
use crate::rtp::{MediaKind, RtpPacket};

/// Cache size for audio tracks
const AUDIO_CACHE: usize = 256;
/// Cache size for video tracks
const VIDEO_CACHE: usize = 1024;

/// One egress track
#[derive(Debug)]
pub struct SendTrack {
    desc: TrackDescription,
    ring: PacketRing,
    active: bool,
}

impl SendTrack {
    /// Create a track from its negotiated description
    pub fn new(desc: TrackDescription) -> Self {
        let capacity = match desc.kind {
            MediaKind::Audio => AUDIO_CACHE,
            MediaKind::Video => VIDEO_CACHE,
        };
        Self {
            desc,
            ring: PacketRing::new(capacity),
            active: false,
        }
    }

    /// The negotiated description
    pub fn desc(&self) -> &TrackDescription {
        &self.desc
    }

    /// Logical track id
    pub fn track_id(&self) -> &str {
        &self.desc.id
    }

    /// Whether the track owns this SSRC
    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.desc.has_ssrc(ssrc)
    }

    /// Whether the track is sending
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Flip the track on or off
    pub fn set_track_status(&mut self, active: bool) {
        if self.active != active {
            tracing::debug!(track = %self.desc.id, active = active, "track status");
        }
        self.active = active;
    }

    /// Rewrite a routed packet onto this track and cache it for NACK
    ///
    /// Returns `None` when the track is inactive; the packet is dropped.
    pub fn prepare(&mut self, mut pkt: RtpPacket) -> Option<RtpPacket> {
        if !self.active {
            return None;
        }

        pkt.header.ssrc = self.desc.ssrc;
        if let Some(pt) = self.desc.media_pt() {
            pkt.header.payload_type = pt;
        }

        self.ring.insert(pkt.clone());
        Some(pkt)
    }

    /// Fetch a cached packet for retransmission
    pub fn fetch_rtp_packet(&self, sequence: u16) -> Option<RtpPacket> {
        self.ring.fetch(sequence)
    }
}
