//! Track negotiation records
//!
//! A [`TrackDescription`] is the negotiated shape of one media stream
//! within a session: direction, identifiers, SSRCs, the primary codec and
//! the flat table of auxiliary payloads. Publish negotiation produces
//! recvonly descriptions; play negotiation copies the published ones,
//! flips them to sendonly and assigns fresh local SSRCs.

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result, RtcError};
use crate::rtp::MediaKind;
use crate::sdp::Direction;

/// Attributes shared by every codec payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecAttrs {
    /// Payload type number
    pub pt: u8,
    /// Encoding name
    pub encoding_name: String,
    /// Clock rate
    pub clock_rate: u32,
    /// Permitted `rtcp-fb` entries
    pub rtcp_fbs: Vec<String>,
    /// Format-specific parameters
    pub format_param: String,
}

/// The primary codec of a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPayload {
    /// Opus audio
    Audio {
        /// Common attributes
        attrs: CodecAttrs,
        /// Channel count
        channels: u32,
    },
    /// H.264 video
    Video {
        /// Common attributes
        attrs: CodecAttrs,
    },
}

impl MediaPayload {
    /// Common attributes
    pub fn attrs(&self) -> &CodecAttrs {
        match self {
            MediaPayload::Audio { attrs, .. } => attrs,
            MediaPayload::Video { attrs } => attrs,
        }
    }

    /// Common attributes, mutable
    pub fn attrs_mut(&mut self) -> &mut CodecAttrs {
        match self {
            MediaPayload::Audio { attrs, .. } => attrs,
            MediaPayload::Video { attrs } => attrs,
        }
    }

    /// Payload type number
    pub fn pt(&self) -> u8 {
        self.attrs().pt
    }
}

/// Auxiliary payload families a track may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxKind {
    /// Redundant coding
    Red,
    /// Retransmission
    Rtx,
    /// Generic FEC
    Ulpfec,
    /// Reed-Solomon FEC
    Rsfec,
}

impl AuxKind {
    /// Resolve an encoding name
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("red") {
            Some(AuxKind::Red)
        } else if name.eq_ignore_ascii_case("rtx") {
            Some(AuxKind::Rtx)
        } else if name.eq_ignore_ascii_case("ulpfec") {
            Some(AuxKind::Ulpfec)
        } else if name.eq_ignore_ascii_case("rsfec") {
            Some(AuxKind::Rsfec)
        } else {
            None
        }
    }
}

/// One auxiliary payload entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxPayload {
    /// Payload family
    pub kind: AuxKind,
    /// Payload type number
    pub pt: u8,
    /// Format-specific parameters (e.g. `apt=` for rtx)
    pub format_param: String,
}

/// Negotiated description of one media stream within a session
#[derive(Debug, Clone)]
pub struct TrackDescription {
    /// Media kind
    pub kind: MediaKind,
    /// Direction from our point of view
    pub direction: Direction,
    /// Media section id
    pub mid: String,
    /// Track id within the media stream
    pub id: String,
    /// Media stream id
    pub msid: String,
    /// Primary SSRC
    pub ssrc: u32,
    /// Retransmission SSRC, if negotiated
    pub rtx_ssrc: Option<u32>,
    /// FEC SSRC, if negotiated
    pub fec_ssrc: Option<u32>,
    /// Primary codec
    pub media: Option<MediaPayload>,
    /// Auxiliary payloads
    pub aux: Vec<AuxPayload>,
    /// Header extension map, id to URI
    pub extmaps: BTreeMap<u8, String>,
}

impl TrackDescription {
    /// Create an empty description of the given kind
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            direction: Direction::Inactive,
            mid: String::new(),
            id: String::new(),
            msid: String::new(),
            ssrc: 0,
            rtx_ssrc: None,
            fec_ssrc: None,
            media: None,
            aux: Vec::new(),
            extmaps: BTreeMap::new(),
        }
    }

    /// Whether this track owns the SSRC (primary, rtx or fec)
    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.ssrc == ssrc || self.rtx_ssrc == Some(ssrc) || self.fec_ssrc == Some(ssrc)
    }

    /// The extension id registered for a URI
    pub fn extension_id(&self, uri: &str) -> Option<u8> {
        self.extmaps
            .iter()
            .find(|(_, u)| u.as_str() == uri)
            .map(|(id, _)| *id)
    }

    /// Register a header extension
    pub fn add_extension(&mut self, id: u8, uri: impl Into<String>) {
        self.extmaps.insert(id, uri.into());
    }

    /// Payload type of the primary codec
    pub fn media_pt(&self) -> Option<u8> {
        self.media.as_ref().map(MediaPayload::pt)
    }

    /// The auxiliary entry of a family, if negotiated
    pub fn aux_payload(&self, kind: AuxKind) -> Option<&AuxPayload> {
        self.aux.iter().find(|p| p.kind == kind)
    }

    /// Remove retransmission support (downlink RTX is not offered)
    pub fn drop_rtx(&mut self) {
        self.aux.retain(|p| p.kind != AuxKind::Rtx);
        self.rtx_ssrc = None;
    }

    /// Keep only the rtcp-fb entries the local config permits
    pub fn filter_rtcp_fbs(&mut self, nack_enabled: bool, twcc_enabled: bool) {
        if let Some(media) = &mut self.media {
            media.attrs_mut().rtcp_fbs.retain(|fb| {
                (nack_enabled && (fb == "nack" || fb == "nack pli"))
                    || (twcc_enabled && fb == "transport-cc")
            });
        }
    }

    /// Check the per-track invariants
    pub fn validate(&self) -> Result<()> {
        if let Some(rtx) = self.rtx_ssrc {
            if rtx == self.ssrc {
                return Err(RtcError::new(
                    ErrorKind::StreamDesc,
                    format!("track {} rtx ssrc equals primary {}", self.id, self.ssrc),
                ));
            }
        }
        Ok(())
    }
}

/// The negotiated track set of one published stream
#[derive(Debug, Clone, Default)]
pub struct StreamDescription {
    /// The audio track
    pub audio_track: Option<TrackDescription>,
    /// All video tracks
    pub video_tracks: Vec<TrackDescription>,
}

impl StreamDescription {
    /// All tracks, audio first
    pub fn all_tracks(&self) -> impl Iterator<Item = &TrackDescription> {
        self.audio_track.iter().chain(self.video_tracks.iter())
    }

    /// Find the track owning an SSRC
    pub fn find_track_by_ssrc_mut(&mut self, ssrc: u32) -> Option<&mut TrackDescription> {
        if let Some(audio) = &mut self.audio_track {
            if audio.has_ssrc(ssrc) {
                return Some(audio);
            }
        }
        self.video_tracks.iter_mut().find(|t| t.has_ssrc(ssrc))
    }

    /// Check SSRC uniqueness and per-track invariants
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for track in self.all_tracks() {
            track.validate()?;
            for ssrc in [Some(track.ssrc), track.rtx_ssrc, track.fec_ssrc]
                .into_iter()
                .flatten()
            {
                if !seen.insert(ssrc) {
                    return Err(RtcError::new(
                        ErrorKind::StreamDesc,
                        format!("duplicate ssrc={} in stream description", ssrc),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Requested activity state for one logical track
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Media kind
    pub kind: MediaKind,
    /// Logical track id (label)
    pub label: String,
    /// Whether the track should be sending
    pub active: bool,
}
