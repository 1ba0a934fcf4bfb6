//! SDP session model
//!
//! Text parsing and serialization live outside the core; the negotiator
//! works on this structured model of an already-parsed session description
//! and produces the answer in the same shape.

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result, RtcError};
use crate::rtp::MediaKind;

/// Media direction of one section or track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We only receive
    RecvOnly,
    /// We only send
    SendOnly,
    /// Both directions
    SendRecv,
    /// Neither direction
    Inactive,
}

impl Direction {
    /// SDP attribute name
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::RecvOnly => "recvonly",
            Direction::SendOnly => "sendonly",
            Direction::SendRecv => "sendrecv",
            Direction::Inactive => "inactive",
        }
    }
}

/// DTLS setup parameters carried at session level
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Our DTLS role, `active` or `passive`
    pub dtls_role: String,
    /// DTLS version constraint, `auto` unless pinned
    pub dtls_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dtls_role: "passive".to_string(),
            dtls_version: "auto".to_string(),
        }
    }
}

/// One `a=rtpmap` payload with its format and feedback attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaPayloadType {
    /// Payload type number
    pub payload_type: u8,
    /// Encoding name, e.g. `opus` or `H264`
    pub encoding_name: String,
    /// Clock rate
    pub clock_rate: u32,
    /// Encoding parameter (channel count for audio)
    pub encoding_param: String,
    /// `a=rtcp-fb` entries
    pub rtcp_fb: Vec<String>,
    /// `a=fmtp` value
    pub format_specific_param: String,
}

/// One `a=ssrc` description line group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcInfo {
    /// The SSRC
    pub ssrc: u32,
    /// Canonical name
    pub cname: String,
    /// Media stream id
    pub msid: String,
    /// Track id within the media stream
    pub msid_tracker: String,
}

/// One `a=ssrc-group` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcGroup {
    /// Group semantic, `FID` or `FEC`
    pub semantic: String,
    /// Member SSRCs, primary first
    pub ssrcs: Vec<u32>,
}

/// One `m=` section
#[derive(Debug, Clone)]
pub struct MediaDesc {
    /// Media kind
    pub kind: MediaKind,
    /// Port (9 for bundled media)
    pub port: u16,
    /// Transport protocols
    pub protos: String,
    /// `a=rtcp-mux`
    pub rtcp_mux: bool,
    /// `a=rtcp-rsize`
    pub rtcp_rsize: bool,
    /// `a=mid`
    pub mid: String,
    /// Direction
    pub direction: Direction,
    /// Header extension map, id to URI
    pub extmaps: BTreeMap<u8, String>,
    /// Payload types
    pub payload_types: Vec<MediaPayloadType>,
    /// SSRC descriptions
    pub ssrc_infos: Vec<SsrcInfo>,
    /// SSRC groups
    pub ssrc_groups: Vec<SsrcGroup>,
}

impl MediaDesc {
    /// Create an empty section of the given kind
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            port: 0,
            protos: String::new(),
            rtcp_mux: false,
            rtcp_rsize: false,
            mid: String::new(),
            direction: Direction::Inactive,
            extmaps: BTreeMap::new(),
            payload_types: Vec::new(),
            ssrc_infos: Vec::new(),
            ssrc_groups: Vec::new(),
        }
    }

    /// Whether this is an audio section
    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    /// Whether this is a video section
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Payloads whose encoding name matches, case-insensitively
    pub fn find_media_with_encoding_name(&self, name: &str) -> Vec<&MediaPayloadType> {
        self.payload_types
            .iter()
            .filter(|pt| pt.encoding_name.eq_ignore_ascii_case(name))
            .collect()
    }

    /// The extmap id registered for a URI, if any
    pub fn extmap_id(&self, uri: &str) -> Option<u8> {
        self.extmaps
            .iter()
            .find(|(_, u)| u.as_str() == uri)
            .map(|(id, _)| *id)
    }
}

/// A full session description
#[derive(Debug, Clone)]
pub struct Sdp {
    /// Protocol version, `0`
    pub version: String,
    /// Origin username
    pub username: String,
    /// Origin session id
    pub session_id: String,
    /// Origin session version
    pub session_version: String,
    /// Origin network type
    pub nettype: String,
    /// Origin address type
    pub addrtype: String,
    /// Origin unicast address
    pub unicast_address: String,
    /// Session name
    pub session_name: String,
    /// `a=msid-semantic` token
    pub msid_semantic: String,
    /// Media stream ids
    pub msids: Vec<String>,
    /// Group policy, `BUNDLE`
    pub group_policy: String,
    /// Bundled mids
    pub groups: Vec<String>,
    /// ICE username fragment
    pub ice_ufrag: String,
    /// ICE password
    pub ice_pwd: String,
    /// DTLS setup
    pub session_config: SessionConfig,
    /// Media sections
    pub media_descs: Vec<MediaDesc>,
}

impl Default for Sdp {
    fn default() -> Self {
        Self {
            version: "0".to_string(),
            username: String::new(),
            session_id: String::new(),
            session_version: "2".to_string(),
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            unicast_address: "0.0.0.0".to_string(),
            session_name: String::new(),
            msid_semantic: String::new(),
            msids: Vec::new(),
            group_policy: String::new(),
            groups: Vec::new(),
            ice_ufrag: String::new(),
            ice_pwd: String::new(),
            session_config: SessionConfig::default(),
            media_descs: Vec::new(),
        }
    }
}

impl Sdp {
    /// The local ICE password used to key STUN MESSAGE-INTEGRITY
    pub fn ice_pwd(&self) -> &str {
        &self.ice_pwd
    }
}

/// The H.264 fmtp parameters negotiation cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H264SpecificParam {
    /// `profile-level-id`
    pub profile_level_id: String,
    /// `packetization-mode`
    pub packetization_mode: String,
    /// `level-asymmetry-allowed`
    pub level_asymmetry_allowed: String,
}

/// Parse an H.264 `a=fmtp` value of `key=value` pairs separated by `;`
pub fn parse_h264_fmtp(fmtp: &str) -> Result<H264SpecificParam> {
    let mut param = H264SpecificParam::default();
    let mut matched = false;

    for entry in fmtp.split(';') {
        let entry = entry.trim();
        let mut kv = entry.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");
        match key {
            "profile-level-id" => {
                param.profile_level_id = value.to_string();
                matched = true;
            }
            "packetization-mode" => {
                param.packetization_mode = value.to_string();
                matched = true;
            }
            "level-asymmetry-allowed" => {
                param.level_asymmetry_allowed = value.to_string();
                matched = true;
            }
            _ => {}
        }
    }

    if !matched {
        return Err(RtcError::new(
            ErrorKind::SdpExchange,
            format!("no recognized h264 fmtp param in '{}'", fmtp),
        ));
    }
    Ok(param)
}
