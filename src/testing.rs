//! Deterministic test doubles and fixtures shared across module tests

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::bus::PublishStreamOps;
use crate::error::{ErrorKind, Result, RtcError};
use crate::net::SendOnlySocket;
use crate::rtp::{MediaKind, EXT_URI_TWCC};
use crate::sdp::{Direction, MediaDesc, MediaPayloadType, Sdp, SsrcGroup, SsrcInfo};
use crate::server::config::StaticConfig;
use crate::server::env::{ServerEnv, SsrcAllocator, StreamRequest};
use crate::session::connection::{ConnectionState, RtcConnection};
use crate::session::negotiate;
use crate::stun::StunPacket;
use crate::track::description::{CodecAttrs, MediaPayload, StreamDescription, TrackDescription};
use crate::transport::{DtlsCore, DtlsRole, SrtpCore};

/// Trailer the mock SRTP appends to RTP ciphertext
pub const SRTP_RTP_TAG: &[u8; 4] = b"srtp";
/// Trailer the mock SRTP appends to RTCP ciphertext
pub const SRTP_RTCP_TAG: &[u8; 4] = b"srtc";

/// DTLS driver that completes on the first record
pub struct MockDtls {
    role: DtlsRole,
    outbound: Vec<Bytes>,
    done: bool,
}

impl MockDtls {
    pub fn new() -> Self {
        Self {
            role: DtlsRole::Passive,
            outbound: Vec::new(),
            done: false,
        }
    }
}

impl DtlsCore for MockDtls {
    fn initialize(&mut self, role: DtlsRole, _version: &str) -> Result<()> {
        self.role = role;
        Ok(())
    }

    fn start_active_handshake(&mut self) -> Result<()> {
        if self.role == DtlsRole::Active {
            self.outbound.push(Bytes::from_static(b"client-hello"));
        }
        Ok(())
    }

    fn on_handshake(&mut self, _data: &[u8]) -> Result<()> {
        if !self.done {
            self.done = true;
            self.outbound.push(Bytes::from_static(b"final-flight"));
        }
        Ok(())
    }

    fn pull_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn take_srtp(&mut self) -> Result<Box<dyn SrtpCore>> {
        Ok(Box::new(MockSrtp))
    }
}

/// SRTP that appends or verifies a fixed trailer
pub struct MockSrtp;

fn seal(data: &[u8], tag: &[u8; 4]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 4);
    out.extend_from_slice(data);
    out.extend_from_slice(tag);
    out.freeze()
}

fn open(data: &[u8], tag: &[u8; 4], kind: ErrorKind) -> Result<Bytes> {
    if data.len() < 4 || &data[data.len() - 4..] != tag {
        return Err(RtcError::new(kind, "auth tag mismatch"));
    }
    Ok(Bytes::copy_from_slice(&data[..data.len() - 4]))
}

impl SrtpCore for MockSrtp {
    fn protect_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        Ok(seal(plaintext, SRTP_RTP_TAG))
    }

    fn protect_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        Ok(seal(plaintext, SRTP_RTCP_TAG))
    }

    fn unprotect_rtp(&mut self, cipher: &[u8]) -> Result<Bytes> {
        open(cipher, SRTP_RTP_TAG, ErrorKind::SrtpUnprotect)
    }

    fn unprotect_rtcp(&mut self, cipher: &[u8]) -> Result<Bytes> {
        open(cipher, SRTP_RTCP_TAG, ErrorKind::SrtpUnprotect)
    }
}

/// Socket that records every datagram
pub struct MockSocket {
    peer: SocketAddr,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockSocket {
    pub fn new(peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            peer,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SendOnlySocket for MockSocket {
    async fn sendto(&self, data: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn peer_id(&self) -> String {
        self.peer.to_string()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn clone_to_peer(&self, peer: SocketAddr) -> Arc<dyn SendOnlySocket> {
        MockSocket::new(peer)
    }
}

/// Publish-stream stand-in recording keyframe requests
#[derive(Default)]
pub struct MockPublishOps {
    requests: Mutex<Vec<u32>>,
}

impl MockPublishOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<u32> {
        self.requests.lock().unwrap().clone()
    }
}

impl PublishStreamOps for MockPublishOps {
    fn request_keyframe(&self, ssrc: u32) {
        self.requests.lock().unwrap().push(ssrc);
    }
}

/// Config fixture: nack and twcc on, realtime, no gcc
pub fn default_config() -> StaticConfig {
    StaticConfig::default()
}

/// Environment over a local hub with a deterministic SSRC base
pub fn test_env(config: StaticConfig) -> ServerEnv {
    let mut env = ServerEnv::new(
        Arc::new(config),
        Arc::new(crate::bus::LocalHub::new()),
    );
    env.ssrc = Arc::new(SsrcAllocator::with_base(5000));
    env
}

/// Stream fixture
pub fn test_request() -> StreamRequest {
    StreamRequest::new("__defaultVhost__", "live", "cam")
}

/// A publish offer: opus audio (ssrc 800) and H.264 video (ssrc 900,
/// rtx 901) with a TWCC extension on id 3
pub fn publish_offer() -> Sdp {
    let mut audio = MediaDesc::new(MediaKind::Audio);
    audio.mid = "0".to_string();
    audio.port = 9;
    audio.protos = "UDP/TLS/RTP/SAVPF".to_string();
    audio.rtcp_mux = true;
    audio.rtcp_rsize = true;
    audio.direction = Direction::SendOnly;
    audio.payload_types.push(MediaPayloadType {
        payload_type: 111,
        encoding_name: "opus".to_string(),
        clock_rate: 48_000,
        encoding_param: "2".to_string(),
        rtcp_fb: vec!["transport-cc".to_string()],
        format_specific_param: "minptime=10;useinbandfec=1".to_string(),
    });
    audio.ssrc_infos.push(SsrcInfo {
        ssrc: 800,
        cname: "peercname".to_string(),
        msid: "stream0".to_string(),
        msid_tracker: "audio0".to_string(),
    });

    let mut video = MediaDesc::new(MediaKind::Video);
    video.mid = "1".to_string();
    video.port = 9;
    video.protos = "UDP/TLS/RTP/SAVPF".to_string();
    video.rtcp_mux = true;
    video.rtcp_rsize = true;
    video.direction = Direction::SendOnly;
    video.extmaps = BTreeMap::from([(3u8, EXT_URI_TWCC.to_string())]);
    video.payload_types.push(MediaPayloadType {
        payload_type: 102,
        encoding_name: "H264".to_string(),
        clock_rate: 90_000,
        encoding_param: String::new(),
        rtcp_fb: vec![
            "nack".to_string(),
            "nack pli".to_string(),
            "transport-cc".to_string(),
            "goog-remb".to_string(),
        ],
        format_specific_param:
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
    });
    video.payload_types.push(MediaPayloadType {
        payload_type: 103,
        encoding_name: "rtx".to_string(),
        clock_rate: 90_000,
        format_specific_param: "apt=102".to_string(),
        ..Default::default()
    });
    video.ssrc_infos.push(SsrcInfo {
        ssrc: 900,
        cname: "peercname".to_string(),
        msid: "stream0".to_string(),
        msid_tracker: "video0".to_string(),
    });
    video.ssrc_infos.push(SsrcInfo {
        ssrc: 901,
        cname: "peercname".to_string(),
        msid: "stream0".to_string(),
        msid_tracker: "video0".to_string(),
    });
    video.ssrc_groups.push(SsrcGroup {
        semantic: "FID".to_string(),
        ssrcs: vec![900, 901],
    });

    Sdp {
        session_name: "offer".to_string(),
        media_descs: vec![audio, video],
        ..Default::default()
    }
}

/// Negotiate the publish offer and store the description on the source
pub fn seed_published_source(env: &ServerEnv, req: &StreamRequest) {
    let desc = negotiate::negotiate_publish_capability(env, req, &publish_offer()).unwrap();
    let source = env.sources.fetch_or_create(req).unwrap();
    source.set_stream_desc(desc);
}

fn h264_track(id: &str, ssrc: u32) -> TrackDescription {
    let mut track = TrackDescription::new(MediaKind::Video);
    track.id = id.to_string();
    track.msid = "stream0".to_string();
    track.mid = "1".to_string();
    track.ssrc = ssrc;
    track.direction = Direction::RecvOnly;
    track.add_extension(3, EXT_URI_TWCC);
    track.media = Some(MediaPayload::Video {
        attrs: CodecAttrs {
            pt: 102,
            encoding_name: "H264".to_string(),
            clock_rate: 90_000,
            rtcp_fbs: vec![
                "nack".to_string(),
                "nack pli".to_string(),
                "transport-cc".to_string(),
            ],
            format_param: "packetization-mode=1".to_string(),
        },
    });
    track
}

/// Store a description with two merge-group video layers
/// (`cam_small` ssrc 900, `cam_large` ssrc 910) and opus audio (ssrc 800)
pub fn seed_published_source_with_layers(env: &ServerEnv, req: &StreamRequest) {
    let mut desc = StreamDescription::default();

    let mut audio = TrackDescription::new(MediaKind::Audio);
    audio.id = "mic0".to_string();
    audio.msid = "stream0".to_string();
    audio.mid = "0".to_string();
    audio.ssrc = 800;
    audio.direction = Direction::RecvOnly;
    audio.media = Some(MediaPayload::Audio {
        attrs: CodecAttrs {
            pt: 111,
            encoding_name: "opus".to_string(),
            clock_rate: 48_000,
            rtcp_fbs: vec!["transport-cc".to_string()],
            format_param: String::new(),
        },
        channels: 2,
    });
    desc.audio_track = Some(audio);

    desc.video_tracks.push(h264_track("cam_small", 900));
    desc.video_tracks.push(h264_track("cam_large", 910));

    let source = env.sources.fetch_or_create(req).unwrap();
    source.set_stream_desc(desc);
}

/// Transaction id fixture
pub const TXID: [u8; 12] = [9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2];

/// A binding request from the peer
pub fn binding_request() -> StunPacket {
    StunPacket::binding_request("srvfrag", "clifrag", TXID)
}

/// Drive a publisher connection to `Established` over mock crypto
pub async fn established_publisher(
    env: &ServerEnv,
) -> (Arc<RtcConnection>, Arc<MockSocket>) {
    let req = test_request();
    let conn = RtcConnection::new(env.clone(), "pub-conn", Box::new(MockDtls::new()));
    conn.add_publisher(&req, &publish_offer()).unwrap();
    conn.initialize(&req, true, "publisher").unwrap();
    conn.set_state(ConnectionState::WaitingStun);

    let skt = MockSocket::new("1.2.3.4:5000".parse().unwrap());
    let dyn_skt: Arc<dyn SendOnlySocket> = skt.clone();
    conn.on_stun(&dyn_skt, &binding_request()).await.unwrap();
    conn.on_dtls(b"client-flight").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);

    (conn, skt)
}

/// Drive a player connection to `Established`; the source must already
/// carry a stream description
pub async fn established_player(env: &ServerEnv) -> (Arc<RtcConnection>, Arc<MockSocket>) {
    let req = test_request();
    let conn = RtcConnection::new(env.clone(), "play-conn", Box::new(MockDtls::new()));
    conn.add_player(&req, &publish_offer()).unwrap();
    conn.initialize(&req, false, "player").unwrap();
    conn.set_state(ConnectionState::WaitingStun);

    let skt = MockSocket::new("5.6.7.8:7000".parse().unwrap());
    let dyn_skt: Arc<dyn SendOnlySocket> = skt.clone();
    conn.on_stun(&dyn_skt, &binding_request()).await.unwrap();
    conn.on_dtls(b"client-flight").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);

    (conn, skt)
}

/// Wait until the socket has recorded at least `n` datagrams
pub async fn wait_for_sends(skt: &MockSocket, n: usize) {
    for _ in 0..200 {
        if skt.sent_count() >= n {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {} sends, got {}", n, skt.sent_count());
}
