//! The per-connection session root
//!
//! One connection terminates ICE-lite/DTLS/SRTP with a remote peer and
//! routes the data plane: STUN binding requests stamp liveness and drive
//! address migration, DTLS records pump the security transport, RTP goes
//! to the publisher, RTCP is unprotected here and routed to whichever
//! stream the session runs. The state machine is strictly monotonic:
//! `Init -> WaitingStun -> DoingDtls -> Established -> Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::negotiate;
use super::play::RtcPlayStream;
use super::publish::RtcPublishStream;
use super::stats::{bump, bump_by, ConnectionStats};
use crate::bus::Source;
use crate::error::{ErrorKind, Result, RtcError};
use crate::gcc::GccController;
use crate::net::SendOnlySocket;
use crate::rtcp::report::RrInfo;
use crate::rtcp::{
    encode_nack, encode_pli, encode_rr, encode_xr_rrtr, nack_words, unix_micros_now, NtpTime,
};
use crate::rtp::{RtpPacket, RTP_PACKET_MAX};
use crate::sdp::Sdp;
use crate::server::env::{ServerEnv, StreamRequest};
use crate::stun::StunPacket;
use crate::track::description::{StreamDescription, TrackConfig, TrackDescription};
use crate::transport::{DtlsCore, DtlsRole, SecurityTransport};

/// Connection lifecycle states, in transition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Created, answer not yet sent
    Init,
    /// Answer sent, waiting for the first binding request
    WaitingStun,
    /// Binding request seen, DTLS handshake in progress
    DoingDtls,
    /// DTLS done, data plane live
    Established,
    /// Torn down
    Closed,
}

/// Byte and packet counts of one send batch
#[derive(Debug, Default, Clone, Copy)]
pub struct SendSummary {
    /// Packets written (or dropped by the simulator)
    pub nn_packets: u64,
    /// Bytes on the wire
    pub nn_bytes: u64,
}

#[derive(Default)]
struct ConnInner {
    req: Option<StreamRequest>,
    username: String,
    is_publisher: bool,
    peer_id: String,
    last_stun_time: Option<Instant>,
    session_timeout: Duration,
    local_sdp: Option<Sdp>,
    remote_sdp: Option<Sdp>,
}

/// One server-side WebRTC session
///
/// Field order matters for teardown: the streams are declared (and so
/// dropped) before the transport their send paths go through.
pub struct RtcConnection {
    cid: String,
    env: ServerEnv,
    encrypt: AtomicBool,
    stats: ConnectionStats,
    state: Mutex<ConnectionState>,
    inner: Mutex<ConnInner>,
    player: Mutex<Option<Arc<RtcPlayStream>>>,
    publisher: Mutex<Option<Arc<RtcPublishStream>>>,
    transport: Mutex<SecurityTransport>,
    source: Mutex<Option<Arc<dyn Source>>>,
    sendonly_skt: Mutex<Option<Arc<dyn SendOnlySocket>>>,
    gcc: Mutex<Option<GccController>>,
    simulate_player_drop: AtomicI32,
}

impl RtcConnection {
    /// Create a connection over the server environment and an external
    /// DTLS driver
    pub fn new(env: ServerEnv, cid: impl Into<String>, dtls: Box<dyn DtlsCore>) -> Arc<Self> {
        Arc::new(Self {
            cid: cid.into(),
            env,
            encrypt: AtomicBool::new(true),
            stats: ConnectionStats::new(),
            state: Mutex::new(ConnectionState::Init),
            inner: Mutex::new(ConnInner::default()),
            player: Mutex::new(None),
            publisher: Mutex::new(None),
            transport: Mutex::new(SecurityTransport::new(dtls)),
            source: Mutex::new(None),
            sendonly_skt: Mutex::new(None),
            gcc: Mutex::new(None),
            simulate_player_drop: AtomicI32::new(0),
        })
    }

    /// Stable context id
    pub fn context_id(&self) -> &str {
        &self.cid
    }

    /// Session id: peer plus username
    pub fn id(&self) -> String {
        let inner = self.inner.lock().unwrap();
        format!("{}/{}", inner.peer_id, inner.username)
    }

    /// Current peer id
    pub fn peer_id(&self) -> String {
        self.inner.lock().unwrap().peer_id.clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Advance the state machine
    ///
    /// Transitions are monotonic; an attempted regression is refused.
    pub fn set_state(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if next <= *state {
            tracing::warn!(from = ?*state, to = ?next, "refusing state regression");
            return false;
        }
        tracing::debug!(from = ?*state, to = ?next, "state");
        *state = next;
        true
    }

    /// Toggle SRTP encryption of outbound RTP (diagnostics only)
    pub fn set_encrypt(&self, encrypt: bool) {
        self.encrypt.store(encrypt, Ordering::SeqCst);
    }

    /// The counter bag
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// The bus source this session is bound to
    pub fn source(&self) -> Option<Arc<dyn Source>> {
        self.source.lock().unwrap().clone()
    }

    /// The active publisher
    pub fn publisher(&self) -> Option<Arc<RtcPublishStream>> {
        self.publisher.lock().unwrap().clone()
    }

    /// The active player
    pub fn player(&self) -> Option<Arc<RtcPlayStream>> {
        self.player.lock().unwrap().clone()
    }

    /// Local SDP, once negotiated
    pub fn local_sdp(&self) -> Option<Sdp> {
        self.inner.lock().unwrap().local_sdp.clone()
    }

    /// Remote SDP, once stored
    pub fn remote_sdp(&self) -> Option<Sdp> {
        self.inner.lock().unwrap().remote_sdp.clone()
    }

    /// Negotiate a publish offer and create the publisher
    ///
    /// Returns the local answer.
    pub fn add_publisher(self: &Arc<Self>, req: &StreamRequest, remote_sdp: &Sdp) -> Result<Sdp> {
        let stream_desc = negotiate::negotiate_publish_capability(&self.env, req, remote_sdp)
            .map_err(|e| e.wrap("publish negotiate"))?;
        let local_sdp = negotiate::generate_publish_local_sdp(req, &stream_desc)
            .map_err(|e| e.wrap("generate local sdp"))?;

        let source = self
            .env
            .sources
            .fetch_or_create(req)
            .map_err(|e| e.wrap("create source"))?;
        source.set_stream_desc(stream_desc.clone());

        self.create_publisher(req, &stream_desc)
            .map_err(|e| e.wrap("create publish"))?;

        let mut inner = self.inner.lock().unwrap();
        inner.remote_sdp = Some(remote_sdp.clone());
        inner.local_sdp = Some(local_sdp.clone());
        drop(inner);
        *self.source.lock().unwrap() = Some(source);

        Ok(local_sdp)
    }

    /// Negotiate a play offer and create the player
    pub fn add_player(self: &Arc<Self>, req: &StreamRequest, remote_sdp: &Sdp) -> Result<Sdp> {
        let sub_relations = negotiate::negotiate_play_capability(&self.env, req, remote_sdp)
            .map_err(|e| e.wrap("play negotiate"))?;
        if sub_relations.is_empty() {
            return Err(RtcError::new(ErrorKind::SdpExchange, "no play relations"));
        }

        let local_sdp = self.build_player(req, sub_relations)?;
        self.inner.lock().unwrap().remote_sdp = Some(remote_sdp.clone());
        Ok(local_sdp)
    }

    /// Create a player purely from the source's published capability
    pub fn add_player_from_source(self: &Arc<Self>, req: &StreamRequest) -> Result<Sdp> {
        let sub_relations = negotiate::fetch_source_capability(&self.env, req)
            .map_err(|e| e.wrap("play negotiate"))?;
        if sub_relations.is_empty() {
            return Err(RtcError::new(ErrorKind::SdpExchange, "no play relations"));
        }

        self.build_player(req, sub_relations)
    }

    fn build_player(
        self: &Arc<Self>,
        req: &StreamRequest,
        sub_relations: HashMap<u32, TrackDescription>,
    ) -> Result<Sdp> {
        let mut stream_desc = StreamDescription::default();
        for track in sub_relations.values() {
            match track.kind {
                crate::rtp::MediaKind::Audio => {
                    if stream_desc.audio_track.is_none() {
                        stream_desc.audio_track = Some(track.clone());
                    }
                }
                crate::rtp::MediaKind::Video => stream_desc.video_tracks.push(track.clone()),
            }
        }

        let local_sdp = negotiate::generate_play_local_sdp(&self.env, req, &stream_desc)
            .map_err(|e| e.wrap("generate local sdp"))?;

        self.create_player(req, sub_relations)
            .map_err(|e| e.wrap("create player"))?;

        let source = self
            .env
            .sources
            .fetch_or_create(req)
            .map_err(|e| e.wrap("fetch rtc source"))?;

        let mut inner = self.inner.lock().unwrap();
        inner.local_sdp = Some(local_sdp.clone());
        drop(inner);
        *self.source.lock().unwrap() = Some(source);

        Ok(local_sdp)
    }

    fn create_publisher(
        self: &Arc<Self>,
        req: &StreamRequest,
        stream_desc: &StreamDescription,
    ) -> Result<()> {
        let mut publisher = self.publisher.lock().unwrap();
        if publisher.is_some() {
            return Ok(());
        }

        *publisher = Some(RtcPublishStream::new(
            Arc::downgrade(self),
            self.env.clone(),
            req.clone(),
            stream_desc,
        ));
        bump(&self.stats.nn_publishers);
        Ok(())
    }

    fn create_player(
        self: &Arc<Self>,
        req: &StreamRequest,
        sub_relations: HashMap<u32, TrackDescription>,
    ) -> Result<()> {
        let mut player = self.player.lock().unwrap();
        if player.is_some() {
            return Ok(());
        }

        // The TWCC id is the ext-map id in the local answer; the
        // controller is installed only when GCC is enabled by config.
        let twcc_id = negotiate::play_twcc_id(&sub_relations);
        let gcc_enabled = self.env.config.gcc_enabled(&req.vhost);
        if gcc_enabled {
            if let Some(id) = twcc_id {
                *self.gcc.lock().unwrap() = Some(GccController::new(id));
            }
        }
        tracing::info!(gcc = gcc_enabled, twcc_id = ?twcc_id, "connection player");

        *player = Some(RtcPlayStream::new(
            Arc::downgrade(self),
            self.env.clone(),
            req.clone(),
            sub_relations,
        ));
        bump(&self.stats.nn_subscribers);
        Ok(())
    }

    /// Bind the session to its request and configure the transport
    pub fn initialize(
        &self,
        req: &StreamRequest,
        is_publisher: bool,
        username: impl Into<String>,
    ) -> Result<()> {
        let session_timeout = self.env.config.stun_timeout(&req.vhost);

        let (role, version) = {
            let inner = self.inner.lock().unwrap();
            let config = inner
                .local_sdp
                .as_ref()
                .map(|sdp| sdp.session_config.clone())
                .unwrap_or_default();
            (DtlsRole::from_setup(&config.dtls_role), config.dtls_version)
        };
        self.transport
            .lock()
            .unwrap()
            .initialize(role, &version)
            .map_err(|e| e.wrap("init"))?;

        let mut inner = self.inner.lock().unwrap();
        inner.req = Some(req.clone());
        inner.username = username.into();
        inner.is_publisher = is_publisher;
        inner.session_timeout = session_timeout;
        inner.last_stun_time = Some(Instant::now());
        drop(inner);

        tracing::info!(
            session = %self.cid,
            role = ?role,
            timeout_ms = session_timeout.as_millis() as u64,
            "session initialized"
        );
        Ok(())
    }

    /// Whether the STUN inactivity budget has run out
    pub fn is_stun_timeout(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.last_stun_time {
            Some(last) => last.elapsed() > inner.session_timeout,
            None => false,
        }
    }

    /// Handle one STUN packet from the demultiplexer
    ///
    /// Only binding requests are accepted. Stamps liveness, migrates the
    /// send path when the peer address changed, answers with a
    /// BindingResponse and kicks DTLS on the first request.
    pub async fn on_stun(
        self: &Arc<Self>,
        skt: &Arc<dyn SendOnlySocket>,
        packet: &StunPacket,
    ) -> Result<()> {
        if !packet.is_binding_request() {
            return Ok(());
        }

        self.inner.lock().unwrap().last_stun_time = Some(Instant::now());

        // ice-lite: the peer picks the candidate pair; we follow its
        // source address.
        let needs_update = {
            let inner = self.inner.lock().unwrap();
            let has_socket = self.sendonly_skt.lock().unwrap().is_some();
            !has_socket || inner.peer_id != skt.peer_id()
        };
        if needs_update {
            self.update_sendonly_socket(skt);
        }

        self.on_binding_request(packet)
            .await
            .map_err(|e| e.wrap("stun binding request failed"))
    }

    async fn on_binding_request(self: &Arc<Self>, packet: &StunPacket) -> Result<()> {
        let (vhost, pwd) = {
            let inner = self.inner.lock().unwrap();
            let vhost = inner
                .req
                .as_ref()
                .map(|r| r.vhost.clone())
                .unwrap_or_default();
            let pwd = inner
                .local_sdp
                .as_ref()
                .map(|sdp| sdp.ice_pwd().to_string())
                .unwrap_or_default();
            (vhost, pwd)
        };

        if self.env.config.stun_strict_check(&vhost) && packet.ice_controlled {
            return Err(RtcError::new(
                ErrorKind::Stun,
                "peer must not be in ice-controlled role in ice-lite mode",
            ));
        }

        let skt = self.current_socket()?;
        let response = StunPacket::binding_response(packet, skt.peer_addr());

        let mut buf = BytesMut::with_capacity(128);
        response
            .encode(&pwd, &mut buf)
            .map_err(|e| e.wrap("stun binding response encode failed"))?;

        skt.sendto(&buf)
            .await
            .map_err(|e| e.wrap("stun binding response send failed"))?;
        self.env.mirror(&buf);

        if self.state() == ConnectionState::WaitingStun {
            self.set_state(ConnectionState::DoingDtls);
            tracing::info!(session = %self.id(), "stun done, waiting dtls handshake");

            let flights = self
                .transport
                .lock()
                .unwrap()
                .start_active_handshake()
                .map_err(|e| e.wrap("fail to dtls handshake"))?;
            for flight in flights {
                skt.sendto(&flight).await?;
                self.env.mirror(&flight);
            }
        }

        Ok(())
    }

    /// Replace the send path with a handle to the new peer address
    pub fn update_sendonly_socket(&self, skt: &Arc<dyn SendOnlySocket>) {
        let old_peer_id = {
            let mut inner = self.inner.lock().unwrap();
            let old = std::mem::replace(&mut inner.peer_id, skt.peer_id());
            old
        };

        if !old_peer_id.is_empty() {
            tracing::info!(
                session = %self.cid,
                from = %old_peer_id,
                to = %skt.peer_id(),
                "address changed"
            );
        }

        *self.sendonly_skt.lock().unwrap() = Some(Arc::clone(skt));

        self.env.sessions.register_peer(&skt.peer_id(), &self.cid);
        if !old_peer_id.is_empty() && old_peer_id != skt.peer_id() {
            self.env.sessions.unregister_peer(&old_peer_id);
        }
    }

    /// Pump one DTLS record through the transport
    pub async fn on_dtls(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let outcome = self.transport.lock().unwrap().on_dtls(data)?;

        if !outcome.outbound.is_empty() {
            let skt = self.current_socket()?;
            for record in outcome.outbound {
                skt.sendto(&record)
                    .await
                    .map_err(|e| e.wrap("send dtls packet"))?;
                self.env.mirror(&record);
            }
        }

        if outcome.established {
            self.on_connection_established().await?;
        }

        Ok(())
    }

    /// The DTLS handshake finished: start the stream this session runs
    pub async fn on_connection_established(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Established);

        let is_publisher = self.inner.lock().unwrap().is_publisher;
        tracing::info!(
            session = %self.id(),
            role = if is_publisher { "publisher" } else { "player" },
            "connection established"
        );

        if is_publisher {
            let publisher = self.publisher().ok_or_else(|| {
                RtcError::new(ErrorKind::StreamDesc, "rtc publisher null")
            })?;
            publisher.start().await.map_err(|e| e.wrap("start publish"))?;
        } else {
            let player = self
                .player()
                .ok_or_else(|| RtcError::new(ErrorKind::NoPlayer, "rtc player null"))?;
            player.start().await.map_err(|e| e.wrap("start play"))?;
        }

        Ok(())
    }

    /// Route one RTP datagram to the publisher
    pub async fn on_rtp(&self, data: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Established {
            return Err(RtcError::new(
                ErrorKind::Rtp,
                "recv unexpected rtp packet before dtls done",
            ));
        }
        let publisher = self
            .publisher()
            .ok_or_else(|| RtcError::new(ErrorKind::Rtp, "rtc publisher null"))?;
        publisher.on_rtp(data).await
    }

    /// Unprotect and route one RTCP datagram
    pub async fn on_rtcp(&self, data: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Established {
            return Err(RtcError::new(
                ErrorKind::Rtcp,
                "recv unexpected rtcp packet before dtls done",
            ));
        }

        let plaintext = self
            .transport
            .lock()
            .unwrap()
            .unprotect_rtcp(data)
            .map_err(|e| e.wrap("rtcp unprotect failed"))?;
        self.env.mirror(&plaintext);

        if let Some(player) = self.player() {
            return player.on_rtcp(&plaintext).await;
        }
        if let Some(publisher) = self.publisher() {
            return publisher.on_rtcp(&plaintext).await;
        }
        Ok(())
    }

    /// Forward a TWCC feedback packet to the congestion controller
    pub fn on_twcc_feedback(&self, data: &[u8]) -> Result<()> {
        let mut gcc = self.gcc.lock().unwrap();
        match gcc.as_mut() {
            Some(gcc) => gcc
                .on_feedback(data)
                .map_err(|e| e.wrap("handle twcc feedback rtcp")),
            None => Ok(()),
        }
    }

    /// Unprotect one RTP packet (publisher ingest path)
    pub fn unprotect_rtp(&self, data: &[u8]) -> Result<Bytes> {
        self.transport.lock().unwrap().unprotect_rtp(data)
    }

    /// Protect and transmit one RTCP payload
    pub async fn send_rtcp(&self, payload: &[u8]) -> Result<()> {
        self.env.mirror(payload);
        let protected = self.transport.lock().unwrap().protect_rtcp(payload)?;
        let skt = self.current_socket()?;
        skt.sendto(&protected).await
    }

    /// Send a receiver report for one reception SSRC
    pub async fn send_rtcp_rr(&self, info: RrInfo) -> Result<()> {
        let mut buf = BytesMut::with_capacity(64);
        encode_rr(&mut buf, info);
        self.send_rtcp(&buf).await.map_err(|e| e.wrap("protect rtcp rr"))
    }

    /// Send an XR receiver-reference-time block
    pub async fn send_rtcp_xr_rrtr(&self, ssrc: u32) -> Result<()> {
        let mut buf = BytesMut::with_capacity(32);
        encode_xr_rrtr(&mut buf, ssrc, NtpTime::now());
        self.send_rtcp(&buf).await.map_err(|e| e.wrap("protect rtcp xr"))
    }

    /// Send a PLI soliciting a keyframe for an SSRC we receive
    pub async fn send_rtcp_fb_pli(&self, ssrc: u32) -> Result<()> {
        let mut buf = BytesMut::with_capacity(16);
        encode_pli(&mut buf, ssrc);
        tracing::info!(ssrc = ssrc, "rtc pli");
        self.send_rtcp(&buf)
            .await
            .map_err(|e| e.wrap("protect rtcp psfb pli"))
    }

    /// Batch lost sequences into Generic NACKs and send them
    pub async fn check_send_nacks(&self, ssrc: u32, lost: &[u16]) -> Result<()> {
        if lost.is_empty() {
            return Ok(());
        }
        let mut sorted = lost.to_vec();
        sorted.sort_unstable();

        for (pid, blp) in nack_words(&sorted) {
            let mut buf = BytesMut::with_capacity(16);
            encode_nack(&mut buf, ssrc, pid, blp);
            self.send_rtcp(&buf).await?;
        }
        Ok(())
    }

    /// Encode, encrypt and transmit a batch of RTP packets
    ///
    /// Per packet, in strict order: allocate the TWCC sequence and write
    /// it into the header extension, encode, register the wire size with
    /// the congestion controller, SRTP-protect, transmit, then mark the
    /// sequence sent. The controller must see the exact pre-encryption
    /// wire size.
    pub async fn do_send_packets(&self, pkts: Vec<RtpPacket>) -> Result<SendSummary> {
        let mut summary = SendSummary::default();
        if pkts.is_empty() {
            return Ok(summary);
        }

        let skt = self.current_socket()?;
        let encrypt = self.encrypt.load(Ordering::SeqCst);

        for mut pkt in pkts {
            let mut buf = BytesMut::with_capacity(RTP_PACKET_MAX);

            let twcc_sn = {
                let mut gcc = self.gcc.lock().unwrap();
                gcc.as_mut().map(|gcc| {
                    let sn = gcc.allocate_sn();
                    pkt.header.set_twcc_sequence_number(gcc.twcc_id(), sn);
                    sn
                })
            };

            pkt.encode(&mut buf).map_err(|e| e.wrap("encode packet"))?;

            if let Some(sn) = twcc_sn {
                let mut gcc = self.gcc.lock().unwrap();
                if let Some(gcc) = gcc.as_mut() {
                    gcc.on_pre_send(pkt.header.ssrc, pkt.header.sequence, sn, buf.len());
                }
            }

            let wire: Bytes = if encrypt {
                self.transport
                    .lock()
                    .unwrap()
                    .protect_rtp(&buf)
                    .map_err(|e| e.wrap("srtp protect"))?
            } else {
                buf.freeze()
            };

            summary.nn_packets += 1;
            summary.nn_bytes += wire.len() as u64;
            bump_by(&self.stats.nn_out_bytes, wire.len() as u64);

            // For the player-side NACK simulator, drop instead of sending.
            if self.simulate_player_drop.load(Ordering::SeqCst) > 0 {
                self.simulate_player_drop.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(
                    seq = pkt.header.sequence,
                    ssrc = pkt.header.ssrc,
                    "nack simulator player drop"
                );
                continue;
            }

            skt.sendto(&wire).await?;

            if let Some(sn) = twcc_sn {
                let mut gcc = self.gcc.lock().unwrap();
                if let Some(gcc) = gcc.as_mut() {
                    gcc.on_sent(sn, unix_micros_now());
                }
            }
        }

        Ok(summary)
    }

    /// Arm the NACK drop simulators on both roles
    pub fn simulate_nack_drop(&self, n: i32) {
        if let Some(publisher) = self.publisher() {
            publisher.simulate_nack_drop(n);
        }
        self.simulate_player_drop.store(n, Ordering::SeqCst);
    }

    /// Apply track activity requests to the player
    pub fn set_play_track_active(&self, cfgs: &[TrackConfig]) -> Result<()> {
        let player = self
            .player()
            .ok_or_else(|| RtcError::new(ErrorKind::NoPlayer, "set play track"))?;
        player.set_track_active(cfgs);
        Ok(())
    }

    /// Tear the session down
    ///
    /// The play loop is stopped and drained before anything else goes
    /// away; the publisher detaches from the source; statistics are
    /// flushed as a one-line summary.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if let Some(player) = self.player.lock().unwrap().take() {
            player.stop();
        }
        if let Some(publisher) = self.publisher.lock().unwrap().take() {
            publisher.stop();
        }

        let peer_id = self.peer_id();
        if !peer_id.is_empty() {
            self.env.sessions.unregister_peer(&peer_id);
        }

        tracing::info!(session = %self.id(), summary = %self.stats.summary(), "session closed");
    }

    fn current_socket(&self) -> Result<Arc<dyn SendOnlySocket>> {
        self.sendonly_skt
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RtcError::new(ErrorKind::Socket, "no send socket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SendOnlySocket;
    use crate::rtp::{ExtensionKind, ExtensionMap, MediaKind, RtpHeader, RtpPayload};
    use crate::session::stats::read;
    use crate::stun::{StunMessageType, StunPacket};
    use crate::testing::{self, MockDtls, MockSocket};

    fn video_packet(seq: u16, ssrc: u32, keyframe: bool) -> RtpPacket {
        let byte: &'static [u8] = if keyframe { &[0x65, 0x88] } else { &[0x41, 0x9A] };
        RtpPacket::new(
            RtpHeader {
                payload_type: 102,
                sequence: seq,
                timestamp: seq as u32 * 3000,
                ssrc,
                ..Default::default()
            },
            MediaKind::Video,
            RtpPayload::Raw(bytes::Bytes::from_static(byte)),
        )
    }

    #[tokio::test]
    async fn test_state_transitions_are_monotonic() {
        let env = testing::test_env(testing::default_config());
        let conn = RtcConnection::new(env, "c1", Box::new(MockDtls::new()));

        assert_eq!(conn.state(), ConnectionState::Init);
        assert!(conn.set_state(ConnectionState::WaitingStun));
        assert!(conn.set_state(ConnectionState::DoingDtls));

        // No reverse transitions.
        assert!(!conn.set_state(ConnectionState::WaitingStun));
        assert!(!conn.set_state(ConnectionState::DoingDtls));
        assert_eq!(conn.state(), ConnectionState::DoingDtls);

        assert!(conn.set_state(ConnectionState::Established));
        assert!(conn.set_state(ConnectionState::Closed));
        assert!(!conn.set_state(ConnectionState::Established));
    }

    #[tokio::test]
    async fn test_rtp_before_established_is_discarded() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let conn = RtcConnection::new(env, "c1", Box::new(MockDtls::new()));
        conn.add_publisher(&req, &testing::publish_offer()).unwrap();
        conn.initialize(&req, true, "user").unwrap();
        conn.set_state(ConnectionState::WaitingStun);

        let err = conn.on_rtp(&[0x80, 0, 0, 1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rtp);
        let err = conn.on_rtcp(&[0x80, 200, 0, 1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rtcp);

        assert_eq!(read(&conn.stats().nn_in_rtp), 0);
        assert_eq!(read(&conn.stats().nn_in_twcc), 0);
    }

    #[tokio::test]
    async fn test_stun_migration_rebinds_peer() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let conn = RtcConnection::new(env.clone(), "c1", Box::new(MockDtls::new()));
        conn.add_publisher(&req, &testing::publish_offer()).unwrap();
        conn.initialize(&req, true, "user").unwrap();
        conn.set_state(ConnectionState::WaitingStun);

        let skt1 = MockSocket::new("1.2.3.4:5000".parse().unwrap());
        let dyn1: Arc<dyn SendOnlySocket> = skt1.clone();
        conn.on_stun(&dyn1, &testing::binding_request()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::DoingDtls);
        assert_eq!(conn.peer_id(), "1.2.3.4:5000");

        // The peer moved to a new port mid-handshake.
        let skt2 = MockSocket::new("1.2.3.4:6000".parse().unwrap());
        let dyn2: Arc<dyn SendOnlySocket> = skt2.clone();
        conn.on_stun(&dyn2, &testing::binding_request()).await.unwrap();

        assert_eq!(conn.peer_id(), "1.2.3.4:6000");
        assert!(env.sessions.lookup("1.2.3.4:5000").is_none());
        assert_eq!(env.sessions.lookup("1.2.3.4:6000").as_deref(), Some("c1"));

        // The response went out on the new address and maps it.
        assert_eq!(skt2.sent_count(), 1);
        let response = StunPacket::decode(&skt2.sent()[0]).unwrap();
        assert_eq!(response.message_type, StunMessageType::BindingResponse);
        assert_eq!(
            response.mapped_address,
            Some("1.2.3.4:6000".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_binding_response_is_idempotent() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let conn = RtcConnection::new(env, "c1", Box::new(MockDtls::new()));
        conn.add_publisher(&req, &testing::publish_offer()).unwrap();
        conn.initialize(&req, true, "user").unwrap();
        conn.set_state(ConnectionState::WaitingStun);

        let skt = MockSocket::new("1.2.3.4:5000".parse().unwrap());
        let dyn_skt: Arc<dyn SendOnlySocket> = skt.clone();
        conn.on_stun(&dyn_skt, &testing::binding_request()).await.unwrap();
        conn.on_stun(&dyn_skt, &testing::binding_request()).await.unwrap();

        let sent = skt.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test]
    async fn test_strict_check_rejects_ice_controlled() {
        let env = testing::test_env(testing::default_config().strict_check(true));
        let req = testing::test_request();
        let conn = RtcConnection::new(env, "c1", Box::new(MockDtls::new()));
        conn.add_publisher(&req, &testing::publish_offer()).unwrap();
        conn.initialize(&req, true, "user").unwrap();
        conn.set_state(ConnectionState::WaitingStun);

        let mut request = testing::binding_request();
        request.ice_controlled = true;

        let skt = MockSocket::new("1.2.3.4:5000".parse().unwrap());
        let dyn_skt: Arc<dyn SendOnlySocket> = skt.clone();
        let err = conn.on_stun(&dyn_skt, &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stun);
    }

    #[tokio::test]
    async fn test_stun_timeout_budget() {
        let env = testing::test_env(
            testing::default_config().timeout(Duration::from_millis(20)),
        );
        let req = testing::test_request();
        let conn = RtcConnection::new(env, "c1", Box::new(MockDtls::new()));
        conn.add_publisher(&req, &testing::publish_offer()).unwrap();
        conn.initialize(&req, true, "user").unwrap();

        assert!(!conn.is_stun_timeout());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(conn.is_stun_timeout());
    }

    #[tokio::test]
    async fn test_outbound_twcc_sequences_increase() {
        let env = testing::test_env(testing::default_config().gcc(true));
        let req = testing::test_request();
        testing::seed_published_source(&env, &req);

        let (conn, skt) = testing::established_player(&env).await;
        skt.clear();

        let source = env.sources.fetch_or_create(&req).unwrap();
        for seq in 0..3u16 {
            source.on_rtp(video_packet(seq, 900, false)).unwrap();
        }
        testing::wait_for_sends(&skt, 3).await;

        let mut exts = ExtensionMap::new();
        exts.register(3, ExtensionKind::TransportCc);

        let mut sns = Vec::new();
        for wire in skt.sent() {
            // Strip the mock SRTP trailer before decoding.
            let plain = &wire[..wire.len() - 4];
            let (header, _) = RtpHeader::decode(plain, &exts, false).unwrap();
            sns.push(header.twcc_sequence_number().unwrap());
        }
        assert_eq!(sns.len(), 3);
        assert!(sns.windows(2).all(|w| w[1] > w[0]));

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_player_drop_simulator() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        testing::seed_published_source(&env, &req);

        let (conn, skt) = testing::established_player(&env).await;
        skt.clear();
        conn.simulate_nack_drop(1);

        let source = env.sources.fetch_or_create(&req).unwrap();
        source.on_rtp(video_packet(1, 900, false)).unwrap();
        source.on_rtp(video_packet(2, 900, false)).unwrap();

        // Only the second packet reaches the wire.
        testing::wait_for_sends(&skt, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(skt.sent_count(), 1);

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_unregisters_and_closes() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        assert_eq!(
            env.sessions.lookup("1.2.3.4:5000").as_deref(),
            Some("pub-conn")
        );

        conn.dispose().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(env.sessions.lookup("1.2.3.4:5000").is_none());
        assert!(conn.publisher().is_none());

        // Disposal is idempotent.
        conn.dispose().await;
    }
}
