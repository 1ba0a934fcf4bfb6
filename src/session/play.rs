//! Play stream: the egress pipeline
//!
//! A cooperative task drains the attached consumer, routes each packet to
//! its send track (consulting the stream switch context for video) and
//! hands the batch to the connection for encoding, encryption and
//! transmit. Inbound RTCP serves NACK-ARQ from the per-track caches and
//! forwards PLI upstream to the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::connection::RtcConnection;
use super::stats::{bump, bump_by};
use super::switch::{StreamSwitchContext, SwitchDecision};
use crate::error::{ErrorKind, Result, RtcError};
use crate::rtcp::feedback::{parse_fb_header, parse_nack_fci};
use crate::rtcp::{self, nack_sequences, split_compound};
use crate::rtp::{MediaKind, RtpPacket};
use crate::server::env::{ServerEnv, StreamRequest};
use crate::track::description::{TrackConfig, TrackDescription};
use crate::track::send::SendTrack;

/// Spacing of the egress debug summary
const EGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

struct PlayTracks {
    audio: HashMap<u32, SendTrack>,
    video: HashMap<u32, SendTrack>,
    switcher: StreamSwitchContext,
}

/// Egress orchestrator for one playing session
pub struct RtcPlayStream {
    session: Weak<RtcConnection>,
    env: ServerEnv,
    req: StreamRequest,
    nack_enabled: bool,
    realtime: bool,
    mw_msgs: usize,
    tracks: Mutex<PlayTracks>,
    started: AtomicBool,
    interrupted: AtomicBool,
    interrupt: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtcPlayStream {
    /// Build the player from the negotiated subscription relations,
    /// keyed by publish SSRC
    pub fn new(
        session: Weak<RtcConnection>,
        env: ServerEnv,
        req: StreamRequest,
        sub_relations: HashMap<u32, TrackDescription>,
    ) -> Arc<Self> {
        let nack_enabled = env.config.nack_enabled(&req.vhost);
        let realtime = env.config.realtime_enabled(&req.vhost);
        let mw_msgs = env.config.mw_msgs(&req.vhost, realtime);

        let mut tracks = PlayTracks {
            audio: HashMap::new(),
            video: HashMap::new(),
            switcher: StreamSwitchContext::new(Arc::clone(&env.groups)),
        };

        for (publish_ssrc, desc) in sub_relations {
            match desc.kind {
                MediaKind::Audio => {
                    let mut track = SendTrack::new(desc);
                    track.set_track_status(true);
                    tracks.audio.insert(publish_ssrc, track);
                }
                MediaKind::Video => {
                    tracks.switcher.register(&desc.id);
                    let grouped = env.groups.is_member(&desc.id);
                    let mut track = SendTrack::new(desc);
                    // Merge-group members stay dark until their keyframe.
                    track.set_track_status(!grouped);
                    tracks.video.insert(publish_ssrc, track);
                }
            }
        }

        tracing::info!(
            stream = %req,
            nack = nack_enabled,
            realtime = realtime,
            mw_msgs = mw_msgs,
            "player created"
        );

        Arc::new(Self {
            session,
            env,
            req,
            nack_enabled,
            realtime,
            mw_msgs,
            tracks: Mutex::new(tracks),
            started: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt: Notify::new(),
            task: Mutex::new(None),
        })
    }

    /// Start the egress loop
    ///
    /// Idempotent, since DTLS may retransmit the final flight. Preparing
    /// merge-group tracks get a PLI upstream so the player can decode as
    /// soon as possible.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let player = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = player.cycle().await {
                tracing::warn!(error = %e, "play cycle ended");
            }
        });
        *self.task.lock().unwrap() = Some(handle);

        if let Some(hook) = &self.env.hook {
            hook.on_start_play(&self.req)
                .await
                .map_err(|e| e.wrap("on start play"))?;
        }

        let preparing: Vec<u32> = {
            let tracks = self.tracks.lock().unwrap();
            tracks
                .video
                .iter()
                .filter(|(_, t)| tracks.switcher.is_track_preparing(t.track_id()))
                .map(|(publish_ssrc, _)| *publish_ssrc)
                .collect()
        };
        for publish_ssrc in preparing {
            self.request_source_keyframe(publish_ssrc);
        }

        Ok(())
    }

    /// Interrupt the egress loop; it observes the flag at the top of the
    /// next iteration
    pub fn stop(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt.notify_waiters();
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn cycle(self: Arc<Self>) -> Result<()> {
        let source = self
            .env
            .sources
            .fetch_or_create(&self.req)
            .map_err(|e| e.wrap("rtc fetch source failed"))?;

        let mut consumer = source
            .create_consumer()
            .map_err(|e| e.wrap(format!("rtc create consumer, source url={}", self.req)))?;
        source
            .consumer_dumps(consumer.as_mut())
            .map_err(|e| e.wrap(format!("dumps consumer, source url={}", self.req)))?;

        if let Some(hook) = &self.env.hook {
            hook.on_start_consume(&self.req)
                .await
                .map_err(|e| e.wrap("on start consuming"))?;
        }

        tracing::info!(
            source = %source.source_id(),
            realtime = self.realtime,
            mw_msgs = self.mw_msgs,
            "start play"
        );

        let perf_stat = self.env.config.server_perf_stat();
        let mut pkts: Vec<RtpPacket> = Vec::new();
        let mut sent_pkts = 0u64;
        let mut sent_bytes = 0u64;
        let mut last_log = Instant::now();

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                _ = consumer.wait(self.mw_msgs) => {}
                _ = self.interrupt.notified() => continue,
            }

            consumer.dump_packets(&mut pkts);
            if pkts.is_empty() {
                continue;
            }

            let Some(conn) = self.session.upgrade() else {
                return Ok(());
            };
            bump_by(&conn.stats().nn_out_rtp, pkts.len() as u64);

            match self.send_packets(&conn, pkts.drain(..).collect()).await {
                Ok(summary) => {
                    if perf_stat {
                        sent_pkts += summary.nn_packets;
                        sent_bytes += summary.nn_bytes;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "send packets"),
            }

            if perf_stat && last_log.elapsed() >= EGRESS_LOG_INTERVAL {
                tracing::debug!(pkts = sent_pkts, bytes = sent_bytes, "egress");
                last_log = Instant::now();
            }
        }
    }

    /// Route one drained batch onto the send tracks and transmit
    async fn send_packets(
        &self,
        conn: &Arc<RtcConnection>,
        pkts: Vec<RtpPacket>,
    ) -> Result<super::connection::SendSummary> {
        let mut prepared = Vec::with_capacity(pkts.len());
        {
            let mut guard = self.tracks.lock().unwrap();
            let PlayTracks {
                audio,
                video,
                switcher,
            } = &mut *guard;

            for pkt in pkts {
                let ssrc = pkt.header.ssrc;

                if let Some(track) = audio.get_mut(&ssrc) {
                    if let Some(out) = track.prepare(pkt) {
                        prepared.push(out);
                    }
                    continue;
                }

                let Some(track) = video.get_mut(&ssrc) else {
                    // Packets whose SSRC matches no track are skipped.
                    continue;
                };

                let track_id = track.track_id().to_string();
                match switcher.try_switch_stream(&track_id, pkt.is_keyframe()) {
                    SwitchDecision::Drop => continue,
                    SwitchDecision::Promote { demote } => {
                        if let Some(demoted) = demote {
                            for t in video.values_mut() {
                                if t.track_id() == demoted {
                                    t.set_track_status(false);
                                }
                            }
                        }
                        let track = video.get_mut(&ssrc).unwrap();
                        track.set_track_status(true);
                        if let Some(out) = track.prepare(pkt) {
                            prepared.push(out);
                        }
                    }
                    SwitchDecision::Deliver => {
                        if let Some(out) = track.prepare(pkt) {
                            prepared.push(out);
                        }
                    }
                }
            }
        }

        conn.do_send_packets(prepared).await
    }

    /// Handle one plaintext compound RTCP datagram
    pub async fn on_rtcp(&self, data: &[u8]) -> Result<()> {
        let conn = self
            .session
            .upgrade()
            .ok_or_else(|| RtcError::new(ErrorKind::Rtcp, "session gone"))?;

        for packet in split_compound(data)? {
            let result = match packet.payload_type {
                rtcp::PT_SR => {
                    rtcp::parse_sr(packet.data)?;
                    bump(&conn.stats().nn_sr);
                    Ok(())
                }
                rtcp::PT_RR => {
                    rtcp::parse_rr(packet.data)?;
                    bump(&conn.stats().nn_rr);
                    Ok(())
                }
                rtcp::PT_SDES | rtcp::PT_BYE | rtcp::PT_APP => Ok(()),
                rtcp::PT_RTPFB => self.on_rtcp_feedback(&conn, packet.data).await,
                rtcp::PT_PSFB => self.on_rtcp_ps_feedback(&conn, packet.data),
                rtcp::PT_XR => self.on_rtcp_xr(&conn, packet.data),
                other => Err(RtcError::new(
                    ErrorKind::RtcpCheck,
                    format!("unknown rtcp type={}", other),
                )),
            };
            result.map_err(|e| e.wrap("rtcp"))?;
        }

        Ok(())
    }

    async fn on_rtcp_feedback(&self, conn: &Arc<RtcConnection>, data: &[u8]) -> Result<()> {
        let (header, fci) = parse_fb_header(data)?;
        if header.fmt == rtcp::RTPFB_FMT_TWCC {
            return conn.on_twcc_feedback(data);
        }

        if !self.nack_enabled {
            let (pid, _) = parse_nack_fci(fci)?;
            tracing::info!(seq = pid, "nack ignored");
            return Ok(());
        }

        let (pid, blp) = parse_nack_fci(fci)?;
        let mut resend = Vec::new();
        for seq in nack_sequences(pid, blp) {
            self.nack_fetch(&mut resend, header.media_ssrc, seq);
        }

        for pkt in &resend {
            tracing::info!(
                seq = pkt.header.sequence,
                ssrc = pkt.header.ssrc,
                ts = pkt.header.timestamp,
                "nack arq"
            );
        }

        // Retransmissions go through the normal send path: re-encrypted
        // with current SRTP state, fresh TWCC sequence when enabled.
        conn.do_send_packets(resend)
            .await
            .map_err(|e| e.wrap("raw send"))?;
        bump(&conn.stats().nn_nack);

        Ok(())
    }

    fn on_rtcp_ps_feedback(&self, conn: &Arc<RtcConnection>, data: &[u8]) -> Result<()> {
        let (header, _fci) = parse_fb_header(data)?;
        match header.fmt {
            rtcp::PSFB_FMT_PLI => {
                if let Some(publish_ssrc) = self.video_publish_ssrc(header.media_ssrc) {
                    let publisher = self
                        .env
                        .sources
                        .fetch_or_create(&self.req)
                        .ok()
                        .and_then(|s| s.publish_stream());
                    if let Some(publisher) = publisher {
                        publisher.request_keyframe(publish_ssrc);
                        tracing::info!(
                            play_ssrc = header.media_ssrc,
                            publish_ssrc = publish_ssrc,
                            "pli forwarded"
                        );
                    }
                }
                bump(&conn.stats().nn_pli);
                Ok(())
            }
            rtcp::PSFB_FMT_SLI | rtcp::PSFB_FMT_RPSI | rtcp::PSFB_FMT_AFB => {
                tracing::debug!(fmt = header.fmt, "psfb");
                Ok(())
            }
            other => Err(RtcError::new(
                ErrorKind::Rtcp,
                format!("unknown payload specific feedback={}", other),
            )),
        }
    }

    fn on_rtcp_xr(&self, conn: &Arc<RtcConnection>, data: &[u8]) -> Result<()> {
        let entries = rtcp::parse_xr_dlrr(data)?;
        let compact_now = crate::rtcp::NtpTime::now().compact();
        for entry in entries {
            let rtt = rtcp::rtt_millis(compact_now, entry.lrr, entry.dlrr);
            tracing::debug!(ssrc = entry.ssrc, rtt_ms = rtt, "player xr dlrr");
        }
        bump(&conn.stats().nn_xr);
        Ok(())
    }

    /// Fetch a cached packet from whichever track owns the SSRC
    pub fn nack_fetch(&self, out: &mut Vec<RtpPacket>, ssrc: u32, seq: u16) {
        let tracks = self.tracks.lock().unwrap();

        for track in tracks.audio.values() {
            if track.has_ssrc(ssrc) {
                if let Some(pkt) = track.fetch_rtp_packet(seq) {
                    out.push(pkt);
                }
                return;
            }
        }

        for track in tracks.video.values() {
            if track.has_ssrc(ssrc) {
                if let Some(pkt) = track.fetch_rtp_packet(seq) {
                    out.push(pkt);
                }
                return;
            }
        }
    }

    /// The publish-side SSRC backing a play-side video SSRC
    pub fn video_publish_ssrc(&self, play_ssrc: u32) -> Option<u32> {
        let tracks = self.tracks.lock().unwrap();
        tracks
            .video
            .iter()
            .find(|(_, t)| t.has_ssrc(play_ssrc))
            .map(|(publish_ssrc, _)| *publish_ssrc)
    }

    /// Apply requested track activity states
    ///
    /// All tracks are first deactivated, except merge-group members the
    /// switch context marks immutable. Requested video members of a merge
    /// group become "preparing" and a PLI is requested upstream; everything
    /// else flips immediately.
    pub fn set_track_active(&self, cfgs: &[TrackConfig]) {
        let mut pli_targets = Vec::new();
        {
            let mut guard = self.tracks.lock().unwrap();
            let PlayTracks {
                audio,
                video,
                switcher,
            } = &mut *guard;

            for track in video.values_mut() {
                if switcher.is_track_immutable(track.track_id()) {
                    continue;
                }
                track.set_track_status(false);
            }
            for track in audio.values_mut() {
                track.set_track_status(false);
            }

            for cfg in cfgs {
                match cfg.kind {
                    MediaKind::Audio => {
                        for track in audio.values_mut() {
                            if track.track_id() == cfg.label {
                                track.set_track_status(cfg.active);
                            }
                        }
                    }
                    MediaKind::Video => {
                        for (publish_ssrc, track) in video.iter_mut() {
                            if track.track_id() != cfg.label {
                                continue;
                            }
                            if cfg.active && switcher.activate_in_future(&cfg.label) {
                                pli_targets.push(*publish_ssrc);
                                continue;
                            }
                            track.set_track_status(cfg.active);
                        }
                    }
                }
            }
        }

        for publish_ssrc in pli_targets {
            self.request_source_keyframe(publish_ssrc);
        }
    }

    /// Whether a track is currently active, by logical id
    pub fn is_track_active(&self, label: &str) -> bool {
        let tracks = self.tracks.lock().unwrap();
        tracks
            .audio
            .values()
            .chain(tracks.video.values())
            .any(|t| t.track_id() == label && t.is_active())
    }

    fn request_source_keyframe(&self, publish_ssrc: u32) {
        let publisher = self
            .env
            .sources
            .fetch_or_create(&self.req)
            .ok()
            .and_then(|s| s.publish_stream());
        if let Some(publisher) = publisher {
            publisher.request_keyframe(publish_ssrc);
        }
    }
}

impl Drop for RtcPlayStream {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
