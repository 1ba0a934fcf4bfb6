//! Publish stream: the ingest pipeline
//!
//! Moves packets from the peer into the media bus: TWCC accounting on the
//! still-encrypted header, SRTP unprotect, payload decode, track
//! demultiplex, bus delivery. A 200 ms report timer emits RR and XR-RRTR
//! per track and flushes TWCC feedback.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::task::JoinHandle;

use super::connection::RtcConnection;
use super::stats::bump;
use crate::bus::{PublishStreamOps, Source};
use crate::error::{ErrorKind, Result, RtcError};
use crate::rtcp::feedback::parse_fb_header;
use crate::rtcp::twcc::TwccReceiver;
use crate::rtcp::{self, split_compound, unix_micros_now, NtpTime};
use crate::rtp::{
    ExtensionKind, ExtensionMap, MediaKind, RtpHeader, RtpPacket, EXT_URI_PICTURE_ID, EXT_URI_TWCC,
};
use crate::server::env::{ServerEnv, StreamRequest};
use crate::track::description::StreamDescription;
use crate::track::recv::RecvTrack;

/// Report timer period
const REPORT_INTERVAL: Duration = Duration::from_millis(200);
/// Minimum spacing between TWCC feedback packets, microseconds
const TWCC_FEEDBACK_INTERVAL_US: u64 = 50_000;

#[derive(Default)]
struct PublishInner {
    audio_tracks: Vec<RecvTrack>,
    video_tracks: Vec<RecvTrack>,
    source: Option<Arc<dyn Source>>,
}

struct TwccState {
    receiver: TwccReceiver,
    last_feedback_us: u64,
}

/// Ingest orchestrator for one publishing session
pub struct RtcPublishStream {
    session: Weak<RtcConnection>,
    env: ServerEnv,
    req: StreamRequest,
    nack_enabled: bool,
    pt_to_drop: u16,
    twcc_id: u8,
    ext_map: ExtensionMap,
    inner: Mutex<PublishInner>,
    twcc: Mutex<TwccState>,
    simulate_drop: AtomicI32,
    started: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RtcPublishStream {
    /// Build the publisher from the negotiated stream description
    pub fn new(
        session: Weak<RtcConnection>,
        env: ServerEnv,
        req: StreamRequest,
        stream_desc: &StreamDescription,
    ) -> Arc<Self> {
        let nack_enabled = env.config.nack_enabled(&req.vhost);
        let pt_to_drop = env.config.drop_for_pt(&req.vhost);

        // The audio description carries no TWCC id in common offers; take
        // it from the first video track.
        let mut twcc_id = 0u8;
        let mut media_ssrc = 0u32;
        let mut picture_id = 0u8;
        if let Some(video) = stream_desc.video_tracks.first() {
            if let Some(id) = video.extension_id(EXT_URI_TWCC) {
                twcc_id = id;
                media_ssrc = video.ssrc;
            }
            if let Some(id) = video.extension_id(EXT_URI_PICTURE_ID) {
                picture_id = id;
            }
        }

        let mut ext_map = ExtensionMap::new();
        let mut receiver = TwccReceiver::new();
        if twcc_id != 0 {
            ext_map.register(twcc_id, ExtensionKind::TransportCc);
            receiver.set_media_ssrc(media_ssrc);
        }
        if picture_id != 0 {
            ext_map.register(picture_id, ExtensionKind::PictureId);
        }

        let mut inner = PublishInner::default();
        if let Some(audio) = &stream_desc.audio_track {
            inner
                .audio_tracks
                .push(RecvTrack::new(audio.clone(), nack_enabled));
        }
        for video in &stream_desc.video_tracks {
            inner
                .video_tracks
                .push(RecvTrack::new(video.clone(), nack_enabled));
        }

        tracing::info!(
            stream = %req,
            nack = nack_enabled,
            pt_drop = pt_to_drop,
            twcc = twcc_id,
            picture_id = picture_id,
            "publisher created"
        );

        Arc::new(Self {
            session,
            env,
            req,
            nack_enabled,
            pt_to_drop,
            twcc_id,
            ext_map,
            inner: Mutex::new(inner),
            twcc: Mutex::new(TwccState {
                receiver,
                last_feedback_us: 0,
            }),
            simulate_drop: AtomicI32::new(0),
            started: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    /// Attach to the source and start the report timer
    ///
    /// Idempotent: the final DTLS flight may be retransmitted and
    /// re-trigger connection establishment.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let source = self
            .env
            .sources
            .fetch_or_create(&self.req)
            .map_err(|e| e.wrap("create source"))?;
        source.on_publish().map_err(|e| e.wrap("on publish"))?;

        let ops: Arc<dyn PublishStreamOps> = Arc::clone(self) as Arc<dyn PublishStreamOps>;
        source.set_publish_stream(Some(Arc::downgrade(&ops)));

        self.inner.lock().unwrap().source = Some(source);

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(publisher) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = publisher.on_report_timer().await {
                    tracing::debug!(error = %e, "publisher report timer");
                }
            }
        });
        *self.timer.lock().unwrap() = Some(handle);

        if let Some(hook) = &self.env.hook {
            hook.on_start_publish(&self.req)
                .await
                .map_err(|e| e.wrap("on start publish"))?;
        }

        Ok(())
    }

    /// Detach from the source and stop the timer
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
        let source = self.inner.lock().unwrap().source.take();
        if let Some(source) = source {
            source.set_publish_stream(None);
            source.on_unpublish();
        }
    }

    /// Arm the ingest drop simulator for `n` packets
    pub fn simulate_nack_drop(&self, n: i32) {
        self.simulate_drop.store(n, Ordering::SeqCst);
    }

    /// Handle one received RTP datagram
    pub async fn on_rtp(&self, data: &[u8]) -> Result<()> {
        let conn = self
            .session
            .upgrade()
            .ok_or_else(|| RtcError::new(ErrorKind::Rtp, "session gone"))?;

        bump(&conn.stats().nn_in_rtp);

        // For the NACK simulator, drop the packet.
        if self.simulate_drop.load(Ordering::SeqCst) > 0 {
            let left = self.simulate_drop.fetch_sub(1, Ordering::SeqCst);
            if let Ok((h, _)) = RtpHeader::decode(data, &self.ext_map, true) {
                tracing::warn!(left = left, header = %h.describe(), "nack simulator drop");
            }
            return Ok(());
        }

        // Parse the header before SRTP unprotect when TWCC is negotiated:
        // padding probes carry sequence numbers that fail SRTP, and
        // duplicated ARQ replies trip replay protection, but both must
        // still be counted for congestion feedback.
        let mut pre_header = None;
        if self.twcc_id != 0 || self.pt_to_drop != 0 {
            let (h, _) = RtpHeader::decode(data, &self.ext_map, true)
                .map_err(|e| e.wrap("twcc decode header"))?;
            pre_header = Some(h);
        }

        if self.twcc_id != 0 {
            if let Some(sn) = pre_header.as_ref().and_then(RtpHeader::twcc_sequence_number) {
                self.on_twcc(&conn, sn)?;
            }
        }

        // If the payload type is configured to drop, ignore this packet.
        if self.pt_to_drop != 0 {
            if let Some(h) = &pre_header {
                if u16::from(h.payload_type) == self.pt_to_drop {
                    return Ok(());
                }
            }
        }

        let plaintext = conn.unprotect_rtp(data).map_err(|e| {
            match RtpHeader::decode(data, &self.ext_map, true) {
                Ok((h, _)) => e.wrap(h.describe()),
                Err(_) => e,
            }
        })?;
        self.env.mirror(&plaintext);

        if plaintext.len() < 12 {
            return Err(RtcError::new(ErrorKind::Rtp, "unprotected packet too short"));
        }
        let ssrc = u32::from_be_bytes([plaintext[8], plaintext[9], plaintext[10], plaintext[11]]);
        let kind = {
            let inner = self.inner.lock().unwrap();
            if inner.audio_tracks.iter().any(|t| t.has_ssrc(ssrc)) {
                MediaKind::Audio
            } else if inner.video_tracks.iter().any(|t| t.has_ssrc(ssrc)) {
                MediaKind::Video
            } else {
                return Err(RtcError::new(
                    ErrorKind::Rtp,
                    format!("unknown ssrc={}", ssrc),
                ));
            }
        };

        let pkt = RtpPacket::decode(&plaintext, &self.ext_map, kind)
            .map_err(|e| e.wrap("decode rtp packet"))?;

        let (lost, wants_keyframe, source) = {
            let mut inner = self.inner.lock().unwrap();
            let track = match kind {
                MediaKind::Audio => inner.audio_tracks.iter_mut().find(|t| t.has_ssrc(ssrc)),
                MediaKind::Video => inner.video_tracks.iter_mut().find(|t| t.has_ssrc(ssrc)),
            };
            // The track existed a moment ago under the same lock pattern;
            // treat disappearance as unknown ssrc all the same.
            let Some(track) = track else {
                return Err(RtcError::new(
                    ErrorKind::Rtp,
                    format!("unknown ssrc={}", ssrc),
                ));
            };
            let lost = track.on_rtp(&pkt);
            let wants_keyframe = kind == MediaKind::Video && track.take_keyframe_request();
            (lost, wants_keyframe, inner.source.clone())
        };

        if let Some(source) = source {
            source
                .on_rtp(pkt.clone())
                .map_err(|e| e.wrap(format!("on {}", kind)))?;
        }

        if self.nack_enabled && !lost.is_empty() {
            if let Err(e) = conn.check_send_nacks(ssrc, &lost).await {
                tracing::debug!(error = %e, ssrc = ssrc, "send nacks");
            }
        }

        if wants_keyframe {
            conn.send_rtcp_fb_pli(ssrc)
                .await
                .map_err(|e| e.wrap("send pli"))?;
        }

        if let Some(hook) = &self.env.hook {
            hook.on_rtp_packet(&self.req, pkt)
                .await
                .map_err(|e| e.wrap("on rtp packet"))?;
        }

        Ok(())
    }

    fn on_twcc(&self, conn: &Arc<RtcConnection>, sn: u16) -> Result<()> {
        let mut twcc = self.twcc.lock().unwrap();
        twcc.receiver.on_received(sn, unix_micros_now());
        bump(&conn.stats().nn_in_twcc);
        Ok(())
    }

    /// Handle one plaintext compound RTCP datagram
    pub async fn on_rtcp(&self, data: &[u8]) -> Result<()> {
        let conn = self
            .session
            .upgrade()
            .ok_or_else(|| RtcError::new(ErrorKind::Rtcp, "session gone"))?;

        for packet in split_compound(data)? {
            let result = match packet.payload_type {
                rtcp::PT_SR => self.on_rtcp_sr(&conn, packet.data),
                rtcp::PT_RR => {
                    rtcp::parse_rr(packet.data)?;
                    bump(&conn.stats().nn_rr);
                    Ok(())
                }
                rtcp::PT_SDES | rtcp::PT_BYE | rtcp::PT_APP => Ok(()),
                rtcp::PT_RTPFB => self.on_rtcp_feedback(&conn, packet.data).await,
                rtcp::PT_PSFB => self.on_rtcp_ps_feedback(packet.data),
                rtcp::PT_XR => self.on_rtcp_xr(packet.data),
                other => Err(RtcError::new(
                    ErrorKind::RtcpCheck,
                    format!("unknown rtcp type={}", other),
                )),
            };
            result.map_err(|e| e.wrap("rtcp"))?;
        }

        Ok(())
    }

    fn on_rtcp_sr(&self, conn: &Arc<RtcConnection>, data: &[u8]) -> Result<()> {
        let (info, _blocks) = rtcp::parse_sr(data)?;
        let now = unix_micros_now();

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let track = inner
            .audio_tracks
            .iter_mut()
            .chain(inner.video_tracks.iter_mut())
            .find(|t| t.has_ssrc(info.ssrc));
        if let Some(track) = track {
            track.update_send_report_time(info.ntp, now);
        }
        drop(guard);

        bump(&conn.stats().nn_sr);
        Ok(())
    }

    async fn on_rtcp_feedback(&self, conn: &Arc<RtcConnection>, data: &[u8]) -> Result<()> {
        let (header, _fci) = parse_fb_header(data)?;
        if header.fmt == rtcp::RTPFB_FMT_TWCC {
            return conn.on_twcc_feedback(data);
        }
        // The publish side sends no media; a NACK here has nothing to serve.
        tracing::debug!(fmt = header.fmt, "publisher transport feedback ignored");
        Ok(())
    }

    fn on_rtcp_ps_feedback(&self, data: &[u8]) -> Result<()> {
        let (header, _fci) = parse_fb_header(data)?;
        match header.fmt {
            rtcp::PSFB_FMT_PLI | rtcp::PSFB_FMT_SLI | rtcp::PSFB_FMT_RPSI | rtcp::PSFB_FMT_AFB => {
                tracing::debug!(fmt = header.fmt, "publisher psfb");
                Ok(())
            }
            other => Err(RtcError::new(
                ErrorKind::Rtcp,
                format!("unknown payload specific feedback={}", other),
            )),
        }
    }

    fn on_rtcp_xr(&self, data: &[u8]) -> Result<()> {
        let entries = rtcp::parse_xr_dlrr(data)?;
        let compact_now = NtpTime::now().compact();

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for entry in entries {
            let rtt = rtcp::rtt_millis(compact_now, entry.lrr, entry.dlrr);
            let track = inner
                .audio_tracks
                .iter_mut()
                .chain(inner.video_tracks.iter_mut())
                .find(|t| t.has_ssrc(entry.ssrc));
            if let Some(track) = track {
                track.update_rtt(rtt);
                tracing::debug!(ssrc = entry.ssrc, rtt_ms = rtt, "xr dlrr rtt");
            }
        }

        Ok(())
    }

    async fn on_report_timer(&self) -> Result<()> {
        self.send_rtcp_rr().await?;
        self.send_rtcp_xr_rrtr().await?;
        self.send_periodic_twcc().await?;
        Ok(())
    }

    async fn send_rtcp_rr(&self) -> Result<()> {
        let Some(conn) = self.session.upgrade() else {
            return Ok(());
        };
        let now = unix_micros_now();
        let infos: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner
                .audio_tracks
                .iter()
                .chain(inner.video_tracks.iter())
                .map(|t| t.rr_info(now))
                .collect()
        };

        for info in infos {
            conn.send_rtcp_rr(info).await?;
        }
        bump(&conn.stats().nn_rr);
        Ok(())
    }

    async fn send_rtcp_xr_rrtr(&self) -> Result<()> {
        let Some(conn) = self.session.upgrade() else {
            return Ok(());
        };
        let ssrcs: Vec<u32> = {
            let inner = self.inner.lock().unwrap();
            inner
                .audio_tracks
                .iter()
                .chain(inner.video_tracks.iter())
                .map(|t| t.desc().ssrc)
                .collect()
        };

        for ssrc in ssrcs {
            conn.send_rtcp_xr_rrtr(ssrc).await?;
        }
        bump(&conn.stats().nn_xr);
        Ok(())
    }

    async fn send_periodic_twcc(&self) -> Result<()> {
        if self.twcc_id == 0 {
            return Ok(());
        }
        let Some(conn) = self.session.upgrade() else {
            return Ok(());
        };

        let now = unix_micros_now();
        let mut buf = BytesMut::new();
        {
            let mut twcc = self.twcc.lock().unwrap();
            if twcc.last_feedback_us == 0 {
                twcc.last_feedback_us = now;
                return Ok(());
            }
            if now - twcc.last_feedback_us < TWCC_FEEDBACK_INTERVAL_US {
                return Ok(());
            }
            twcc.last_feedback_us = now;
            if !twcc.receiver.has_pending() {
                return Ok(());
            }
            twcc.receiver
                .encode_feedback(&mut buf)
                .map_err(|e| e.wrap("generate twcc feedback packet"))?;
        }

        conn.send_rtcp(&buf).await?;
        bump(&conn.stats().nn_out_twcc);
        Ok(())
    }

    /// Whether TWCC arrivals are queued for the next feedback packet
    pub fn twcc_pending(&self) -> bool {
        self.twcc.lock().unwrap().receiver.has_pending()
    }

    /// Packets received on a track, by any of its SSRCs
    pub fn track_packets(&self, ssrc: u32) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .audio_tracks
            .iter()
            .chain(inner.video_tracks.iter())
            .find(|t| t.has_ssrc(ssrc))
            .map(|t| t.packets_received())
    }

    /// Last RTT stored for a track
    pub fn track_rtt(&self, ssrc: u32) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .audio_tracks
            .iter()
            .chain(inner.video_tracks.iter())
            .find(|t| t.has_ssrc(ssrc))
            .map(|t| t.rtt())
    }
}

impl PublishStreamOps for RtcPublishStream {
    fn request_keyframe(&self, ssrc: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(track) = inner.video_tracks.iter_mut().find(|t| t.has_ssrc(ssrc)) {
            track.request_keyframe();
            tracing::info!(ssrc = ssrc, "keyframe requested");
        }
        drop(inner);

        if let Some(conn) = self.session.upgrade() {
            bump(&conn.stats().nn_pli);
        }
    }
}

impl Drop for RtcPublishStream {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::{PT_SR, PT_XR};
    use crate::session::stats::read;
    use crate::testing::{self, SRTP_RTP_TAG};
    use bytes::BufMut;

    fn encrypt_rtp(pkt: &RtpPacket) -> Vec<u8> {
        let mut buf = BytesMut::new();
        pkt.encode(&mut buf).unwrap();
        let mut wire = buf.to_vec();
        wire.extend_from_slice(SRTP_RTP_TAG);
        wire
    }

    fn video_packet(seq: u16, ssrc: u32, twcc: Option<(u8, u16)>) -> RtpPacket {
        let mut header = crate::rtp::RtpHeader {
            payload_type: 102,
            sequence: seq,
            timestamp: seq as u32 * 3000,
            ssrc,
            ..Default::default()
        };
        if let Some((id, sn)) = twcc {
            header.set_twcc_sequence_number(id, sn);
        }
        RtpPacket::new(
            header,
            MediaKind::Video,
            crate::rtp::RtpPayload::Raw(bytes::Bytes::from_static(&[0x65, 0x88])),
        )
    }

    #[tokio::test]
    async fn test_ingest_delivers_to_bus() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        let source = env.sources.fetch_or_create(&testing::test_request()).unwrap();
        let mut consumer = source.create_consumer().unwrap();

        conn.on_rtp(&encrypt_rtp(&video_packet(1, 900, Some((3, 10)))))
            .await
            .unwrap();

        consumer.wait(1).await;
        let mut out = Vec::new();
        consumer.dump_packets(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header.ssrc, 900);

        assert_eq!(publisher.track_packets(900), Some(1));
        assert_eq!(read(&conn.stats().nn_in_rtp), 1);
        assert_eq!(read(&conn.stats().nn_in_twcc), 1);

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_unknown_ssrc_is_an_error() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        let err = conn
            .on_rtp(&encrypt_rtp(&video_packet(1, 555, None)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rtp);
        assert!(err.to_string().contains("unknown ssrc=555"));

        // No track state moved.
        assert_eq!(publisher.track_packets(900), Some(0));
        assert_eq!(publisher.track_packets(800), Some(0));

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_twcc_accounted_before_failed_unprotect() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        let source = env.sources.fetch_or_create(&testing::test_request()).unwrap();
        let mut consumer = source.create_consumer().unwrap();

        // Valid TWCC extension, corrupt auth trailer.
        let mut buf = BytesMut::new();
        video_packet(1, 900, Some((3, 7))).encode(&mut buf).unwrap();
        let mut wire = buf.to_vec();
        wire.extend_from_slice(b"xxxx");

        let err = conn.on_rtp(&wire).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SrtpUnprotect);

        // The reception was still counted for congestion feedback.
        assert!(publisher.twcc_pending());
        assert_eq!(read(&conn.stats().nn_in_twcc), 1);

        // The packet never reached a track or the bus.
        assert_eq!(publisher.track_packets(900), Some(0));
        let mut out = Vec::new();
        consumer.dump_packets(&mut out);
        assert!(out.is_empty());

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_drop_for_payload_type() {
        let env = testing::test_env(testing::default_config().drop_pt(102));
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        conn.on_rtp(&encrypt_rtp(&video_packet(1, 900, Some((3, 1)))))
            .await
            .unwrap();

        assert_eq!(publisher.track_packets(900), Some(0));

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_simulated_ingest_drop() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        publisher.simulate_nack_drop(1);
        conn.on_rtp(&encrypt_rtp(&video_packet(1, 900, None)))
            .await
            .unwrap();
        assert_eq!(publisher.track_packets(900), Some(0));

        conn.on_rtp(&encrypt_rtp(&video_packet(2, 900, None)))
            .await
            .unwrap();
        assert_eq!(publisher.track_packets(900), Some(1));

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_gap_triggers_nack_emission() {
        let env = testing::test_env(testing::default_config());
        let (conn, skt) = testing::established_publisher(&env).await;

        conn.on_rtp(&encrypt_rtp(&video_packet(10, 900, None)))
            .await
            .unwrap();
        skt.clear();
        conn.on_rtp(&encrypt_rtp(&video_packet(13, 900, None)))
            .await
            .unwrap();

        // A generic NACK for 11 and 12 went out, SRTCP protected.
        let nack = skt
            .sent()
            .into_iter()
            .find(|wire| {
                wire.ends_with(testing::SRTP_RTCP_TAG)
                    && wire.len() >= 20
                    && wire[1] == rtcp::PT_RTPFB
            })
            .expect("nack packet");
        let plain = &nack[..nack.len() - 4];
        let (header, fci) = parse_fb_header(plain).unwrap();
        assert_eq!(header.fmt, rtcp::RTPFB_FMT_NACK);
        assert_eq!(header.media_ssrc, 900);
        let (pid, blp) = crate::rtcp::feedback::parse_nack_fci(fci).unwrap();
        assert_eq!(crate::rtcp::nack_sequences(pid, blp), vec![11, 12]);

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_sender_report_updates_track() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        let mut sr = BytesMut::new();
        sr.put_u8(0x80);
        sr.put_u8(PT_SR);
        sr.put_u16(6);
        sr.put_u32(900);
        sr.put_u64(NtpTime::from_unix_micros(1_000_000).as_u64());
        sr.put_u32(90_000);
        sr.put_u32(50);
        sr.put_u32(40_000);

        publisher.on_rtcp(&sr).await.unwrap();
        assert_eq!(read(&conn.stats().nn_sr), 1);

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_xr_dlrr_yields_rtt() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        // lrr one second in the past, no holding delay: rtt == 1000 ms.
        let lrr = NtpTime::now().compact().wrapping_sub(0x0001_0000);
        let mut xr = BytesMut::new();
        xr.put_u8(0x80);
        xr.put_u8(PT_XR);
        xr.put_u16(5);
        xr.put_u32(1);
        xr.put_u8(5);
        xr.put_u8(0);
        xr.put_u16(3);
        xr.put_u32(900);
        xr.put_u32(lrr);
        xr.put_u32(0);

        publisher.on_rtcp(&xr).await.unwrap();

        let rtt = publisher.track_rtt(900).unwrap();
        assert!((1000..1010).contains(&rtt), "rtt={}", rtt);

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_unknown_rtcp_type_aborts_compound() {
        let env = testing::test_env(testing::default_config());
        let (conn, _skt) = testing::established_publisher(&env).await;
        let publisher = conn.publisher().unwrap();

        let bad = [0x80u8, 198, 0, 1, 0, 0, 0, 9];
        let err = publisher.on_rtcp(&bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RtcpCheck);

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_report_timer_emits_rr_and_xr() {
        let env = testing::test_env(testing::default_config());
        let (conn, skt) = testing::established_publisher(&env).await;

        // The first tick fires immediately after start: one RR and one XR
        // per track (audio 800, video 900), SRTCP protected, after the
        // binding response and the DTLS flight.
        testing::wait_for_sends(&skt, 6).await;
        let rtcp: Vec<_> = skt
            .sent()
            .into_iter()
            .filter(|w| w.ends_with(testing::SRTP_RTCP_TAG))
            .collect();
        assert!(rtcp.len() >= 4);
        assert!(rtcp.iter().any(|w| w[1] == rtcp::PT_RR));
        assert!(rtcp.iter().any(|w| w[1] == rtcp::PT_XR));

        conn.dispose().await;
    }
}
