//! SDP capability negotiation
//!
//! Publish negotiation walks the remote offer and produces the recvonly
//! stream description the ingest pipeline runs on. Play negotiation copies
//! the published descriptions, flips them to sendonly, assigns fresh local
//! SSRCs (merge-group members share one) and filters feedback capabilities
//! by local config. Answer generation emits the model the external SDP
//! serializer turns into text.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{ErrorKind, Result, RtcError};
use crate::rtp::{MediaKind, EXT_URI_PICTURE_ID, EXT_URI_TWCC};
use crate::sdp::{
    parse_h264_fmtp, Direction, MediaDesc, MediaPayloadType, Sdp, SsrcGroup, SsrcInfo,
};
use crate::server::env::{ServerEnv, StreamRequest};
use crate::track::description::{
    AuxKind, AuxPayload, CodecAttrs, MediaPayload, StreamDescription, TrackDescription,
};

/// Origin username written into generated answers
const ANSWER_USERNAME: &str = concat!("rtc-rs/", env!("CARGO_PKG_VERSION"));

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate fresh ICE credentials for a local answer
pub fn generate_ice_credentials() -> (String, String) {
    (random_token(4), random_token(24))
}

fn filtered_fbs(
    offered: &[String],
    nack_enabled: bool,
    twcc_enabled: bool,
) -> Vec<String> {
    offered
        .iter()
        .filter(|fb| {
            (nack_enabled && (fb.as_str() == "nack" || fb.as_str() == "nack pli"))
                || (twcc_enabled && fb.as_str() == "transport-cc")
        })
        .cloned()
        .collect()
}

fn aux_payloads_from(desc: &MediaDesc) -> Vec<AuxPayload> {
    let mut aux = Vec::new();
    for name in ["red", "rtx", "ulpfec", "rsfec"] {
        if let Some(pt) = desc.find_media_with_encoding_name(name).first() {
            aux.push(AuxPayload {
                kind: AuxKind::from_encoding_name(name).unwrap(),
                pt: pt.payload_type,
                format_param: pt.format_specific_param.clone(),
            });
        }
    }
    aux
}

/// Build the recvonly stream description from a publish offer
pub fn negotiate_publish_capability(
    env: &ServerEnv,
    req: &StreamRequest,
    remote_sdp: &Sdp,
) -> Result<StreamDescription> {
    let nack_enabled = env.config.nack_enabled(&req.vhost);
    let twcc_enabled = env.config.twcc_enabled(&req.vhost);

    let mut stream_desc = StreamDescription::default();

    for remote_media in &remote_sdp.media_descs {
        let mut template = TrackDescription::new(remote_media.kind);
        template.direction = Direction::RecvOnly;
        template.mid = remote_media.mid.clone();

        let remote_twcc_id = remote_media.extmap_id(EXT_URI_TWCC);
        let picture_id = remote_media.extmap_id(EXT_URI_PICTURE_ID);

        if twcc_enabled {
            if let Some(id) = remote_twcc_id {
                template.add_extension(id, EXT_URI_TWCC);
            }
        }
        if let Some(id) = picture_id {
            template.add_extension(id, EXT_URI_PICTURE_ID);
        }

        let twcc_usable = twcc_enabled && remote_twcc_id.is_some();

        if remote_media.is_audio() {
            let payloads = remote_media.find_media_with_encoding_name("opus");
            let payload = payloads.first().ok_or_else(|| {
                RtcError::new(ErrorKind::SdpExchange, "no valid opus payload type found")
            })?;

            template.media = Some(MediaPayload::Audio {
                attrs: CodecAttrs {
                    pt: payload.payload_type,
                    encoding_name: payload.encoding_name.clone(),
                    clock_rate: payload.clock_rate,
                    rtcp_fbs: filtered_fbs(&payload.rtcp_fb, nack_enabled, twcc_usable),
                    format_param: payload.format_specific_param.clone(),
                },
                channels: payload.encoding_param.parse().unwrap_or(2),
            });
        } else {
            let payloads = remote_media.find_media_with_encoding_name("H264");
            if payloads.is_empty() {
                return Err(RtcError::new(
                    ErrorKind::SdpExchange,
                    "no valid H.264 payload type found",
                ));
            }

            // Prefer the payload with packetization-mode=1 and
            // level-asymmetry-allowed=1; fall back to the first offered.
            let preferred = payloads.iter().find(|p| {
                parse_h264_fmtp(&p.format_specific_param)
                    .map(|param| {
                        param.packetization_mode == "1" && param.level_asymmetry_allowed == "1"
                    })
                    .unwrap_or(false)
            });
            let payload = match preferred {
                Some(p) => *p,
                None => {
                    tracing::warn!(
                        pt = payloads[0].payload_type,
                        "choose backup H.264 payload type"
                    );
                    payloads[0]
                }
            };

            template.media = Some(MediaPayload::Video {
                attrs: CodecAttrs {
                    pt: payload.payload_type,
                    encoding_name: payload.encoding_name.clone(),
                    clock_rate: payload.clock_rate,
                    rtcp_fbs: filtered_fbs(&payload.rtcp_fb, nack_enabled, twcc_usable),
                    format_param: payload.format_specific_param.clone(),
                },
            });
        }

        template.aux = aux_payloads_from(remote_media);

        // One track per distinct msid track id in the ssrc descriptions.
        let mut last_track_id = String::new();
        for info in &remote_media.ssrc_infos {
            if info.msid_tracker != last_track_id {
                let mut track = template.clone();
                track.ssrc = info.ssrc;
                track.id = info.msid_tracker.clone();
                track.msid = info.msid.clone();

                if remote_media.is_audio() && stream_desc.audio_track.is_none() {
                    stream_desc.audio_track = Some(track);
                } else if remote_media.is_video() {
                    stream_desc.video_tracks.push(track);
                }
            }
            last_track_id = info.msid_tracker.clone();
        }

        // Cross-reference ssrc groups onto the tracks they belong to.
        for group in &remote_media.ssrc_groups {
            if group.ssrcs.len() < 2 {
                continue;
            }
            if let Some(track) = stream_desc.find_track_by_ssrc_mut(group.ssrcs[0]) {
                match group.semantic.as_str() {
                    "FID" => track.rtx_ssrc = Some(group.ssrcs[1]),
                    "FEC" => track.fec_ssrc = Some(group.ssrcs[1]),
                    _ => {}
                }
            }
        }
    }

    stream_desc.validate()?;
    Ok(stream_desc)
}

fn media_payload_type(media: &MediaPayload) -> MediaPayloadType {
    let attrs = media.attrs();
    MediaPayloadType {
        payload_type: attrs.pt,
        encoding_name: attrs.encoding_name.clone(),
        clock_rate: attrs.clock_rate,
        encoding_param: match media {
            MediaPayload::Audio { channels, .. } => channels.to_string(),
            MediaPayload::Video { .. } => String::new(),
        },
        rtcp_fb: attrs.rtcp_fbs.clone(),
        format_specific_param: attrs.format_param.clone(),
    }
}

fn aux_payload_type(aux: &AuxPayload, clock_rate: u32) -> MediaPayloadType {
    MediaPayloadType {
        payload_type: aux.pt,
        encoding_name: match aux.kind {
            AuxKind::Red => "red",
            AuxKind::Rtx => "rtx",
            AuxKind::Ulpfec => "ulpfec",
            AuxKind::Rsfec => "rsfec",
        }
        .to_string(),
        clock_rate,
        encoding_param: String::new(),
        rtcp_fb: Vec::new(),
        format_specific_param: aux.format_param.clone(),
    }
}

fn answer_skeleton(req: &StreamRequest, session_name: &str) -> Sdp {
    let (ice_ufrag, ice_pwd) = generate_ice_credentials();
    Sdp {
        username: ANSWER_USERNAME.to_string(),
        session_id: rand::thread_rng().gen_range(1_000_000u64..u64::MAX).to_string(),
        session_name: session_name.to_string(),
        msid_semantic: "WMS".to_string(),
        msids: vec![format!("{}/{}", req.app, req.stream)],
        group_policy: "BUNDLE".to_string(),
        ice_ufrag,
        ice_pwd,
        ..Default::default()
    }
}

fn answer_media_desc(track: &TrackDescription) -> MediaDesc {
    let mut desc = MediaDesc::new(track.kind);
    desc.port = 9;
    desc.protos = "UDP/TLS/RTP/SAVPF".to_string();
    desc.rtcp_mux = true;
    desc.rtcp_rsize = true;
    desc.mid = track.mid.clone();
    desc.direction = track.direction;
    desc.extmaps = track.extmaps.clone();

    if let Some(media) = &track.media {
        let clock_rate = media.attrs().clock_rate;
        if let Some(red) = track.aux_payload(AuxKind::Red) {
            desc.payload_types.push(aux_payload_type(red, clock_rate));
        }
        desc.payload_types.push(media_payload_type(media));
        if let Some(rsfec) = track.aux_payload(AuxKind::Rsfec) {
            desc.payload_types.push(aux_payload_type(rsfec, clock_rate));
        }
    }

    desc
}

fn push_ssrc_entries(desc: &mut MediaDesc, track: &TrackDescription, cname: &str) {
    desc.ssrc_infos.push(SsrcInfo {
        ssrc: track.ssrc,
        cname: cname.to_string(),
        msid: track.msid.clone(),
        msid_tracker: track.id.clone(),
    });

    if let Some(rtx_ssrc) = track.rtx_ssrc {
        desc.ssrc_groups.push(SsrcGroup {
            semantic: "FID".to_string(),
            ssrcs: vec![track.ssrc, rtx_ssrc],
        });
        desc.ssrc_infos.push(SsrcInfo {
            ssrc: rtx_ssrc,
            cname: cname.to_string(),
            msid: track.msid.clone(),
            msid_tracker: track.id.clone(),
        });
    }

    if let Some(fec_ssrc) = track.fec_ssrc {
        desc.ssrc_groups.push(SsrcGroup {
            semantic: "FEC".to_string(),
            ssrcs: vec![track.ssrc, fec_ssrc],
        });
        desc.ssrc_infos.push(SsrcInfo {
            ssrc: fec_ssrc,
            cname: cname.to_string(),
            msid: track.msid.clone(),
            msid_tracker: track.id.clone(),
        });
    }
}

/// Generate the local answer for a publish offer
pub fn generate_publish_local_sdp(
    req: &StreamRequest,
    stream_desc: &StreamDescription,
) -> Result<Sdp> {
    let mut sdp = answer_skeleton(req, "RtcPublishSession");

    if let Some(audio) = &stream_desc.audio_track {
        let desc = answer_media_desc(audio);
        sdp.groups.push(desc.mid.clone());
        sdp.media_descs.push(desc);
    }

    // One video section carries the media description for all video tracks.
    if let Some(video) = stream_desc.video_tracks.first() {
        let desc = answer_media_desc(video);
        sdp.groups.push(desc.mid.clone());
        sdp.media_descs.push(desc);
    }

    Ok(sdp)
}

/// Negotiate play capability against a remote offer
///
/// Returns the map from publish SSRC to the sendonly track description the
/// player will serve it on.
pub fn negotiate_play_capability(
    env: &ServerEnv,
    req: &StreamRequest,
    remote_sdp: &Sdp,
) -> Result<HashMap<u32, TrackDescription>> {
    let nack_enabled = env.config.nack_enabled(&req.vhost);
    let twcc_enabled = env.config.twcc_enabled(&req.vhost);

    let source = env
        .sources
        .fetch_or_create(req)
        .map_err(|e| e.wrap("fetch rtc source"))?;

    // Tracks in the same merge group share one generated SSRC.
    let merged_track_ssrc = env.ssrc.generate();
    let mut sub_relations = HashMap::new();

    for remote_media in &remote_sdp.media_descs {
        let remote_twcc_id = remote_media.extmap_id(EXT_URI_TWCC);

        let track_descs = if remote_media.is_audio() {
            if remote_media.find_media_with_encoding_name("opus").is_empty() {
                return Err(RtcError::new(
                    ErrorKind::SdpExchange,
                    "no valid opus payload type found",
                ));
            }
            source.get_track_desc(MediaKind::Audio, "opus")
        } else {
            if remote_media.find_media_with_encoding_name("H264").is_empty() {
                return Err(RtcError::new(
                    ErrorKind::SdpExchange,
                    "no valid H.264 payload type found",
                ));
            }
            source.get_track_desc(MediaKind::Video, "H264")
        };

        for published in track_descs {
            let mut track = published.clone();
            track.mid = remote_media.mid.clone();
            let publish_ssrc = track.ssrc;

            let twcc_usable = twcc_enabled && remote_twcc_id.is_some();
            track.filter_rtcp_fbs(nack_enabled, twcc_usable);
            track.extmaps.clear();
            if let Some(id) = remote_twcc_id {
                if twcc_enabled {
                    track.add_extension(id, EXT_URI_TWCC);
                }
            }

            track.ssrc = if env.groups.is_member(&track.id) {
                merged_track_ssrc
            } else {
                env.ssrc.generate()
            };

            // Downlink RTX is not supported.
            track.drop_rtx();
            track.fec_ssrc = None;

            track.direction = Direction::SendOnly;
            sub_relations.insert(publish_ssrc, track);
        }
    }

    Ok(sub_relations)
}

/// Build play relations purely from the source's published capability
pub fn fetch_source_capability(
    env: &ServerEnv,
    req: &StreamRequest,
) -> Result<HashMap<u32, TrackDescription>> {
    let nack_enabled = env.config.nack_enabled(&req.vhost);
    let twcc_enabled = env.config.twcc_enabled(&req.vhost);

    let source = env
        .sources
        .fetch_or_create(req)
        .map_err(|e| e.wrap("fetch rtc source"))?;

    let merged_track_ssrc = env.ssrc.generate();
    let mut sub_relations = HashMap::new();

    let mut track_descs = source.get_track_desc(MediaKind::Audio, "opus");
    track_descs.extend(source.get_track_desc(MediaKind::Video, "H264"));

    for published in track_descs {
        let mut track = published.clone();
        let publish_ssrc = track.ssrc;

        let local_twcc_id = track.extension_id(EXT_URI_TWCC);
        let twcc_usable = twcc_enabled && local_twcc_id.is_some();
        track.filter_rtcp_fbs(nack_enabled, twcc_usable);
        let picture_id = track.extension_id(EXT_URI_PICTURE_ID);
        track.extmaps.clear();
        if twcc_usable {
            track.add_extension(local_twcc_id.unwrap(), EXT_URI_TWCC);
        }
        if let Some(id) = picture_id {
            track.add_extension(id, EXT_URI_PICTURE_ID);
        }

        track.ssrc = if env.groups.is_member(&track.id) {
            merged_track_ssrc
        } else {
            env.ssrc.generate()
        };

        track.drop_rtx();
        track.fec_ssrc = None;

        track.direction = Direction::SendOnly;
        sub_relations.insert(publish_ssrc, track);
    }

    Ok(sub_relations)
}

/// Generate the local answer for a play session
///
/// Players collapse merge-group members into a single `m=` entry by
/// rewriting member ids to the merged track id.
pub fn generate_play_local_sdp(
    env: &ServerEnv,
    req: &StreamRequest,
    stream_desc: &StreamDescription,
) -> Result<Sdp> {
    let mut sdp = answer_skeleton(req, "RtcPlaySession");
    let cname = random_token(16);

    if let Some(audio) = &stream_desc.audio_track {
        let mut desc = answer_media_desc(audio);
        sdp.groups.push(desc.mid.clone());
        push_ssrc_entries(&mut desc, audio, &cname);
        sdp.media_descs.push(desc);
    }

    let mut track_merged = false;
    for (i, track) in stream_desc.video_tracks.iter().enumerate() {
        if i == 0 {
            let desc = answer_media_desc(track);
            sdp.groups.push(desc.mid.clone());
            sdp.media_descs.push(desc);
        }

        let desc = sdp.media_descs.last_mut().unwrap();

        let merged_id = env.groups.merged_id(&track.id);
        if merged_id != track.id {
            if track_merged {
                continue;
            }
            let mut merged = track.clone();
            merged.id = merged_id.to_string();
            push_ssrc_entries(desc, &merged, &cname);
            track_merged = true;
            continue;
        }

        push_ssrc_entries(desc, track, &cname);
    }

    Ok(sdp)
}

/// The TWCC extension id a play session negotiated, if any
pub fn play_twcc_id(sub_relations: &HashMap<u32, TrackDescription>) -> Option<u8> {
    sub_relations
        .values()
        .filter(|t| t.kind == MediaKind::Video)
        .find_map(|t| t.extension_id(EXT_URI_TWCC))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_publish_negotiation_tracks_and_groups() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let offer = testing::publish_offer();

        let desc = negotiate_publish_capability(&env, &req, &offer).unwrap();

        let audio = desc.audio_track.as_ref().unwrap();
        assert_eq!(audio.ssrc, 800);
        assert_eq!(audio.direction, Direction::RecvOnly);
        assert_eq!(audio.media.as_ref().unwrap().pt(), 111);

        assert_eq!(desc.video_tracks.len(), 1);
        let video = &desc.video_tracks[0];
        assert_eq!(video.ssrc, 900);
        assert_eq!(video.rtx_ssrc, Some(901));
        assert_eq!(video.media.as_ref().unwrap().pt(), 102);
        assert_eq!(video.extension_id(EXT_URI_TWCC), Some(3));

        let fbs = &video.media.as_ref().unwrap().attrs().rtcp_fbs;
        assert!(fbs.contains(&"nack".to_string()));
        assert!(fbs.contains(&"transport-cc".to_string()));
        assert!(!fbs.contains(&"goog-remb".to_string()));
    }

    #[test]
    fn test_publish_negotiation_respects_config() {
        let env = testing::test_env(testing::default_config().nack(false).twcc(false));
        let req = testing::test_request();
        let offer = testing::publish_offer();

        let desc = negotiate_publish_capability(&env, &req, &offer).unwrap();
        let video = &desc.video_tracks[0];
        assert!(video.media.as_ref().unwrap().attrs().rtcp_fbs.is_empty());
        assert_eq!(video.extension_id(EXT_URI_TWCC), None);
    }

    #[test]
    fn test_publish_negotiation_prefers_mode_one_h264() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let mut offer = testing::publish_offer();

        // Prepend a payload without the preferred fmtp; negotiation should
        // still pick the packetization-mode=1 one.
        let video = &mut offer.media_descs[1];
        video.payload_types.insert(
            0,
            MediaPayloadType {
                payload_type: 96,
                encoding_name: "H264".to_string(),
                clock_rate: 90_000,
                format_specific_param: "packetization-mode=0".to_string(),
                ..Default::default()
            },
        );

        let desc = negotiate_publish_capability(&env, &req, &offer).unwrap();
        assert_eq!(desc.video_tracks[0].media.as_ref().unwrap().pt(), 102);
    }

    #[test]
    fn test_publish_negotiation_requires_codecs() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let mut offer = testing::publish_offer();
        offer.media_descs[0].payload_types.clear();

        let err = negotiate_publish_capability(&env, &req, &offer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SdpExchange);
    }

    #[test]
    fn test_publish_answer_shape() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();
        let offer = testing::publish_offer();
        let desc = negotiate_publish_capability(&env, &req, &offer).unwrap();

        let answer = generate_publish_local_sdp(&req, &desc).unwrap();
        assert_eq!(answer.group_policy, "BUNDLE");
        assert_eq!(answer.groups, vec!["0".to_string(), "1".to_string()]);
        assert_eq!(answer.media_descs.len(), 2);
        assert!(!answer.ice_pwd.is_empty());

        let video = &answer.media_descs[1];
        assert_eq!(video.port, 9);
        assert_eq!(video.protos, "UDP/TLS/RTP/SAVPF");
        assert!(video.rtcp_mux);
        assert!(video.rtcp_rsize);
        assert_eq!(video.direction, Direction::RecvOnly);
    }

    #[test]
    fn test_play_negotiation_assigns_fresh_ssrcs() {
        let env = testing::test_env(testing::default_config());
        let req = testing::test_request();

        testing::seed_published_source(&env, &req);

        let offer = testing::publish_offer();
        let relations = negotiate_play_capability(&env, &req, &offer).unwrap();
        assert_eq!(relations.len(), 2);

        let video = relations.get(&900).unwrap();
        assert_eq!(video.direction, Direction::SendOnly);
        assert_ne!(video.ssrc, 900);
        assert!(video.rtx_ssrc.is_none());

        let audio = relations.get(&800).unwrap();
        assert_ne!(audio.ssrc, 800);
        assert_ne!(audio.ssrc, video.ssrc);
    }

    #[test]
    fn test_merge_group_members_share_ssrc() {
        let groups = crate::server::env::TrackIdGroups::new()
            .with_member("cam_small", "cam")
            .with_member("cam_large", "cam");
        let env = testing::test_env(testing::default_config()).with_groups(groups);
        let req = testing::test_request();

        testing::seed_published_source_with_layers(&env, &req);

        let relations = fetch_source_capability(&env, &req).unwrap();
        let small = relations.get(&900).unwrap();
        let large = relations.get(&910).unwrap();
        assert_eq!(small.ssrc, large.ssrc);

        // The play answer collapses the pair into one ssrc entry under the
        // merged id.
        let mut stream_desc = StreamDescription::default();
        for track in relations.values() {
            if track.kind == MediaKind::Video {
                stream_desc.video_tracks.push(track.clone());
            }
        }
        let answer = generate_play_local_sdp(&env, &req, &stream_desc).unwrap();
        let video = &answer.media_descs[0];
        assert_eq!(video.ssrc_infos.len(), 1);
        assert_eq!(video.ssrc_infos[0].msid_tracker, "cam");
    }
}
