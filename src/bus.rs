//! Media bus interface
//!
//! The in-process stream bus is an external collaborator: publishers push
//! decoded RTP packets into a source, players drain them through consumers.
//! The traits below are the surface the session core requires; `LocalHub`
//! is a bounded-queue reference implementation used by tests and simple
//! embedders.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{ErrorKind, Result, RtcError};
use crate::rtp::{MediaKind, RtpPacket};
use crate::server::env::StreamRequest;
use crate::track::description::{StreamDescription, TrackDescription};

/// The slice of a publish stream the bus exposes to other sessions
///
/// A player that receives a PLI resolves the publisher through its source
/// and requests a keyframe on the publish-side SSRC.
pub trait PublishStreamOps: Send + Sync {
    /// Ask the publisher to solicit a keyframe for one of its SSRCs
    fn request_keyframe(&self, ssrc: u32);
}

/// Looks up or creates sources by stream request
pub trait SourceHub: Send + Sync {
    /// Fetch the source for a stream, creating it on first use
    fn fetch_or_create(&self, req: &StreamRequest) -> Result<Arc<dyn Source>>;
}

/// One published stream on the bus
pub trait Source: Send + Sync {
    /// Stable id of this source
    fn source_id(&self) -> String;

    /// Attach a new consumer
    fn create_consumer(&self) -> Result<Box<dyn Consumer>>;

    /// Seed a fresh consumer with cached catch-up packets
    fn consumer_dumps(&self, consumer: &mut dyn Consumer) -> Result<()>;

    /// A publisher became active
    fn on_publish(&self) -> Result<()>;

    /// The publisher went away
    fn on_unpublish(&self);

    /// Attach or detach the active publish stream
    fn set_publish_stream(&self, publisher: Option<Weak<dyn PublishStreamOps>>);

    /// The active publish stream, if any
    fn publish_stream(&self) -> Option<Arc<dyn PublishStreamOps>>;

    /// Store the negotiated stream description
    fn set_stream_desc(&self, desc: StreamDescription);

    /// The published track descriptions of one kind and codec
    fn get_track_desc(&self, kind: MediaKind, codec: &str) -> Vec<TrackDescription>;

    /// Push one decoded packet to all consumers
    fn on_rtp(&self, pkt: RtpPacket) -> Result<()>;
}

/// Drains packets from a source
#[async_trait]
pub trait Consumer: Send {
    /// Suspend until at least `n` packets are queued
    async fn wait(&mut self, n: usize);

    /// Move all queued packets into `out`
    fn dump_packets(&mut self, out: &mut Vec<RtpPacket>);
}

/// Default consumer queue bound
const CONSUMER_QUEUE_CAP: usize = 512;

#[derive(Debug, Default)]
struct ConsumerShared {
    queue: Mutex<VecDeque<RtpPacket>>,
    notify: Notify,
}

impl ConsumerShared {
    fn push(&self, pkt: RtpPacket, cap: usize) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= cap {
            queue.pop_front();
        }
        queue.push_back(pkt);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Bounded-queue consumer of a [`LocalSource`]
pub struct LocalConsumer {
    shared: Arc<ConsumerShared>,
}

#[async_trait]
impl Consumer for LocalConsumer {
    async fn wait(&mut self, n: usize) {
        let need = n.max(1);
        loop {
            let notified = self.shared.notify.notified();
            if self.shared.queue.lock().unwrap().len() >= need {
                return;
            }
            notified.await;
        }
    }

    fn dump_packets(&mut self, out: &mut Vec<RtpPacket>) {
        let mut queue = self.shared.queue.lock().unwrap();
        out.extend(queue.drain(..));
    }
}

#[derive(Default)]
struct LocalSourceInner {
    consumers: Vec<Weak<ConsumerShared>>,
    publishing: bool,
}

/// In-process source with bounded per-consumer queues; overflow drops the
/// oldest packet
pub struct LocalSource {
    id: String,
    queue_cap: usize,
    inner: Mutex<LocalSourceInner>,
    publisher: Mutex<Option<Weak<dyn PublishStreamOps>>>,
    stream_desc: Mutex<Option<StreamDescription>>,
}

impl LocalSource {
    /// Create a source for a stream url
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue_cap: CONSUMER_QUEUE_CAP,
            inner: Mutex::new(LocalSourceInner::default()),
            publisher: Mutex::new(None),
            stream_desc: Mutex::new(None),
        }
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.consumers.retain(|c| c.strong_count() > 0);
        inner.consumers.len()
    }
}

impl Source for LocalSource {
    fn source_id(&self) -> String {
        self.id.clone()
    }

    fn create_consumer(&self) -> Result<Box<dyn Consumer>> {
        let shared = Arc::new(ConsumerShared::default());
        let mut inner = self.inner.lock().unwrap();
        inner.consumers.push(Arc::downgrade(&shared));
        Ok(Box::new(LocalConsumer { shared }))
    }

    fn consumer_dumps(&self, _consumer: &mut dyn Consumer) -> Result<()> {
        // No gop cache here; fresh consumers start from live packets.
        Ok(())
    }

    fn on_publish(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.publishing {
            return Err(RtcError::new(
                ErrorKind::StreamDesc,
                format!("stream {} already publishing", self.id),
            ));
        }
        inner.publishing = true;
        tracing::info!(source = %self.id, "publish started");
        Ok(())
    }

    fn on_unpublish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.publishing = false;
        tracing::info!(source = %self.id, "publish stopped");
    }

    fn set_publish_stream(&self, publisher: Option<Weak<dyn PublishStreamOps>>) {
        *self.publisher.lock().unwrap() = publisher;
    }

    fn publish_stream(&self) -> Option<Arc<dyn PublishStreamOps>> {
        self.publisher
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn set_stream_desc(&self, desc: StreamDescription) {
        *self.stream_desc.lock().unwrap() = Some(desc);
    }

    fn get_track_desc(&self, kind: MediaKind, codec: &str) -> Vec<TrackDescription> {
        let desc = self.stream_desc.lock().unwrap();
        let Some(desc) = desc.as_ref() else {
            return Vec::new();
        };

        let matches = |track: &TrackDescription| {
            track
                .media
                .as_ref()
                .map(|m| m.attrs().encoding_name.eq_ignore_ascii_case(codec))
                .unwrap_or(false)
        };

        match kind {
            MediaKind::Audio => desc
                .audio_track
                .iter()
                .filter(|t| matches(t))
                .cloned()
                .collect(),
            MediaKind::Video => desc
                .video_tracks
                .iter()
                .filter(|t| matches(t))
                .cloned()
                .collect(),
        }
    }

    fn on_rtp(&self, pkt: RtpPacket) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.consumers.retain(|weak| {
            if let Some(shared) = weak.upgrade() {
                shared.push(pkt.clone(), self.queue_cap);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// In-process source hub keyed by stream url
#[derive(Default)]
pub struct LocalHub {
    sources: Mutex<HashMap<String, Arc<LocalSource>>>,
}

impl LocalHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceHub for LocalHub {
    fn fetch_or_create(&self, req: &StreamRequest) -> Result<Arc<dyn Source>> {
        let mut sources = self.sources.lock().unwrap();
        let source = sources
            .entry(req.stream_url())
            .or_insert_with(|| Arc::new(LocalSource::new(req.stream_url())));
        Ok(Arc::clone(source) as Arc<dyn Source>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpHeader, RtpPayload};
    use bytes::Bytes;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::new(
            RtpHeader {
                sequence: seq,
                ssrc: 9,
                ..Default::default()
            },
            MediaKind::Audio,
            RtpPayload::Raw(Bytes::from_static(&[1, 2])),
        )
    }

    #[tokio::test]
    async fn test_publish_consume_roundtrip() {
        let hub = LocalHub::new();
        let req = StreamRequest::new("v", "live", "s");
        let source = hub.fetch_or_create(&req).unwrap();
        let same = hub.fetch_or_create(&req).unwrap();
        assert_eq!(source.source_id(), same.source_id());

        let mut consumer = source.create_consumer().unwrap();
        source.on_rtp(packet(1)).unwrap();
        source.on_rtp(packet(2)).unwrap();

        consumer.wait(2).await;
        let mut out = Vec::new();
        consumer.dump_packets(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].header.sequence, 1);
        assert_eq!(out[1].header.sequence, 2);
    }

    #[tokio::test]
    async fn test_double_publish_rejected() {
        let source = LocalSource::new("v/live/s");
        source.on_publish().unwrap();
        assert!(source.on_publish().is_err());

        source.on_unpublish();
        assert!(source.on_publish().is_ok());
    }

    #[tokio::test]
    async fn test_dead_consumer_is_dropped() {
        let source = LocalSource::new("v/live/s");
        let consumer = source.create_consumer().unwrap();
        assert_eq!(source.consumer_count(), 1);

        drop(consumer);
        source.on_rtp(packet(1)).unwrap();
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn test_get_track_desc_by_codec() {
        use crate::track::description::{CodecAttrs, MediaPayload, TrackDescription};

        let source = LocalSource::new("v/live/s");
        let mut desc = StreamDescription::default();
        let mut audio = TrackDescription::new(MediaKind::Audio);
        audio.ssrc = 1;
        audio.media = Some(MediaPayload::Audio {
            attrs: CodecAttrs {
                pt: 111,
                encoding_name: "opus".to_string(),
                clock_rate: 48_000,
                ..Default::default()
            },
            channels: 2,
        });
        desc.audio_track = Some(audio);
        source.set_stream_desc(desc);

        assert_eq!(source.get_track_desc(MediaKind::Audio, "opus").len(), 1);
        assert_eq!(source.get_track_desc(MediaKind::Audio, "isac").len(), 0);
        assert_eq!(source.get_track_desc(MediaKind::Video, "H264").len(), 0);
    }
}
