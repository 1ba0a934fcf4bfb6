//! Server environment
//!
//! Capabilities the session core consumes but does not implement: the media
//! bus, the peer-id session index, the optional hijacker hook and the
//! blackhole diagnostic sink. They travel together in a [`ServerEnv`]
//! injected at connection construction, so the core never reaches for
//! process globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;

use crate::bus::SourceHub;
use crate::error::Result;
use crate::rtp::RtpPacket;
use crate::server::config::ConfigProvider;

/// Identifies one stream within a vhost
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamRequest {
    /// Virtual host
    pub vhost: String,
    /// Application name
    pub app: String,
    /// Stream name
    pub stream: String,
}

impl StreamRequest {
    /// Create a new request
    pub fn new(
        vhost: impl Into<String>,
        app: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            stream: stream.into(),
        }
    }

    /// Stream URL used as the bus key
    pub fn stream_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

impl std::fmt::Display for StreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stream_url())
    }
}

/// Index mapping peer ids (`ip:port`) to session context ids
///
/// Consulted on STUN address migration: the session detaches from the old
/// peer id and registers the new one so the UDP demultiplexer keeps routing
/// datagrams to it.
pub trait SessionRegistry: Send + Sync {
    /// Register a peer id for a session
    fn register_peer(&self, peer_id: &str, session_id: &str);

    /// Remove a peer id
    fn unregister_peer(&self, peer_id: &str);

    /// Look up the session owning a peer id
    fn lookup(&self, peer_id: &str) -> Option<String>;
}

/// In-memory session index
#[derive(Debug, Default)]
pub struct MemorySessionRegistry {
    peers: Mutex<HashMap<String, String>>,
}

impl MemorySessionRegistry {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for MemorySessionRegistry {
    fn register_peer(&self, peer_id: &str, session_id: &str) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(peer_id.to_string(), session_id.to_string());
    }

    fn unregister_peer(&self, peer_id: &str) {
        let mut peers = self.peers.lock().unwrap();
        peers.remove(peer_id);
    }

    fn lookup(&self, peer_id: &str) -> Option<String> {
        let peers = self.peers.lock().unwrap();
        peers.get(peer_id).cloned()
    }
}

/// Optional hook observing session lifecycle and ingest packets
#[async_trait]
pub trait SessionHook: Send + Sync {
    /// A publisher started on this stream
    async fn on_start_publish(&self, _req: &StreamRequest) -> Result<()> {
        Ok(())
    }

    /// A player started on this stream
    async fn on_start_play(&self, _req: &StreamRequest) -> Result<()> {
        Ok(())
    }

    /// A player attached its consumer and is about to drain
    async fn on_start_consume(&self, _req: &StreamRequest) -> Result<()> {
        Ok(())
    }

    /// A decoded ingest packet, delivered as a copy
    async fn on_rtp_packet(&self, _req: &StreamRequest, _pkt: RtpPacket) -> Result<()> {
        Ok(())
    }
}

/// Diagnostic sink mirroring interesting datagrams (plaintext RTP, RTCP,
/// STUN, DTLS) to an external collector
pub trait DiagnosticSink: Send + Sync {
    /// Mirror one datagram; failures are ignored
    fn sendto(&self, data: &[u8]);
}

/// Merge-group membership for video tracks
///
/// Tracks in one group share a single outbound SSRC and switch between one
/// another on keyframe boundaries. Maps member track ids to the merged id;
/// unknown ids map to themselves.
#[derive(Debug, Default, Clone)]
pub struct TrackIdGroups {
    groups: HashMap<String, String>,
}

impl TrackIdGroups {
    /// Create an empty group map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member track id to a merge group
    pub fn with_member(mut self, member: impl Into<String>, merged: impl Into<String>) -> Self {
        self.groups.insert(member.into(), merged.into());
        self
    }

    /// The merged track id for a member; identity for non-members
    pub fn merged_id<'a>(&'a self, track_id: &'a str) -> &'a str {
        self.groups
            .get(track_id)
            .map(String::as_str)
            .unwrap_or(track_id)
    }

    /// Whether the track id belongs to a merge group
    pub fn is_member(&self, track_id: &str) -> bool {
        self.groups.contains_key(track_id)
    }
}

/// Allocates server-unique SSRCs for negotiated play tracks
#[derive(Debug)]
pub struct SsrcAllocator {
    next: AtomicU32,
}

impl SsrcAllocator {
    /// Create an allocator with a randomized base
    pub fn new() -> Self {
        let base = rand::thread_rng().gen_range(0x1000_0000u32..0x2000_0000u32);
        Self::with_base(base)
    }

    /// Create an allocator at a fixed base
    pub fn with_base(base: u32) -> Self {
        Self {
            next: AtomicU32::new(base),
        }
    }

    /// Allocate the next SSRC
    pub fn generate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SsrcAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The capability set a connection runs against
#[derive(Clone)]
pub struct ServerEnv {
    /// Configuration store
    pub config: Arc<dyn ConfigProvider>,

    /// Media bus
    pub sources: Arc<dyn SourceHub>,

    /// Peer-id session index
    pub sessions: Arc<dyn SessionRegistry>,

    /// Merge-group membership for stream switching
    pub groups: Arc<TrackIdGroups>,

    /// SSRC allocator for play negotiation
    pub ssrc: Arc<SsrcAllocator>,

    /// Optional lifecycle and packet hook
    pub hook: Option<Arc<dyn SessionHook>>,

    /// Optional diagnostic sink
    pub blackhole: Option<Arc<dyn DiagnosticSink>>,
}

impl ServerEnv {
    /// Create an environment over a config store and a media bus,
    /// with in-memory defaults for the remaining capabilities
    pub fn new(config: Arc<dyn ConfigProvider>, sources: Arc<dyn SourceHub>) -> Self {
        Self {
            config,
            sources,
            sessions: Arc::new(MemorySessionRegistry::new()),
            groups: Arc::new(TrackIdGroups::new()),
            ssrc: Arc::new(SsrcAllocator::new()),
            hook: None,
            blackhole: None,
        }
    }

    /// Replace the session index
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Set the merge-group map
    pub fn with_groups(mut self, groups: TrackIdGroups) -> Self {
        self.groups = Arc::new(groups);
        self
    }

    /// Install a lifecycle hook
    pub fn with_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Install a diagnostic sink
    pub fn with_blackhole(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.blackhole = Some(sink);
        self
    }

    /// Mirror a datagram to the diagnostic sink when one is installed
    pub fn mirror(&self, data: &[u8]) {
        if let Some(sink) = &self.blackhole {
            sink.sendto(data);
        }
    }
}
