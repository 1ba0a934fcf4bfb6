//! Session configuration
//!
//! The configuration store itself lives outside the core; the core only
//! recognizes the keys below, resolved per vhost.

use std::time::Duration;

/// Configuration keys that alter core behavior, resolved per vhost
pub trait ConfigProvider: Send + Sync {
    /// Enable NACK handling: ARQ response on the play path and
    /// NACK-feedback emission on the publish path
    fn nack_enabled(&self, vhost: &str) -> bool;

    /// Enable TWCC header-extension registration and feedback emission
    fn twcc_enabled(&self, vhost: &str) -> bool;

    /// Enable installation of the congestion controller on the egress side
    fn gcc_enabled(&self, vhost: &str) -> bool;

    /// Drop received packets matching this payload type (0 = disabled)
    fn drop_for_pt(&self, vhost: &str) -> u16;

    /// Realtime mode disables egress batching
    fn realtime_enabled(&self, vhost: &str) -> bool;

    /// Number of packets to batch before draining the consumer
    fn mw_msgs(&self, vhost: &str, realtime: bool) -> usize;

    /// Inactivity budget without a STUN binding request before the
    /// session is closed
    fn stun_timeout(&self, vhost: &str) -> Duration;

    /// Reject peers claiming the ice-controlled role (we are ice-lite)
    fn stun_strict_check(&self, vhost: &str) -> bool;

    /// Enable per-packet performance counter updates
    fn server_perf_stat(&self) -> bool;
}

/// Fixed configuration, ignoring the vhost key
///
/// Embedders with a real config store implement [`ConfigProvider`] over it;
/// this is the default used by tests and simple deployments.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// NACK handling enabled
    pub nack_enabled: bool,

    /// TWCC negotiation and feedback enabled
    pub twcc_enabled: bool,

    /// Congestion controller on the egress side
    pub gcc_enabled: bool,

    /// Payload type to drop on ingest (0 = disabled)
    pub drop_for_pt: u16,

    /// Realtime mode (no egress batching)
    pub realtime: bool,

    /// Egress batch count when not in realtime mode
    pub mw_msgs: usize,

    /// STUN inactivity budget
    pub stun_timeout: Duration,

    /// Reject ice-controlled peers
    pub stun_strict_check: bool,

    /// Per-packet counter updates
    pub perf_stat: bool,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            nack_enabled: true,
            twcc_enabled: true,
            gcc_enabled: false,
            drop_for_pt: 0,
            realtime: true,
            mw_msgs: 8,
            stun_timeout: Duration::from_secs(30),
            stun_strict_check: false,
            perf_stat: false,
        }
    }
}

impl StaticConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set NACK handling
    pub fn nack(mut self, enabled: bool) -> Self {
        self.nack_enabled = enabled;
        self
    }

    /// Set TWCC handling
    pub fn twcc(mut self, enabled: bool) -> Self {
        self.twcc_enabled = enabled;
        self
    }

    /// Set congestion controller installation
    pub fn gcc(mut self, enabled: bool) -> Self {
        self.gcc_enabled = enabled;
        self
    }

    /// Drop ingest packets of this payload type
    pub fn drop_pt(mut self, pt: u16) -> Self {
        self.drop_for_pt = pt;
        self
    }

    /// Set realtime mode
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    /// Set the egress batch count
    pub fn batch_msgs(mut self, count: usize) -> Self {
        self.mw_msgs = count;
        self
    }

    /// Set the STUN inactivity budget
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.stun_timeout = timeout;
        self
    }

    /// Set strict STUN role checking
    pub fn strict_check(mut self, enabled: bool) -> Self {
        self.stun_strict_check = enabled;
        self
    }

    /// Set per-packet counter updates
    pub fn perf_stat(mut self, enabled: bool) -> Self {
        self.perf_stat = enabled;
        self
    }
}

impl ConfigProvider for StaticConfig {
    fn nack_enabled(&self, _vhost: &str) -> bool {
        self.nack_enabled
    }

    fn twcc_enabled(&self, _vhost: &str) -> bool {
        self.twcc_enabled
    }

    fn gcc_enabled(&self, _vhost: &str) -> bool {
        self.gcc_enabled
    }

    fn drop_for_pt(&self, _vhost: &str) -> u16 {
        self.drop_for_pt
    }

    fn realtime_enabled(&self, _vhost: &str) -> bool {
        self.realtime
    }

    fn mw_msgs(&self, _vhost: &str, realtime: bool) -> usize {
        if realtime {
            1
        } else {
            self.mw_msgs
        }
    }

    fn stun_timeout(&self, _vhost: &str) -> Duration {
        self.stun_timeout
    }

    fn stun_strict_check(&self, _vhost: &str) -> bool {
        self.stun_strict_check
    }

    fn server_perf_stat(&self) -> bool {
        self.perf_stat
    }
}
