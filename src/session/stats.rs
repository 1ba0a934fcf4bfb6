//! Per-connection statistics
//!
//! Monotonic counters updated across the connection's tasks, flushed as a
//! one-line summary when the session goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counter bag for one connection
#[derive(Debug)]
pub struct ConnectionStats {
    born: Instant,
    /// Publishers created
    pub nn_publishers: AtomicU64,
    /// Players created
    pub nn_subscribers: AtomicU64,
    /// Sender reports received
    pub nn_sr: AtomicU64,
    /// Receiver reports handled (in or out)
    pub nn_rr: AtomicU64,
    /// Extended reports handled (in or out)
    pub nn_xr: AtomicU64,
    /// NACK requests served or sent
    pub nn_nack: AtomicU64,
    /// PLI requests handled
    pub nn_pli: AtomicU64,
    /// Inbound packets carrying a TWCC sequence
    pub nn_in_twcc: AtomicU64,
    /// Inbound RTP packets
    pub nn_in_rtp: AtomicU64,
    /// Outbound TWCC feedback packets
    pub nn_out_twcc: AtomicU64,
    /// Outbound RTP packets
    pub nn_out_rtp: AtomicU64,
    /// Outbound RTP bytes
    pub nn_out_bytes: AtomicU64,
}

impl ConnectionStats {
    /// Create a zeroed bag
    pub fn new() -> Self {
        Self {
            born: Instant::now(),
            nn_publishers: AtomicU64::new(0),
            nn_subscribers: AtomicU64::new(0),
            nn_sr: AtomicU64::new(0),
            nn_rr: AtomicU64::new(0),
            nn_xr: AtomicU64::new(0),
            nn_nack: AtomicU64::new(0),
            nn_pli: AtomicU64::new(0),
            nn_in_twcc: AtomicU64::new(0),
            nn_in_rtp: AtomicU64::new(0),
            nn_out_twcc: AtomicU64::new(0),
            nn_out_rtp: AtomicU64::new(0),
            nn_out_bytes: AtomicU64::new(0),
        }
    }

    /// One-line summary, omitting zero counters
    pub fn summary(&self) -> String {
        let mut out = format!("alive={}ms", self.born.elapsed().as_millis());

        let mut push = |label: &str, counter: &AtomicU64| {
            let v = counter.load(Ordering::Relaxed);
            if v > 0 {
                out.push_str(&format!(", {}={}", label, v));
            }
        };

        push("npub", &self.nn_publishers);
        push("nsub", &self.nn_subscribers);
        push("nrr", &self.nn_rr);
        push("nxr", &self.nn_xr);
        push("nsr", &self.nn_sr);
        push("nnack", &self.nn_nack);
        push("npli", &self.nn_pli);
        push("in_ntwcc", &self.nn_in_twcc);
        push("in_nrtp", &self.nn_in_rtp);
        push("out_ntwcc", &self.nn_out_twcc);
        push("out_nrtp", &self.nn_out_rtp);
        push("out_nbytes", &self.nn_out_bytes);

        out
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Bump a counter by one
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bump a counter by an amount
pub fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Read a counter
pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
