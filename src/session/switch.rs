//! Keyframe-gated stream switching
//!
//! Video tracks in one merge group share a single outbound SSRC; at most
//! one member sends at a time. A member asked to become active first sits
//! as "preparing" until a keyframe arrives on it, then it is promoted and
//! the previous member demoted, so the player never starts mid-GOP.

use std::collections::HashMap;
use std::sync::Arc;

use crate::server::env::TrackIdGroups;

#[derive(Debug, Default)]
struct GroupState {
    active: Option<String>,
    preparing: Option<String>,
}

/// What the egress path should do after consulting the switch context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchDecision {
    /// Deliver the packet on its track
    Deliver,
    /// The track is a group member that is not currently active
    Drop,
    /// Promote this track; the named previous member must be deactivated
    Promote {
        /// Track id to deactivate, if a member was active
        demote: Option<String>,
    },
}

/// Per-merge-group switching state of one play stream
#[derive(Debug)]
pub struct StreamSwitchContext {
    groups: Arc<TrackIdGroups>,
    state: HashMap<String, GroupState>,
}

impl StreamSwitchContext {
    /// Create a context over the configured merge groups
    pub fn new(groups: Arc<TrackIdGroups>) -> Self {
        Self {
            groups,
            state: HashMap::new(),
        }
    }

    /// Register one video track at play initialization
    ///
    /// The first member registered per group becomes "preparing", so its
    /// first keyframe starts the group.
    pub fn register(&mut self, track_id: &str) {
        if !self.groups.is_member(track_id) {
            return;
        }
        let merged = self.groups.merged_id(track_id).to_string();
        let group = self.state.entry(merged).or_default();
        if group.active.is_none() && group.preparing.is_none() {
            group.preparing = Some(track_id.to_string());
        }
    }

    /// Whether the track is waiting for its first keyframe
    pub fn is_track_preparing(&self, track_id: &str) -> bool {
        self.group_of(track_id)
            .map(|g| g.preparing.as_deref() == Some(track_id))
            .unwrap_or(false)
    }

    /// Whether the track must not be deactivated by a bulk reset
    ///
    /// The group's current active member keeps sending until its
    /// replacement produces a keyframe.
    pub fn is_track_immutable(&self, track_id: &str) -> bool {
        self.group_of(track_id)
            .map(|g| g.active.as_deref() == Some(track_id))
            .unwrap_or(false)
    }

    /// Whether activating this track must wait for a keyframe
    ///
    /// Group members flip to "preparing" instead of activating directly;
    /// the caller requests a PLI upstream. Non-members return false and
    /// activate immediately.
    pub fn activate_in_future(&mut self, track_id: &str) -> bool {
        if !self.groups.is_member(track_id) {
            return false;
        }
        let merged = self.groups.merged_id(track_id).to_string();
        let group = self.state.entry(merged).or_default();
        if group.active.as_deref() == Some(track_id) {
            // Already the sender; nothing to wait for.
            return false;
        }
        group.preparing = Some(track_id.to_string());
        true
    }

    /// Consult the context for one video packet
    pub fn try_switch_stream(&mut self, track_id: &str, is_keyframe: bool) -> SwitchDecision {
        if !self.groups.is_member(track_id) {
            return SwitchDecision::Deliver;
        }
        let merged = self.groups.merged_id(track_id).to_string();
        let group = self.state.entry(merged).or_default();

        if group.preparing.as_deref() == Some(track_id) && is_keyframe {
            let demote = group.active.take();
            group.active = Some(track_id.to_string());
            group.preparing = None;
            tracing::info!(track = %track_id, from = ?demote, "stream switch on keyframe");
            return SwitchDecision::Promote { demote };
        }

        if group.active.as_deref() == Some(track_id) {
            SwitchDecision::Deliver
        } else {
            SwitchDecision::Drop
        }
    }

    fn group_of(&self, track_id: &str) -> Option<&GroupState> {
        if !self.groups.is_member(track_id) {
            return None;
        }
        self.state.get(self.groups.merged_id(track_id))
    }
}
