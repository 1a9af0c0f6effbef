//! Ephemeral per-participant presence with TTL expiry

use crate::session::{PresenceEntry, PresenceMap, SessionUpdate};
use std::time::Duration;

/// Presence entries not refreshed within this window are dropped
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(60);

/// Maintains the presence map of one participant.
///
/// Every applied update, accepted or not, refreshes the sender's entry and
/// prunes expired ones. The local entry never expires.
#[derive(Debug, Clone, Copy)]
pub struct PresenceTracker {
    ttl_ms: u64,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

impl PresenceTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Upsert the sender of `update`, prune, and make sure the local entry
    /// exists. `fallback` is the record the local entry is rebuilt from.
    pub fn observe(
        &self,
        presence: &PresenceMap,
        update: &SessionUpdate,
        local_id: &str,
        fallback: &SessionUpdate,
        now: u64,
    ) -> PresenceMap {
        let mut next = presence.clone();
        let is_local = update.session_id == local_id;
        next.insert(
            update.session_id.clone(),
            PresenceEntry::from_update(update, is_local),
        );

        let next = self.prune(next, now);
        self.ensure_local(next, local_id, fallback)
    }

    /// Recompute `is_local` flags for a map written by another participant
    pub fn normalize(
        &self,
        presence: &PresenceMap,
        local_id: &str,
        fallback: &SessionUpdate,
        now: u64,
    ) -> PresenceMap {
        let relabeled = presence
            .iter()
            .map(|(id, entry)| {
                let entry = PresenceEntry {
                    is_local: id == local_id,
                    ..entry.clone()
                };
                (id.clone(), entry)
            })
            .collect();

        let next = self.prune(relabeled, now);
        self.ensure_local(next, local_id, fallback)
    }

    /// Keep local entries and entries seen within the TTL
    pub fn prune(&self, presence: PresenceMap, now: u64) -> PresenceMap {
        presence
            .into_iter()
            .filter(|(_, entry)| entry.is_local || now.saturating_sub(entry.last_seen_at) <= self.ttl_ms)
            .collect()
    }

    fn ensure_local(&self, mut presence: PresenceMap, local_id: &str, fallback: &SessionUpdate) -> PresenceMap {
        if !presence.contains_key(local_id) {
            let mut entry = PresenceEntry::from_update(fallback, true);
            entry.session_id = local_id.to_string();
            presence.insert(local_id.to_string(), entry);
        }
        presence
    }
}
