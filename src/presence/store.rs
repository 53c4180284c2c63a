//! Presence storage
//!
//! In-memory edit contexts keyed by entity, one entry per principal. A
//! principal is ABSENT (no entry), PRESENT (`focus_on == ""`) or FOCUSED on a
//! field. Entries held by an open subscription live until it closes; the
//! others expire after the TTL without keep-alive.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::auth::Principal;

/// Default seconds an entry survives without keep-alive
pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 300;

/// Default seconds between reaper runs
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);
const MAX_HEARTBEAT: Duration = Duration::from_secs(30);

/// Wire form of one edit context entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditContextEntry {
    pub name: String,
    #[serde(default)]
    pub focus_on: String,
}

/// Presence configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub ttl: Duration,
    pub reap_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_PRESENCE_TTL_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
        }
    }
}

impl PresenceConfig {
    /// Server ping interval for live subscriptions: a third of the TTL,
    /// capped at 30 seconds
    pub fn heartbeat(&self) -> Duration {
        (self.ttl / 3).clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
    }
}

/// Where a principal stands on an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    Absent,
    Present,
    Focused(String),
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    principal_id: String,
    name: String,
    focus_on: String,
    last_seen: Instant,
    /// Open subscriptions held by this principal on the entity
    subscriptions: usize,
}

#[derive(Debug, Default)]
struct EntityPresence {
    entries: Vec<PresenceEntry>,
    revision: u64,
}

impl EntityPresence {
    fn entry_mut(&mut self, principal_id: &str) -> Option<&mut PresenceEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.principal_id == principal_id)
    }
}

/// Presence store with concurrent access
pub struct PresenceStore {
    entities: DashMap<String, EntityPresence>,
    /// Store-wide counter so revisions stay monotonic across entry removal
    revisions: AtomicU64,
    config: PresenceConfig,
}

impl PresenceStore {
    /// Create a new presence store
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            entities: DashMap::new(),
            revisions: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// A subscription opened: ABSENT becomes PRESENT. Returns true when the
    /// visible edit context changed.
    pub fn enter(&self, entity_id: &str, principal: &Principal) -> bool {
        let revision = self.next_revision();
        let mut presence = self.entities.entry(entity_id.to_string()).or_default();

        if let Some(entry) = presence.entry_mut(&principal.id) {
            entry.subscriptions += 1;
            entry.last_seen = Instant::now();
            return false;
        }

        presence.entries.push(PresenceEntry {
            principal_id: principal.id.clone(),
            name: principal.name.clone(),
            focus_on: String::new(),
            last_seen: Instant::now(),
            subscriptions: 1,
        });
        presence.revision = revision;
        true
    }

    /// Set (or clear, with `""`) the focused field, creating the entry if
    /// needed. Returns true when the visible edit context changed.
    pub fn focus(&self, entity_id: &str, principal: &Principal, focus_on: &str) -> bool {
        let revision = self.next_revision();
        let mut presence = self.entities.entry(entity_id.to_string()).or_default();

        let changed = match presence.entry_mut(&principal.id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                if entry.focus_on == focus_on && entry.name == principal.name {
                    false
                } else {
                    entry.focus_on = focus_on.to_string();
                    entry.name = principal.name.clone();
                    true
                }
            }
            None => {
                presence.entries.push(PresenceEntry {
                    principal_id: principal.id.clone(),
                    name: principal.name.clone(),
                    focus_on: focus_on.to_string(),
                    last_seen: Instant::now(),
                    subscriptions: 0,
                });
                true
            }
        };

        if changed {
            presence.revision = revision;
        }
        changed
    }

    /// Drop the principal's entry regardless of open subscriptions
    pub fn clean(&self, entity_id: &str, principal_id: &str) -> bool {
        self.remove_where(entity_id, |e| e.principal_id == principal_id)
    }

    /// A subscription closed. The entry goes away with the last one.
    pub fn leave(&self, entity_id: &str, principal_id: &str) -> bool {
        let Some(mut presence) = self.entities.get_mut(entity_id) else {
            return false;
        };
        let Some(entry) = presence.entry_mut(principal_id) else {
            return false;
        };

        entry.subscriptions = entry.subscriptions.saturating_sub(1);
        if entry.subscriptions > 0 {
            return false;
        }
        drop(presence);

        self.clean(entity_id, principal_id)
    }

    /// Refresh `last_seen` without changing anything visible
    pub fn touch(&self, entity_id: &str, principal_id: &str) {
        if let Some(mut presence) = self.entities.get_mut(entity_id) {
            if let Some(entry) = presence.entry_mut(principal_id) {
                entry.last_seen = Instant::now();
            }
        }
    }

    /// Current edit context and its revision
    pub fn snapshot(&self, entity_id: &str) -> (Vec<EditContextEntry>, u64) {
        match self.entities.get(entity_id) {
            Some(presence) => (
                presence
                    .entries
                    .iter()
                    .map(|e| EditContextEntry {
                        name: e.name.clone(),
                        focus_on: e.focus_on.clone(),
                    })
                    .collect(),
                presence.revision,
            ),
            None => (Vec::new(), 0),
        }
    }

    pub fn state_of(&self, entity_id: &str, principal_id: &str) -> PresenceState {
        self.entities
            .get(entity_id)
            .and_then(|presence| {
                presence
                    .entries
                    .iter()
                    .find(|e| e.principal_id == principal_id)
                    .map(|e| {
                        if e.focus_on.is_empty() {
                            PresenceState::Present
                        } else {
                            PresenceState::Focused(e.focus_on.clone())
                        }
                    })
            })
            .unwrap_or(PresenceState::Absent)
    }

    /// Forget an entity entirely (it was deleted)
    pub fn remove_entity(&self, entity_id: &str) {
        self.entities.remove(entity_id);
    }

    /// Remove unsubscribed entries whose `last_seen` is older than the TTL.
    /// Returns the ids of entities whose edit context changed.
    pub fn reap(&self) -> Vec<String> {
        self.reap_at(Instant::now())
    }

    pub fn reap_at(&self, now: Instant) -> Vec<String> {
        let ttl = self.config.ttl;
        let expired = |e: &PresenceEntry| {
            e.subscriptions == 0 && now.saturating_duration_since(e.last_seen) >= ttl
        };
        let stale: Vec<String> = self
            .entities
            .iter()
            .filter(|p| p.entries.iter().any(expired))
            .map(|p| p.key().clone())
            .collect();

        let mut changed = Vec::new();
        for entity_id in stale {
            if self.remove_where(&entity_id, expired) {
                changed.push(entity_id);
            }
        }

        self.entities.retain(|_, p| !p.entries.is_empty());
        changed
    }

    fn remove_where<F: Fn(&PresenceEntry) -> bool>(&self, entity_id: &str, pred: F) -> bool {
        let revision = self.next_revision();
        let Some(mut presence) = self.entities.get_mut(entity_id) else {
            return false;
        };

        let before = presence.entries.len();
        presence.entries.retain(|e| !pred(e));
        let changed = presence.entries.len() != before;
        if changed {
            presence.revision = revision;
        }
        changed
    }

    /// Get stats about the store
    pub fn stats(&self) -> PresenceStats {
        PresenceStats {
            entities: self.entities.len(),
            entries: self.entities.iter().map(|p| p.entries.len()).sum(),
        }
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

/// Statistics about the presence store
#[derive(Debug, Clone, Serialize)]
pub struct PresenceStats {
    pub entities: usize,
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jane() -> Principal {
        Principal::new("u-jane", "jane", Vec::<String>::new())
    }

    fn omar() -> Principal {
        Principal::new("u-omar", "omar", Vec::<String>::new())
    }

    #[test]
    fn test_state_machine() {
        let store = PresenceStore::default();
        let p = jane();
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Absent);

        assert!(store.enter("e1", &p));
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Present);

        assert!(store.focus("e1", &p, "name"));
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Focused("name".into()));

        assert!(store.focus("e1", &p, ""));
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Present);

        assert!(store.leave("e1", &p.id));
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Absent);
    }

    #[test]
    fn test_one_entry_per_principal() {
        let store = PresenceStore::default();
        let p = jane();
        store.enter("e1", &p);
        store.focus("e1", &p, "name");
        store.focus("e1", &p, "description");
        store.enter("e1", &omar());

        let (entries, _) = store.snapshot("e1");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            EditContextEntry {
                name: "jane".into(),
                focus_on: "description".into()
            }
        );
    }

    #[test]
    fn test_refocus_same_field_is_not_a_change() {
        let store = PresenceStore::default();
        let p = jane();
        store.focus("e1", &p, "name");
        let (_, rev) = store.snapshot("e1");
        assert!(!store.focus("e1", &p, "name"));
        assert_eq!(store.snapshot("e1").1, rev);
    }

    #[test]
    fn test_revision_is_monotonic_across_removal() {
        let store = PresenceStore::default();
        let p = jane();
        store.enter("e1", &p);
        let (_, first) = store.snapshot("e1");
        store.clean("e1", &p.id);
        store.enter("e1", &p);
        let (_, second) = store.snapshot("e1");
        assert!(second > first);
    }

    #[test]
    fn test_second_subscription_keeps_entry() {
        let store = PresenceStore::default();
        let p = jane();
        assert!(store.enter("e1", &p));
        assert!(!store.enter("e1", &p));
        assert!(!store.leave("e1", &p.id));
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Present);
        assert!(store.leave("e1", &p.id));
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Absent);
    }

    #[test]
    fn test_context_patch_without_subscription() {
        let store = PresenceStore::default();
        let p = jane();
        assert!(store.focus("e1", &p, "description"));
        assert_eq!(
            store.state_of("e1", &p.id),
            PresenceState::Focused("description".into())
        );
        // no subscription to hold it: leave removes it
        assert!(store.leave("e1", &p.id));
    }

    #[test]
    fn test_reap_removes_stale_entries() {
        let store = PresenceStore::new(PresenceConfig {
            ttl: Duration::from_secs(10),
            reap_interval: Duration::from_secs(1),
        });
        store.focus("e1", &jane(), "name");
        store.focus("e2", &omar(), "");

        assert!(store.reap().is_empty());

        let later = Instant::now() + Duration::from_secs(11);
        let mut changed = store.reap_at(later);
        changed.sort();
        assert_eq!(changed, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(store.stats().entries, 0);
        assert_eq!(store.stats().entities, 0);
    }

    #[test]
    fn test_heartbeat_follows_ttl() {
        let config = PresenceConfig::default();
        assert_eq!(config.heartbeat(), Duration::from_secs(30));

        let short = PresenceConfig {
            ttl: Duration::from_secs(9),
            reap_interval: Duration::from_secs(1),
        };
        assert_eq!(short.heartbeat(), Duration::from_secs(3));
        assert!(short.heartbeat() < short.ttl);
    }

    #[test]
    fn test_open_subscription_is_never_reaped() {
        let store = PresenceStore::new(PresenceConfig {
            ttl: Duration::from_secs(10),
            reap_interval: Duration::from_secs(1),
        });
        let p = jane();
        store.enter("e1", &p);
        store.focus("e1", &p, "name");

        let later = Instant::now() + Duration::from_secs(11);
        assert!(store.reap_at(later).is_empty());
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Focused("name".into()));

        // the last subscription closed: nothing holds the entry any more
        store.leave("e1", &p.id);
        store.focus("e1", &p, "name");
        assert_eq!(store.reap_at(later + Duration::from_secs(11)), vec!["e1".to_string()]);
    }

    #[test]
    fn test_touch_defers_reaping() {
        let store = PresenceStore::new(PresenceConfig {
            ttl: Duration::from_millis(50),
            reap_interval: Duration::from_millis(10),
        });
        let p = jane();
        store.focus("e1", &p, "");
        std::thread::sleep(Duration::from_millis(60));
        store.touch("e1", &p.id);
        assert!(store.reap().is_empty());
        assert_eq!(store.state_of("e1", &p.id), PresenceState::Present);
    }
}
