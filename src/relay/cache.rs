//! Bounded per-session cache of recently routed envelopes.
//!
//! The relay appends every CLI→web envelope here and replays the live
//! slice, in FIFO order, to a web peer that joins. The cache is a bridge
//! for sub-second reconnects only: entries are ciphertext bound to the
//! CLI key that sealed them, so the store purges a session's cache when
//! that key rotates.
//!
//! Eviction is strict FIFO by the earlier of count (1000) or age (1 hour).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};

use crate::constants::{MESSAGE_CACHE_MAX, MESSAGE_CACHE_TTL};
use crate::protocol::Envelope;

/// One cached envelope with its receipt time.
#[derive(Debug, Clone)]
struct CacheEntry {
    envelope: Envelope,
    received_at: DateTime<Utc>,
}

/// Per-session bounded envelope cache.
#[derive(Debug, Default)]
pub struct MessageCache {
    sessions: HashMap<String, VecDeque<CacheEntry>>,
}

impl MessageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope for a session, evicting per the bounds.
    pub fn push(&mut self, session_id: &str, envelope: Envelope) {
        self.push_at(session_id, envelope, Utc::now());
    }

    fn push_at(&mut self, session_id: &str, envelope: Envelope, now: DateTime<Utc>) {
        let entries = self.sessions.entry(session_id.to_string()).or_default();
        entries.push_back(CacheEntry {
            envelope,
            received_at: now,
        });
        Self::evict(entries, now);
    }

    /// The live slice for a session, oldest first.
    ///
    /// Age eviction is applied at read time so a replay never includes
    /// entries past the TTL.
    #[must_use]
    pub fn replay(&mut self, session_id: &str) -> Vec<Envelope> {
        let now = Utc::now();
        match self.sessions.get_mut(session_id) {
            Some(entries) => {
                Self::evict(entries, now);
                entries.iter().map(|e| e.envelope.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop everything cached for a session (delete, key rotation).
    pub fn purge(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Number of live entries for a session.
    #[must_use]
    pub fn len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, VecDeque::len)
    }

    /// True when nothing is cached for the session.
    #[must_use]
    pub fn is_empty(&self, session_id: &str) -> bool {
        self.len(session_id) == 0
    }

    /// Evict the front while over either bound.
    fn evict(entries: &mut VecDeque<CacheEntry>, now: DateTime<Utc>) {
        let max_age =
            ChronoDuration::from_std(MESSAGE_CACHE_TTL).expect("cache TTL fits chrono range");
        while entries.len() > MESSAGE_CACHE_MAX {
            entries.pop_front();
        }
        while entries
            .front()
            .is_some_and(|e| now - e.received_at > max_age)
        {
            entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64) -> Envelope {
        Envelope {
            version: 1,
            session_id: "ABCDEF".into(),
            nonce: format!("n{seq}"),
            ciphertext: format!("c{seq}"),
            timestamp: seq as i64,
        }
    }

    #[test]
    fn test_replay_is_fifo() {
        let mut cache = MessageCache::new();
        for seq in 0..5 {
            cache.push("ABCDEF", envelope(seq));
        }
        let replayed = cache.replay("ABCDEF");
        let nonces: Vec<&str> = replayed.iter().map(|e| e.nonce.as_str()).collect();
        assert_eq!(nonces, vec!["n0", "n1", "n2", "n3", "n4"]);
    }

    #[test]
    fn test_count_bound_evicts_front() {
        let mut cache = MessageCache::new();
        for seq in 0..(MESSAGE_CACHE_MAX as u64 + 10) {
            cache.push("ABCDEF", envelope(seq));
        }
        assert_eq!(cache.len("ABCDEF"), MESSAGE_CACHE_MAX);
        let replayed = cache.replay("ABCDEF");
        assert_eq!(replayed.first().unwrap().nonce, "n10");
    }

    #[test]
    fn test_age_bound_evicts_front() {
        let mut cache = MessageCache::new();
        let stale = Utc::now() - ChronoDuration::hours(2);
        cache.push_at("ABCDEF", envelope(0), stale);
        cache.push_at("ABCDEF", envelope(1), stale);
        cache.push("ABCDEF", envelope(2));

        let replayed = cache.replay("ABCDEF");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].nonce, "n2");
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut cache = MessageCache::new();
        cache.push("AAAAAA", envelope(1));
        cache.push("BBBBBB", envelope(2));
        assert_eq!(cache.len("AAAAAA"), 1);
        assert_eq!(cache.len("BBBBBB"), 1);

        cache.purge("AAAAAA");
        assert!(cache.is_empty("AAAAAA"));
        assert_eq!(cache.len("BBBBBB"), 1);
    }

    #[test]
    fn test_replay_of_unknown_session_is_empty() {
        let mut cache = MessageCache::new();
        assert!(cache.replay("NOSUCH").is_empty());
    }
}
