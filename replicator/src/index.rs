//! Index holds the dependency bookkeeping between sources and their
//! replicas.
//!
//! Keys are `"namespace/name"` strings, never object pointers, so the index
//! cannot form reference cycles with the informer cache. All mutation happens
//! from a replicator's single event-loop task; no locking.

use std::collections::{BTreeSet, HashMap};

/// DependencyIndex tracks, per kind, which objects pull from which source and
/// which objects are active push sources.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    /// Source key → keys of the pull targets following it.
    pull_targets: HashMap<String, BTreeSet<String>>,
    /// Pull target key → the source key it follows. Lets a follower's entry
    /// be dropped when its annotation changes or it is deleted.
    source_of: HashMap<String, String>,
    /// Keys of objects whose annotations currently designate push.
    push_sources: BTreeSet<String>,
}

impl DependencyIndex {
    /// Record_pull registers `follower` as pulling from `source`, replacing
    /// any previous registration of the follower.
    pub fn record_pull(&mut self, follower: &str, source: &str) {
        if let Some(prev) = self.source_of.get(follower) {
            if prev == source {
                return;
            }
            let prev = prev.clone();
            self.drop_follower(&prev, follower);
        }
        self.source_of
            .insert(follower.to_string(), source.to_string());
        self.pull_targets
            .entry(source.to_string())
            .or_default()
            .insert(follower.to_string());
    }

    /// Clear_pull removes `follower`'s registration, if any.
    pub fn clear_pull(&mut self, follower: &str) {
        if let Some(source) = self.source_of.remove(follower) {
            self.drop_follower(&source, follower);
        }
    }

    fn drop_follower(&mut self, source: &str, follower: &str) {
        if let Some(set) = self.pull_targets.get_mut(source) {
            set.remove(follower);
            if set.is_empty() {
                self.pull_targets.remove(source);
            }
        }
    }

    /// Followers_of returns the pull targets currently following `source`.
    pub fn followers_of(&self, source: &str) -> Option<&BTreeSet<String>> {
        self.pull_targets.get(source)
    }

    /// Remove_source drops `source` and returns the followers it had, for the
    /// deletion cascade to detach.
    pub fn remove_source(&mut self, source: &str) -> BTreeSet<String> {
        let followers = self.pull_targets.remove(source).unwrap_or_default();
        for f in &followers {
            self.source_of.remove(f);
        }
        followers
    }

    /// Mark_push_source records `key` as an active push source.
    pub fn mark_push_source(&mut self, key: &str) {
        self.push_sources.insert(key.to_string());
    }

    /// Unmark_push_source removes `key`, reporting whether it was a member.
    pub fn unmark_push_source(&mut self, key: &str) -> bool {
        self.push_sources.remove(key)
    }

    /// Push_sources iterates the active push-source keys.
    pub fn push_sources(&self) -> impl Iterator<Item = &String> {
        self.push_sources.iter()
    }

    /// Has_push_sources reports whether any push source is known.
    pub fn has_push_sources(&self) -> bool {
        !self.push_sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_registration_round_trip() {
        let mut idx = DependencyIndex::default();
        idx.record_pull("b/t1", "a/s");
        idx.record_pull("c/t2", "a/s");
        let followers = idx.followers_of("a/s").unwrap();
        assert_eq!(
            followers.iter().collect::<Vec<_>>(),
            ["b/t1", "c/t2"].iter().collect::<Vec<_>>()
        );

        idx.clear_pull("b/t1");
        assert_eq!(idx.followers_of("a/s").unwrap().len(), 1);
        idx.clear_pull("c/t2");
        assert!(idx.followers_of("a/s").is_none());
    }

    #[test]
    fn repointing_a_follower_moves_it() {
        let mut idx = DependencyIndex::default();
        idx.record_pull("b/t", "a/s1");
        idx.record_pull("b/t", "a/s2");
        assert!(idx.followers_of("a/s1").is_none());
        assert!(idx.followers_of("a/s2").unwrap().contains("b/t"));
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let mut idx = DependencyIndex::default();
        idx.record_pull("b/t", "a/s");
        idx.record_pull("b/t", "a/s");
        assert_eq!(idx.followers_of("a/s").unwrap().len(), 1);
    }

    #[test]
    fn remove_source_drains_followers() {
        let mut idx = DependencyIndex::default();
        idx.record_pull("b/t1", "a/s");
        idx.record_pull("c/t2", "a/s");
        let drained = idx.remove_source("a/s");
        assert_eq!(drained.len(), 2);
        assert!(idx.followers_of("a/s").is_none());
        // Follower back-references are gone too.
        idx.clear_pull("b/t1");
        assert!(idx.followers_of("a/s").is_none());
    }

    #[test]
    fn push_source_membership() {
        let mut idx = DependencyIndex::default();
        assert!(!idx.has_push_sources());
        idx.mark_push_source("a/x");
        idx.mark_push_source("a/x");
        assert!(idx.has_push_sources());
        assert_eq!(idx.push_sources().count(), 1);
        assert!(idx.unmark_push_source("a/x"));
        assert!(!idx.unmark_push_source("a/x"));
    }
}
