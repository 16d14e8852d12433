//! Mask tables (spec §4.C): three small bounded sets of virtual paths, each
//! behind its own lock. Membership is linear scan — acceptable given the
//! caps (256/1024/1024), and it keeps these types trivial to reason about
//! under concurrent handler threads.

use log::warn;
use parking_lot::Mutex;

/// Shared machinery for a capacity-bounded set of owned path strings.
struct BoundedSet {
    paths: Mutex<Vec<String>>,
    cap: usize,
}

/// What happens when `add` is called against a full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverflowPolicy {
    /// Refuse the insert, leaving the set unchanged.
    Refuse,
    /// Drop the oldest entry (index 0) to make room.
    EvictOldest,
}

impl BoundedSet {
    fn new(cap: usize) -> Self {
        BoundedSet {
            paths: Mutex::new(Vec::with_capacity(cap.min(64))),
            cap,
        }
    }

    fn contains(&self, path: &str) -> bool {
        self.paths.lock().iter().any(|p| p == path)
    }

    fn add(&self, path: &str, policy: OverflowPolicy, name: &str) -> bool {
        let mut paths = self.paths.lock();
        if paths.iter().any(|p| p == path) {
            return true;
        }
        if paths.len() >= self.cap {
            match policy {
                OverflowPolicy::Refuse => {
                    warn!("{name} mask at capacity ({}), refusing {path:?}", self.cap);
                    return false;
                }
                OverflowPolicy::EvictOldest => {
                    paths.remove(0);
                }
            }
        }
        paths.push(path.to_owned());
        true
    }

    fn remove(&self, path: &str) {
        self.paths.lock().retain(|p| p != path);
    }

    fn clear(&self) {
        self.paths.lock().clear();
    }
}

/// Hides the local tier's copy of a path from the resolver while the path is
/// a member (used while the upper layer is removing the local copy out of
/// band). Capacity 256; refuses inserts once full.
pub struct EvictingMask(BoundedSet);

impl EvictingMask {
    pub fn new() -> Self {
        EvictingMask(BoundedSet::new(256))
    }

    pub fn mark(&self, path: &str) -> bool {
        self.0.add(path, OverflowPolicy::Refuse, "evicting")
    }

    pub fn unmark(&self, path: &str) {
        self.0.remove(path);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

impl Default for EvictingMask {
    fn default() -> Self {
        Self::new()
    }
}

/// Hides a name from directory listings until the external removal half of
/// a delete completes (or is known unnecessary). Capacity 1024; FIFO-evicts
/// the oldest entry once full rather than refusing — a missed ghost-hide is
/// less harmful than losing track of deletes entirely.
pub struct PendingDeleteMask(BoundedSet);

impl PendingDeleteMask {
    pub fn new() -> Self {
        PendingDeleteMask(BoundedSet::new(1024))
    }

    pub fn add(&self, path: &str) {
        self.0.add(path, OverflowPolicy::EvictOldest, "pending-delete");
    }

    pub fn remove(&self, path: &str) {
        self.0.remove(path);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

impl Default for PendingDeleteMask {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects mutating operations on a path while an upper-layer sync is in
/// progress. Capacity 1024; FIFO-evicts the oldest entry once full.
pub struct SyncingMask(BoundedSet);

impl SyncingMask {
    pub fn new() -> Self {
        SyncingMask(BoundedSet::new(1024))
    }

    pub fn lock_path(&self, path: &str) {
        self.0.add(path, OverflowPolicy::EvictOldest, "syncing");
    }

    pub fn unlock_path(&self, path: &str) {
        self.0.remove(path);
    }

    pub fn unlock_all(&self) {
        self.0.clear();
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }
}

impl Default for SyncingMask {
    fn default() -> Self {
        Self::new()
    }
}

/// The three tables bundled together, as they're always constructed and torn
/// down as a unit by the owning `Session`.
#[derive(Default)]
pub struct MaskTables {
    pub evicting: EvictingMask,
    pub pending_delete: PendingDeleteMask,
    pub syncing: SyncingMask,
}

impl MaskTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all three tables. Called on mount teardown (spec §4.I step 8).
    pub fn clear_all(&self) {
        self.evicting.clear();
        self.pending_delete.clear();
        self.syncing.unlock_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicting_refuses_at_capacity() {
        let mask = EvictingMask::new();
        for i in 0..256 {
            assert!(mask.mark(&format!("/f{i}")));
        }
        assert!(!mask.mark("/overflow"));
        assert!(mask.contains("/f0"));
        assert!(!mask.contains("/overflow"));
    }

    #[test]
    fn evicting_mark_unmark_roundtrip() {
        let mask = EvictingMask::new();
        assert!(!mask.contains("/x"));
        mask.mark("/x");
        assert!(mask.contains("/x"));
        mask.unmark("/x");
        assert!(!mask.contains("/x"));
    }

    #[test]
    fn pending_delete_evicts_oldest_at_capacity() {
        let mask = PendingDeleteMask::new();
        for i in 0..1024 {
            mask.add(&format!("/f{i}"));
        }
        assert!(mask.contains("/f0"));
        mask.add("/overflow");
        assert!(!mask.contains("/f0"));
        assert!(mask.contains("/overflow"));
    }

    #[test]
    fn syncing_lock_unlock_all() {
        let mask = SyncingMask::new();
        mask.lock_path("/a");
        mask.lock_path("/b");
        assert!(mask.contains("/a"));
        mask.unlock_all();
        assert!(!mask.contains("/a"));
        assert!(!mask.contains("/b"));
    }

    #[test]
    fn duplicate_add_is_a_noop_not_a_second_entry() {
        let mask = PendingDeleteMask::new();
        mask.add("/dup");
        mask.add("/dup");
        assert_eq!(mask.0.paths.lock().len(), 1);
    }
}
