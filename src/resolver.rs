//! Path resolver (spec §4.A): maps a virtual path to a concrete backing
//! path under one of the two tiers, honoring the eviction mask.

use std::path::{Path, PathBuf};

use crate::masks::EvictingMask;
use crate::state::{MountState, Tier};

/// Maximum virtual-path depth (spec §4.D path-depth guard). Protects against
/// recursive descent when a symlink aims back at the mount.
pub const MAX_PATH_DEPTH: usize = 40;

/// Number of slashes in a virtual path; `/` itself has depth 0.
pub fn depth(virtual_path: &str) -> usize {
    virtual_path.matches('/').count().saturating_sub(1).max(0)
}

pub fn is_too_deep(virtual_path: &str) -> bool {
    depth(virtual_path) > MAX_PATH_DEPTH
}

/// Join a tier root with a virtual path, collapsing duplicate separators and
/// stripping the leading separator off the suffix so exactly one separator
/// sits between root and suffix.
fn join_backing_path(root: &Path, virtual_path: &str) -> PathBuf {
    let suffix = virtual_path.trim_start_matches('/');
    if suffix.is_empty() {
        return root.to_path_buf();
    }
    let mut normalized = String::with_capacity(suffix.len());
    let mut prev_was_slash = false;
    for c in suffix.chars() {
        if c == '/' {
            if prev_was_slash {
                continue;
            }
            prev_was_slash = true;
        } else {
            prev_was_slash = false;
        }
        normalized.push(c);
    }
    root.join(normalized)
}

/// The local-tier backing path for `virtual_path`, unconditionally (no
/// existence check, no eviction-mask check).
pub fn local_of(state: &MountState, virtual_path: &str) -> PathBuf {
    join_backing_path(&state.local_root, virtual_path)
}

/// The external-tier backing path for `virtual_path`, or `None` when the
/// external root is unset or offline.
pub fn external_of(state: &MountState, virtual_path: &str) -> Option<PathBuf> {
    if !state.external_live() {
        return None;
    }
    state
        .external_root
        .as_ref()
        .map(|root| join_backing_path(root, virtual_path))
}

/// Resolve a virtual path to a concrete backing path, preferring local
/// unless the path is evicted there, then falling back to external.
///
/// `resolve(p)` is `local(p)` iff `local(p)` exists and `p` is not a member
/// of the evicting mask; otherwise it's `external(p)` iff external is live
/// and `external(p)` exists; otherwise `None`.
pub fn resolve(
    state: &MountState,
    evicting: &EvictingMask,
    virtual_path: &str,
) -> Option<(Tier, PathBuf)> {
    if !evicting.contains(virtual_path) {
        let local = local_of(state, virtual_path);
        if local.exists() {
            return Some((Tier::Local, local));
        }
    }
    if let Some(external) = external_of(state, virtual_path) {
        if external.exists() {
            return Some((Tier::External, external));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn state_with(local: &Path, external: Option<&Path>) -> MountState {
        MountState::new(
            PathBuf::from("/mnt"),
            local.to_path_buf(),
            external.map(|p| p.to_path_buf()),
        )
    }

    #[test]
    fn join_collapses_duplicate_separators_and_strips_leading_slash() {
        let root = Path::new("/local");
        assert_eq!(join_backing_path(root, "/a//b///c"), PathBuf::from("/local/a/b/c"));
        assert_eq!(join_backing_path(root, "/"), PathBuf::from("/local"));
    }

    #[test]
    fn depth_of_root_is_zero() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/a"), 1);
        assert_eq!(depth("/a/b/c"), 3);
    }

    #[test]
    fn path_depth_guard_trips_past_forty() {
        let deep = format!("/{}", "a/".repeat(41));
        assert!(is_too_deep(&deep));
        let shallow = format!("/{}", "a/".repeat(40));
        assert!(!is_too_deep(&shallow));
    }

    #[test]
    fn resolve_prefers_local_when_present_in_both() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(local.path().join("f"), b"local").unwrap();
        fs::write(external.path().join("f"), b"external").unwrap();
        let state = state_with(local.path(), Some(external.path()));
        let evicting = EvictingMask::new();
        let (tier, path) = resolve(&state, &evicting, "/f").unwrap();
        assert_eq!(tier, Tier::Local);
        assert_eq!(path, local.path().join("f"));
    }

    #[test]
    fn resolve_falls_back_to_external_when_local_missing() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(external.path().join("f"), b"external").unwrap();
        let state = state_with(local.path(), Some(external.path()));
        let evicting = EvictingMask::new();
        let (tier, _) = resolve(&state, &evicting, "/f").unwrap();
        assert_eq!(tier, Tier::External);
    }

    #[test]
    fn resolve_skips_local_when_evicted() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(local.path().join("big.bin"), b"local").unwrap();
        fs::write(external.path().join("big.bin"), b"external").unwrap();
        let state = state_with(local.path(), Some(external.path()));
        let evicting = EvictingMask::new();
        evicting.mark("/big.bin");
        let (tier, _) = resolve(&state, &evicting, "/big.bin").unwrap();
        assert_eq!(tier, Tier::External);
        evicting.unmark("/big.bin");
        let (tier, _) = resolve(&state, &evicting, "/big.bin").unwrap();
        assert_eq!(tier, Tier::Local);
    }

    #[test]
    fn resolve_none_when_missing_everywhere() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        let state = state_with(local.path(), Some(external.path()));
        let evicting = EvictingMask::new();
        assert!(resolve(&state, &evicting, "/ghost").is_none());
    }

    #[test]
    fn resolve_ignores_offline_external() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(external.path().join("f"), b"external").unwrap();
        let mut state = state_with(local.path(), Some(external.path()));
        state.external_offline = true;
        let evicting = EvictingMask::new();
        assert!(resolve(&state, &evicting, "/f").is_none());
        assert!(external_of(&state, "/f").is_none());
    }
}
