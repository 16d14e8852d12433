//! Global mount state (spec §3): one record, mutated only under its own
//! lock, holding the roots, the lifecycle flags, and the presented owner.
//! Constructed at mount start, torn down after the event loop exits.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::warn;

/// One of the two backing directories a virtual path can resolve into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    External,
}

/// The mutable parts of the mount, always touched together under one lock.
/// Never held across a backing-filesystem syscall (spec §5).
pub struct MountState {
    pub mount_path: PathBuf,
    pub local_root: PathBuf,
    pub external_root: Option<PathBuf>,
    pub mounted: bool,
    pub external_offline: bool,
    pub readonly: bool,
    pub index_ready: bool,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

impl MountState {
    pub fn new(mount_path: PathBuf, local_root: PathBuf, external_root: Option<PathBuf>) -> Self {
        let (owner_uid, owner_gid) = derive_mount_owner(&mount_path, &local_root);
        MountState {
            mount_path,
            local_root,
            external_root,
            mounted: false,
            external_offline: false,
            readonly: false,
            index_ready: false,
            owner_uid,
            owner_gid,
        }
    }

    /// External tier is usable for reads/listings right now.
    pub fn external_live(&self) -> bool {
        self.external_root.is_some() && !self.external_offline
    }
}

/// Owner uid/gid derivation (spec §3): the mount point's parent directory's
/// owner; failing that, the local root's owner; failing that, zero.
fn derive_mount_owner(mount_path: &Path, local_root: &Path) -> (u32, u32) {
    if let Some(parent) = mount_path.parent() {
        if let Ok(meta) = fs::metadata(parent) {
            return (meta.uid(), meta.gid());
        }
    }
    match fs::metadata(local_root) {
        Ok(meta) => (meta.uid(), meta.gid()),
        Err(e) => {
            warn!(
                "could not stat local root {local_root:?} or mount parent while deriving owner: {e}; defaulting to uid/gid 0"
            );
            (0, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn owner_falls_back_to_local_root_when_parent_missing() {
        let local = tempdir().unwrap();
        let bogus_mount = PathBuf::from("/nonexistent-parent-abcxyz/mnt");
        let (uid, gid) = derive_mount_owner(&bogus_mount, local.path());
        let expected = fs::metadata(local.path()).unwrap();
        assert_eq!(uid, expected.uid());
        assert_eq!(gid, expected.gid());
    }

    #[test]
    fn owner_defaults_to_zero_when_nothing_resolves() {
        let (uid, gid) = derive_mount_owner(
            Path::new("/nonexistent-abcxyz/mnt"),
            Path::new("/also-nonexistent-abcxyz"),
        );
        assert_eq!((uid, gid), (0, 0));
    }

    #[test]
    fn external_live_requires_root_and_not_offline() {
        let mut state = MountState::new(PathBuf::from("/mnt"), PathBuf::from("/local"), None);
        assert!(!state.external_live());
        state.external_root = Some(PathBuf::from("/external"));
        assert!(state.external_live());
        state.external_offline = true;
        assert!(!state.external_live());
    }
}
