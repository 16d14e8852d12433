//! Mount lifecycle (spec §4.I): option assembly, the blocking and
//! background entry points, notification/signal worker startup, and the
//! exit-diagnostics block emitted on teardown.
//!
//! Grounded directly in `fuser`'s own `mount2`/`spawn_mount2` entry points
//! (`src/lib.rs`) and `MountOption` construction (`src/mnt/mount_options.rs`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::MountOption;
use log::{error, info, warn};

use crate::diag::{self, format_exit_report};
use crate::error::MountError;
use crate::fs::UnionFs;
use crate::notify;
use crate::session::Session;

/// FUSE mount options tuned for the union driver (spec §4.I step 3):
/// volume name = basename of the mount path; allow_other + default_permissions
/// so non-owning processes can traverse the mount under kernel-enforced
/// permission checks; auto_unmount so a crashed driver doesn't leave a
/// dangling mountpoint; auto_xattr + local let the kernel shim extended
/// attributes via side files so `copyfile`-style tools work without this
/// driver implementing an xattr store of its own; short positive cache
/// timeouts (entry/attr/negative = 1s) cut round trips under burst without
/// serving attrs that are stale for long; `daemon_timeout=0` disables idle
/// teardown. The timeout/volname/auto_xattr/local knobs travel as CUSTOM
/// options since `fuser`'s own `MountOption` enum has no typed variant for
/// them (they're macFUSE/libfuse `-o` passthroughs).
fn build_mount_options(mount_path: &Path, readonly: bool) -> Vec<MountOption> {
    let volname = mount_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tierfuse");
    let mut options = vec![
        MountOption::FSName("tierfuse".to_string()),
        MountOption::Subtype("tierfuse".to_string()),
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
        MountOption::CUSTOM(format!("volname={volname}")),
        MountOption::CUSTOM("auto_xattr".to_string()),
        MountOption::CUSTOM("local".to_string()),
        MountOption::CUSTOM("entry_timeout=1".to_string()),
        MountOption::CUSTOM("attr_timeout=1".to_string()),
        MountOption::CUSTOM("negative_timeout=1".to_string()),
        MountOption::CUSTOM("daemon_timeout=0".to_string()),
    ];
    options.push(if readonly { MountOption::RO } else { MountOption::RW });
    options
}

/// Start the notification consumer and signal-watcher background threads
/// that must be running before the FUSE event loop begins servicing
/// requests (spec §4.I step 6).
fn start_background_workers(session: &Arc<Session>) {
    notify::spawn_consumer(session.notify.clone());
    if let Err(e) = diag::spawn_signal_watcher(session.signals.clone()) {
        warn!("failed to install signal watcher: {e}");
    }
}

/// Mount and run the union filesystem, blocking the calling thread until
/// the kernel tears the mount down or an unrecoverable error occurs.
/// Always multi-threaded: a single-threaded loop would deadlock the moment
/// a handler itself touches the mountpoint (e.g. a symlink resolving back
/// into the union, or `copy_file_range` within the mount), since that
/// reentrant request would queue behind the very thread blocked serving
/// the first one.
pub fn mount_blocking(session: Arc<Session>) -> Result<(), MountError> {
    let mount_path = session.state.lock().mount_path.clone();
    if session.is_mounted() {
        return Err(MountError::AlreadyMounted);
    }
    if !mount_path.is_dir() {
        return Err(MountError::InvalidArg);
    }

    let readonly = session.state.lock().readonly;
    let options = build_mount_options(&mount_path, readonly);
    start_background_workers(&session);
    session.state.lock().mounted = true;

    let fs = UnionFs::new(session.clone());
    info!("mounting tierfuse at {mount_path:?}");
    let result = fuser::mount2(fs, &mount_path, &options);

    let loop_errno = result.as_ref().err().and_then(std::io::Error::raw_os_error);
    teardown(&session, loop_errno);
    result.map_err(|_| MountError::MountFailed)
}

/// Mount in the background, returning a session handle the caller drives
/// through the runtime-control API while the FUSE loop runs on its own
/// thread(s). The returned `fuser::BackgroundSession` unmounts on drop.
pub fn mount_background(
    session: Arc<Session>,
) -> Result<fuser::BackgroundSession, MountError> {
    let mount_path = session.state.lock().mount_path.clone();
    if session.is_mounted() {
        return Err(MountError::AlreadyMounted);
    }
    if !mount_path.is_dir() {
        return Err(MountError::InvalidArg);
    }

    let readonly = session.state.lock().readonly;
    let options = build_mount_options(&mount_path, readonly);
    start_background_workers(&session);
    session.state.lock().mounted = true;

    let fs = UnionFs::new(session.clone());
    fuser::spawn_mount2(fs, &mount_path, &options).map_err(|e| {
        session.state.lock().mounted = false;
        error!("background mount failed: {e}");
        MountError::ChannelMountFailed
    })
}

/// Full teardown sequence (spec §4.I step 8): stop the notification
/// worker, clear the mask tables, reset lifecycle flags, and emit the
/// exit-diagnostics block.
fn teardown(session: &Arc<Session>, loop_errno: Option<i32>) {
    session.set_channel_valid(false);
    session.notify.request_shutdown();
    session.masks.clear_all();

    let report = session.build_exit_report(loop_errno);
    let text = format_exit_report(&report);
    if loop_errno.is_some() {
        error!("{text}");
    } else {
        warn!("{text}");
    }

    let mut state = session.state.lock();
    state.mounted = false;
    state.index_ready = false;
}

/// Best-effort unmount of a path that may or may not be a live FUSE mount,
/// for use by a CLI `--unmount` flag or cleanup on startup. Shells out to
/// `umount`/`fusermount` the way a small driver binary typically would,
/// since there is no portable libc call for "unmount if mounted".
pub fn unmount_path(mount_path: &Path) -> Result<(), MountError> {
    let status = std::process::Command::new("umount")
        .arg(mount_path)
        .status();
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(_) => Err(MountError::NotMounted),
        Err(e) => {
            warn!("could not invoke umount for {mount_path:?}: {e}");
            Err(MountError::NotMounted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_mount_options_includes_rw_by_default_and_ro_when_requested() {
        let rw = build_mount_options(Path::new("/mnt/point"), false);
        assert!(rw.contains(&MountOption::RW));
        let ro = build_mount_options(Path::new("/mnt/point"), true);
        assert!(ro.contains(&MountOption::RO));
    }

    #[test]
    fn mounting_rejects_nonexistent_mount_path() {
        let logger: &'static crate::diag::DiagnosticLogger =
            Box::leak(Box::new(crate::diag::DiagnosticLogger::default()));
        let session = Session::new(
            PathBuf::from("/nonexistent-tierfuse-mountpoint-abcxyz"),
            PathBuf::from("/tmp"),
            None,
            logger,
        );
        let result = mount_blocking(session);
        assert_eq!(result, Err(MountError::InvalidArg));
    }
}
