//! The session: one value tying together mount state, the mask tables, the
//! notification bus, the diagnostic log and signal tracker, the inode table
//! FUSE's protocol needs, and the runtime-control API (spec §6) that lets an
//! embedding application drive the mount without going through the
//! filesystem itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fuser::FileType;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::diag::{self, DiagnosticLogger, ExitReport, Heartbeat, SignalTracker};
use crate::error::DriverError;
use crate::masks::MaskTables;
use crate::notify::{Callbacks, ChangeEvent, NotificationBus, NotifyCounters};
use crate::openslots::OpenSlotLimiter;
use crate::resolver;
use crate::state::{MountState, Tier};

pub const ROOT_INODE: u64 = 1;

/// A backing file handle kept open between `open`/`create` and `release`.
pub struct OpenFile {
    pub file: std::fs::File,
    pub tier: Tier,
    pub virtual_path: String,
}

/// A backing directory's children, snapshotted at `opendir` time so a
/// `readdir` sequence sees a consistent listing even if the directory
/// changes mid-iteration (mirrors how most FUSE passthroughs cope with
/// `readdir`'s byte-offset cursor).
pub struct OpenDir {
    pub entries: Vec<(u64, FileType, String)>,
}

/// Bidirectional inode <-> virtual-path table. Root is always inode 1.
/// New paths are assigned the next free inode; an unlink/rmdir does not
/// recycle its inode until the kernel's `forget` arrives, matching the
/// lookup-count contract FUSE expects.
struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    lookup_counts: HashMap<u64, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert("/".to_string(), ROOT_INODE);
        ino_to_path.insert(ROOT_INODE, "/".to_string());
        InodeTable {
            path_to_ino,
            ino_to_path,
            lookup_counts: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        }
    }

    /// Look up (or mint) the inode for `virtual_path`, bumping its lookup
    /// count by one as the FUSE lookup-count contract requires.
    fn intern(&mut self, virtual_path: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(virtual_path) {
            *self.lookup_counts.entry(ino).or_insert(0) += 1;
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(virtual_path.to_string(), ino);
        self.ino_to_path.insert(ino, virtual_path.to_string());
        self.lookup_counts.insert(ino, 1);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }

    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remaining = self
            .lookup_counts
            .get(&ino)
            .copied()
            .unwrap_or(0)
            .saturating_sub(nlookup);
        if remaining == 0 {
            self.lookup_counts.remove(&ino);
            if let Some(path) = self.ino_to_path.remove(&ino) {
                self.path_to_ino.remove(&path);
            }
        } else {
            self.lookup_counts.insert(ino, remaining);
        }
    }

    /// Re-point every inode rooted at `old_prefix` onto `new_prefix`, used
    /// by `rename` so descendants' inodes survive a directory rename.
    fn rename_prefix(&mut self, old_prefix: &str, new_prefix: &str) {
        let affected: Vec<(String, u64)> = self
            .path_to_ino
            .iter()
            .filter(|(p, _)| *p == old_prefix || p.starts_with(&format!("{old_prefix}/")))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old_path, ino) in affected {
            let new_path = if old_path == old_prefix {
                new_prefix.to_string()
            } else {
                format!("{new_prefix}{}", &old_path[old_prefix.len()..])
            };
            self.path_to_ino.remove(&old_path);
            self.path_to_ino.insert(new_path.clone(), ino);
            self.ino_to_path.insert(ino, new_path);
        }
    }
}

/// Operation counters surfaced through diagnostics and the exit report.
#[derive(Default)]
pub struct OpCounters {
    pub lookups: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
}

/// Everything one mounted union filesystem needs, built once at mount
/// start and torn down once the event loop returns.
pub struct Session {
    pub state: Mutex<MountState>,
    pub masks: MaskTables,
    pub open_slots: OpenSlotLimiter,
    pub notify: Arc<NotificationBus>,
    pub logger: &'static DiagnosticLogger,
    pub heartbeat: Heartbeat,
    pub signals: Arc<SignalTracker>,
    pub counters: OpCounters,
    inodes: Mutex<InodeTable>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    open_dirs: Mutex<HashMap<u64, OpenDir>>,
    next_fh: AtomicU64,
    channel_valid: RwLock<bool>,
}

impl Session {
    pub fn new(
        mount_path: PathBuf,
        local_root: PathBuf,
        external_root: Option<PathBuf>,
        logger: &'static DiagnosticLogger,
    ) -> Arc<Self> {
        Arc::new(Session {
            state: Mutex::new(MountState::new(mount_path, local_root, external_root)),
            masks: MaskTables::new(),
            open_slots: OpenSlotLimiter::new(),
            notify: NotificationBus::new(),
            logger,
            heartbeat: Heartbeat::new(),
            signals: Arc::new(SignalTracker::new()),
            counters: OpCounters::default(),
            inodes: Mutex::new(InodeTable::new()),
            open_files: Mutex::new(HashMap::new()),
            open_dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            channel_valid: RwLock::new(true),
        })
    }

    // -- inode helpers, used only by `fs.rs` --------------------------------

    pub fn intern_path(&self, virtual_path: &str) -> u64 {
        self.inodes.lock().intern(virtual_path)
    }

    pub fn path_of_ino(&self, ino: u64) -> Option<String> {
        self.inodes.lock().path_of(ino)
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.lock().forget(ino, nlookup);
    }

    pub fn rename_inode_prefix(&self, old_prefix: &str, new_prefix: &str) {
        self.inodes.lock().rename_prefix(old_prefix, new_prefix);
    }

    pub fn child_virtual_path(parent_path: &str, name: &str) -> String {
        if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    // -- file/dir handle tables ----------------------------------------------

    pub fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert_open_file(&self, fh: u64, open: OpenFile) {
        self.open_files.lock().insert(fh, open);
    }

    pub fn with_open_file<R>(&self, fh: u64, f: impl FnOnce(&OpenFile) -> R) -> Option<R> {
        self.open_files.lock().get(&fh).map(f)
    }

    pub fn with_open_file_mut<R>(&self, fh: u64, f: impl FnOnce(&mut OpenFile) -> R) -> Option<R> {
        self.open_files.lock().get_mut(&fh).map(f)
    }

    pub fn remove_open_file(&self, fh: u64) -> Option<OpenFile> {
        self.open_files.lock().remove(&fh)
    }

    pub fn insert_open_dir(&self, fh: u64, dir: OpenDir) {
        self.open_dirs.lock().insert(fh, dir);
    }

    pub fn with_open_dir<R>(&self, fh: u64, f: impl FnOnce(&OpenDir) -> R) -> Option<R> {
        self.open_dirs.lock().get(&fh).map(f)
    }

    pub fn remove_open_dir(&self, fh: u64) -> Option<OpenDir> {
        self.open_dirs.lock().remove(&fh)
    }

    // -- runtime-control API (spec §6) ---------------------------------------

    pub fn set_readonly(&self, readonly: bool) {
        self.state.lock().readonly = readonly;
        info!("readonly set to {readonly}");
    }

    pub fn set_external_offline(&self, offline: bool) {
        self.state.lock().external_offline = offline;
        info!("external tier offline set to {offline}");
    }

    pub fn update_external_dir(&self, dir: Option<PathBuf>) {
        self.state.lock().external_root = dir;
    }

    pub fn set_index_ready(&self, ready: bool) {
        self.state.lock().index_ready = ready;
        info!("index ready set to {ready}");
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    pub fn is_index_ready(&self) -> bool {
        self.state.lock().index_ready
    }

    pub fn is_loop_running(&self) -> bool {
        *self.channel_valid.read() && self.is_mounted()
    }

    pub fn mark_evicting(&self, virtual_path: &str) -> bool {
        self.masks.evicting.mark(virtual_path)
    }

    pub fn unmark_evicting(&self, virtual_path: &str) {
        self.masks.evicting.unmark(virtual_path);
    }

    pub fn clear_evicting(&self) {
        self.masks.evicting.clear();
    }

    pub fn sync_lock(&self, virtual_path: &str) {
        self.masks.syncing.lock_path(virtual_path);
    }

    pub fn sync_unlock(&self, virtual_path: &str) {
        self.masks.syncing.unlock_path(virtual_path);
    }

    pub fn sync_unlock_all(&self) {
        self.masks.syncing.unlock_all();
    }

    pub fn set_debug(&self, enabled: bool) {
        self.logger.set_debug(enabled);
    }

    pub fn set_log_path(&self, path: Option<&Path>) -> std::io::Result<()> {
        self.logger.set_log_path(path)
    }

    pub fn flush_logs(&self) {
        self.logger.flush();
    }

    pub fn set_callbacks(&self, callbacks: Callbacks) {
        self.notify.set_callbacks(callbacks);
    }

    pub fn notify_counters(&self) -> NotifyCounters {
        self.notify.counters()
    }

    pub fn set_channel_valid(&self, valid: bool) {
        *self.channel_valid.write() = valid;
    }

    /// Assemble the exit-diagnostics block (spec §4.K).
    pub fn build_exit_report(&self, loop_result_errno: Option<i32>) -> ExitReport {
        let state = self.state.lock();
        let mount_point_stat_ok = std::fs::metadata(&state.mount_path).is_ok();
        let statfs_ok = statvfs_ok(&state.mount_path);
        ExitReport {
            loop_result_errno,
            last_signal: self.signals.last_signal(),
            total_ops: self.heartbeat.total_ops(),
            seconds_since_last_op: self.heartbeat.seconds_since_last_op(),
            notify: self.notify.counters(),
            macfuse_dev_count: diag::count_macfuse_dev_nodes(),
            mount_point_stat_ok,
            statfs_ok,
            channel_valid: *self.channel_valid.read(),
        }
    }

    /// Readiness gate (spec §4.F): every non-root operation must pass this
    /// before touching backing storage.
    /// Presented owner uid/gid (spec §3): the mount owner, never the backing
    /// file's actual owner.
    pub fn owner(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.owner_uid, state.owner_gid)
    }

    pub fn check_ready(&self) -> Result<(), DriverError> {
        if self.is_index_ready() {
            Ok(())
        } else {
            Err(DriverError::RetryableBusy)
        }
    }

    pub fn check_path_depth(&self, virtual_path: &str) -> Result<(), DriverError> {
        if resolver::is_too_deep(virtual_path) {
            Err(DriverError::PathTooDeep)
        } else {
            Ok(())
        }
    }

    pub fn record_op(&self) {
        self.heartbeat.record_op();
    }

    pub fn publish(&self, event: ChangeEvent) {
        debug!("notify: {event:?}");
        self.notify.publish(event);
    }
}

fn statvfs_ok(path: &Path) -> bool {
    let c_path = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_interns_paths_and_bumps_lookup_count() {
        let mut table = InodeTable::new();
        let a = table.intern("/a");
        let a_again = table.intern("/a");
        assert_eq!(a, a_again);
        assert_eq!(*table.lookup_counts.get(&a).unwrap(), 2);
    }

    #[test]
    fn forget_removes_inode_once_count_reaches_zero() {
        let mut table = InodeTable::new();
        let ino = table.intern("/a");
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_none());
    }

    #[test]
    fn forget_on_root_is_a_noop() {
        let mut table = InodeTable::new();
        table.forget(ROOT_INODE, 1_000_000);
        assert_eq!(table.path_of(ROOT_INODE), Some("/".to_string()));
    }

    #[test]
    fn rename_prefix_repoints_descendants() {
        let mut table = InodeTable::new();
        let dir = table.intern("/a");
        let child = table.intern("/a/b");
        table.rename_prefix("/a", "/z");
        assert_eq!(table.path_of(dir), Some("/z".to_string()));
        assert_eq!(table.path_of(child), Some("/z/b".to_string()));
    }

    #[test]
    fn child_virtual_path_handles_root_parent() {
        assert_eq!(Session::child_virtual_path("/", "f"), "/f");
        assert_eq!(Session::child_virtual_path("/a", "f"), "/a/f");
    }
}
