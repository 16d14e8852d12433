//! The `fuser::Filesystem` implementation: the union view over the local
//! and external tiers, built directly on the resolver, mask tables, copy-up
//! engine, and session runtime state.
//!
//! Reply shapes and attribute construction follow a standard passthrough
//! filesystem, reworked from a single-root passthrough into a two-tier
//! union: every handler resolves a virtual path through `resolver::resolve`
//! instead of trusting one fixed backing root.

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
};
use log::warn;

use crate::copyup;
use crate::error::DriverError;
use crate::exclude::is_excluded;
use crate::resolver;
use crate::session::{OpenDir, OpenFile, Session};
use crate::state::{MountState, Tier};

bitflags::bitflags! {
    /// The subset of POSIX `open(2)` flags this driver branches on, modeled
    /// the way `fuser`'s own kernel-protocol flag types
    /// (`ll::flags::ReleaseFlags`, `ll::write_flags::WriteFlags`) wrap a raw
    /// bitmask instead of testing `flags & FOO != 0` inline everywhere.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct OpenFlags: i32 {
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
    }
}

impl OpenFlags {
    fn wants_write(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Attribute cache / entry cache TTL handed back with every `ReplyEntry` /
/// `ReplyAttr`. Kept short: the whole point of the union view is that the
/// backing tiers can change out from under us (eviction, external going
/// offline), so we'd rather the kernel re-ask than serve stale attrs.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Permission-swallowing ops (spec §7: chmod/chown/utimens/setxattr) report
/// success even when the backing syscall returns EPERM/EACCES, since the
/// union mount is commonly used from a non-root process against files it
/// doesn't own on the external tier.
fn swallow_permission_errors(result: std::io::Result<()>) -> Result<(), DriverError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::PermissionDenied) => Ok(()),
        Err(e) => Err(DriverError::from_io(&e)),
    }
}

/// Normalize a backing `stat` into the attrs this mount presents (spec §3):
/// owner uid/gid are always the mount owner, never the backing file's own
/// owner; mode is 0755 for directories and `0644 | (backing & 0100)` for
/// regular files, so upper-layer tools see a uniform permission model no
/// matter what the backing tier's actual permissions are. Symlinks and
/// special files keep their backing mode bits — the spec only normalizes
/// directories and regular files. Size/times/nlink pass through unchanged.
fn meta_to_attr(ino: u64, m: &std::fs::Metadata, owner_uid: u32, owner_gid: u32) -> FileAttr {
    let kind = file_type_of(m);
    let backing_mode = m.permissions().mode();
    let perm = match kind {
        FileType::Directory => 0o755,
        FileType::RegularFile => 0o644 | (backing_mode & 0o100),
        _ => backing_mode & 0o7777,
    };
    FileAttr {
        ino,
        size: m.size(),
        blocks: m.blocks(),
        atime: m.accessed().unwrap_or(UNIX_EPOCH),
        mtime: m.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::from_secs(m.ctime().max(0) as u64),
        crtime: m.created().unwrap_or(UNIX_EPOCH),
        kind,
        perm: perm as u16,
        nlink: m.nlink() as u32,
        uid: owner_uid,
        gid: owner_gid,
        rdev: m.rdev() as u32,
        blksize: m.blksize() as u32,
        flags: 0,
    }
}

fn file_type_of(m: &std::fs::Metadata) -> FileType {
    let ft = m.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_file() {
        FileType::RegularFile
    } else {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_fifo() {
            FileType::NamedPipe
        } else if ft.is_char_device() {
            FileType::CharDevice
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else if ft.is_socket() {
            FileType::Socket
        } else {
            FileType::RegularFile
        }
    }
}

/// The live `fuser::Filesystem`. Holds only the session handle: all mutable
/// state lives in `Session` so the runtime-control API (spec §6) can reach
/// it from outside the FUSE callback thread.
pub struct UnionFs {
    pub session: Arc<Session>,
}

impl UnionFs {
    pub fn new(session: Arc<Session>) -> Self {
        UnionFs { session }
    }

    fn resolve_ino(&self, ino: u64) -> Result<(String, Tier, PathBuf), DriverError> {
        let virtual_path = self.session.path_of_ino(ino).ok_or(DriverError::NotFound)?;
        let state = self.session.state.lock();
        let (tier, backing) = resolver::resolve(&state, &self.session.masks.evicting, &virtual_path)
            .ok_or(DriverError::NotFound)?;
        Ok((virtual_path, tier, backing))
    }

    fn stat_ino(&self, ino: u64) -> Result<FileAttr, DriverError> {
        let (_, _, backing) = self.resolve_ino(ino)?;
        let meta = fs::symlink_metadata(&backing).map_err(|e| DriverError::from_io(&e))?;
        let (uid, gid) = self.session.owner();
        Ok(meta_to_attr(ino, &meta, uid, gid))
    }

    /// Five-step delete sequence (spec §4.D): publish to the pending-delete
    /// mask and the notification bus before touching storage, remove the
    /// local copy, best-effort remove the external copy, then clear the
    /// pending-delete entry only if nothing is left resolvable.
    fn delete_path(&self, virtual_path: &str, is_dir: bool) -> Result<(), DriverError> {
        self.session.masks.pending_delete.add(virtual_path);
        self.session.publish(crate::notify::ChangeEvent::deleted(virtual_path, is_dir));

        let state = self.session.state.lock();
        let local = resolver::local_of(&state, virtual_path);
        let external = resolver::external_of(&state, virtual_path);
        drop(state);

        let remove_one = |p: &Path, is_dir: bool| -> std::io::Result<()> {
            if is_dir {
                fs::remove_dir(p)
            } else {
                fs::remove_file(p)
            }
        };

        let local_result = if local.exists() {
            remove_one(&local, is_dir)
        } else {
            Ok(())
        };

        if let Err(e) = &local_result {
            if e.kind() != std::io::ErrorKind::NotFound {
                self.session.masks.pending_delete.remove(virtual_path);
                return Err(DriverError::from_io(e));
            }
        }

        let mut external_failed = false;
        if let Some(external_path) = external {
            if external_path.exists() {
                if let Err(e) = remove_one(&external_path, is_dir) {
                    warn!("external removal of {virtual_path} failed, local copy is gone: {e}");
                    external_failed = true;
                }
            }
        }

        // Only un-hide the path once nothing is left to hide: a failed
        // external removal must keep the ghost masked so readdir keeps
        // omitting it (spec §4.D unlink, §8 scenario 3).
        if !external_failed {
            self.session.masks.pending_delete.remove(virtual_path);
        }
        self.session.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rename sequence (spec §4.D): copy up an external-only source before
    /// the local rename has anything to move, rename within local, then
    /// best-effort mirror onto a live external tier.
    fn rename_path(&self, old_virtual: &str, new_virtual: &str) -> Result<(), DriverError> {
        let state = self.session.state.lock();
        let old_local = resolver::local_of(&state, old_virtual);
        let new_local = resolver::local_of(&state, new_virtual);
        let old_external = resolver::external_of(&state, old_virtual);
        drop(state);

        if !old_local.exists() {
            if let Some(ext) = &old_external {
                if ext.exists() {
                    self.promote_for_write(old_virtual, ext)?;
                }
            }
        }

        let is_dir = old_local.is_dir();

        if old_local.exists() {
            if let Some(parent) = new_local.parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::rename(&old_local, &new_local).map_err(|e| DriverError::from_io(&e))?;
        }

        // Best-effort mirror of the rename onto a live external tier.
        // Failures here are not fatal: the local rename above is the one
        // the kernel's view depends on.
        let state = self.session.state.lock();
        let ext_from = resolver::external_of(&state, old_virtual);
        let ext_to = resolver::external_of(&state, new_virtual);
        drop(state);
        if let (Some(ext_from), Some(ext_to)) = (ext_from, ext_to) {
            if ext_from.exists() {
                if let Some(parent) = ext_to.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::rename(&ext_from, &ext_to) {
                    warn!("external rename of {old_virtual} -> {new_virtual} failed: {e}");
                }
            }
        }

        // Per design, rename does not rewrite eviction/pending-delete mask
        // entries recorded under the old name; they expire naturally.
        self.session.rename_inode_prefix(old_virtual, new_virtual);
        self.session
            .publish(crate::notify::ChangeEvent::renamed(old_virtual, new_virtual, is_dir));
        Ok(())
    }
}

macro_rules! guarded {
    ($self:expr, $reply:expr) => {
        if let Err(e) = $self.session.check_ready() {
            $reply.error(e.as_errno());
            return;
        }
        $self.session.record_op();
    };
}

/// Like `guarded!`, but the readiness gate is not consulted for the root
/// inode: spec §4.D/§4.F carve out root `getattr`/`readdir` so the mount
/// looks mounted (if empty) even while the upper layer's index isn't ready
/// yet.
macro_rules! guarded_root_exempt {
    ($self:expr, $ino:expr, $reply:expr) => {
        if $ino != crate::session::ROOT_INODE {
            if let Err(e) = $self.session.check_ready() {
                $reply.error(e.as_errno());
                return;
            }
        }
        $self.session.record_op();
    };
}

impl Filesystem for UnionFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        guarded!(self, reply);
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        if is_excluded(OsStr::new(name)) {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(parent_path) = self.session.path_of_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&parent_path, name);
        if let Err(e) = self.session.check_path_depth(&virtual_path) {
            reply.error(e.as_errno());
            return;
        }
        let state = self.session.state.lock();
        match resolver::resolve(&state, &self.session.masks.evicting, &virtual_path) {
            Some((_, backing)) => {
                drop(state);
                match fs::symlink_metadata(&backing) {
                    Ok(meta) => {
                        let ino = self.session.intern_path(&virtual_path);
                        self.session.counters.lookups.fetch_add(1, Ordering::Relaxed);
                        let (uid, gid) = self.session.owner();
                        reply.entry(&ATTR_TTL, &meta_to_attr(ino, &meta, uid, gid), 0);
                    }
                    Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
                }
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.session.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        guarded_root_exempt!(self, ino, reply);
        match self.stat_ino(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let (virtual_path, tier, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.as_errno());
                return;
            }
        };
        let backing = if tier == Tier::External {
            match self.promote_for_write(&virtual_path, &backing) {
                Ok(local) => local,
                Err(e) => {
                    reply.error(e.as_errno());
                    return;
                }
            }
        } else {
            backing
        };

        if let Some(mode) = mode {
            let result =
                swallow_permission_errors(fs::set_permissions(&backing, fs::Permissions::from_mode(mode)));
            if let Err(e) = result {
                reply.error(e.as_errno());
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            let result = swallow_permission_errors(std::os::unix::fs::chown(&backing, uid, gid));
            if let Err(e) = result {
                reply.error(e.as_errno());
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let result = swallow_permission_errors(set_times(&backing, atime, mtime));
            if let Err(e) = result {
                reply.error(e.as_errno());
                return;
            }
        }
        if let Some(size) = size {
            let truncated = if let Some(fh) = fh {
                self.session
                    .with_open_file(fh, |of| of.file.set_len(size))
                    .unwrap_or_else(|| fs::File::options().write(true).open(&backing).and_then(|f| f.set_len(size)))
            } else {
                fs::OpenOptions::new().write(true).open(&backing).and_then(|f| f.set_len(size))
            };
            if let Err(e) = truncated {
                reply.error(DriverError::from_io(&e).as_errno());
                return;
            }
        }

        self.session.publish(crate::notify::ChangeEvent::written(&virtual_path));
        match fs::symlink_metadata(&backing) {
            Ok(meta) => {
                let (owner_uid, owner_gid) = self.session.owner();
                reply.attr(&ATTR_TTL, &meta_to_attr(ino, &meta, owner_uid, owner_gid))
            }
            Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        guarded!(self, reply);
        let (_, _, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => return reply.error(e.as_errno()),
        };
        match fs::read_link(&backing) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.session.path_of_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&parent_path, name);
        let local = resolver::local_of(&self.session.state.lock(), &virtual_path);
        if let Some(parent_dir) = local.parent() {
            let _ = fs::create_dir_all(parent_dir);
        }
        match fs::create_dir(&local) {
            Ok(()) => {
                let _ = fs::set_permissions(&local, fs::Permissions::from_mode(mode));
                let ino = self.session.intern_path(&virtual_path);
                self.session
                    .publish(crate::notify::ChangeEvent::created(&virtual_path, &local.to_string_lossy(), true));
                match fs::symlink_metadata(&local) {
                    Ok(meta) => {
                        let (owner_uid, owner_gid) = self.session.owner();
                        reply.entry(&ATTR_TTL, &meta_to_attr(ino, &meta, owner_uid, owner_gid), 0)
                    }
                    Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
                }
            }
            Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.session.path_of_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&parent_path, name);
        match self.delete_path(&virtual_path, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.session.path_of_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&parent_path, name);
        match self.delete_path(&virtual_path, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let Some(name) = link_name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.session.path_of_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&parent_path, name);
        let local = resolver::local_of(&self.session.state.lock(), &virtual_path);
        match std::os::unix::fs::symlink(target, &local) {
            Ok(()) => {
                let ino = self.session.intern_path(&virtual_path);
                self.session.publish(crate::notify::ChangeEvent::created(
                    &virtual_path,
                    &local.to_string_lossy(),
                    false,
                ));
                match fs::symlink_metadata(&local) {
                    Ok(meta) => {
                        let (owner_uid, owner_gid) = self.session.owner();
                        reply.entry(&ATTR_TTL, &meta_to_attr(ino, &meta, owner_uid, owner_gid), 0)
                    }
                    Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
                }
            }
            Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (Some(parent_path), Some(newparent_path)) =
            (self.session.path_of_ino(parent), self.session.path_of_ino(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let old_virtual = Session::child_virtual_path(&parent_path, name);
        let new_virtual = Session::child_virtual_path(&newparent_path, newname);

        match self.rename_path(&old_virtual, &new_virtual) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        guarded!(self, reply);
        let (_, _, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => return reply.error(e.as_errno()),
        };
        let Some(name) = newname.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(newparent_path) = self.session.path_of_ino(newparent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&newparent_path, name);
        let local = resolver::local_of(&self.session.state.lock(), &virtual_path);
        match fs::hard_link(&backing, &local) {
            Ok(()) => {
                let new_ino = self.session.intern_path(&virtual_path);
                match fs::symlink_metadata(&local) {
                    Ok(meta) => {
                        let (owner_uid, owner_gid) = self.session.owner();
                        reply.entry(&ATTR_TTL, &meta_to_attr(new_ino, &meta, owner_uid, owner_gid), 0)
                    }
                    Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
                }
            }
            Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        guarded!(self, reply);
        if !self.session.open_slots.acquire() {
            reply.error(DriverError::TooManyOpenFiles.as_errno());
            return;
        }
        let wants_write = OpenFlags::from_bits_truncate(flags).wants_write();
        let (virtual_path, tier, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => {
                self.session.open_slots.release();
                reply.error(e.as_errno());
                return;
            }
        };

        let (final_tier, final_path) = if wants_write && tier == Tier::External {
            match self.promote_for_write(&virtual_path, &backing) {
                Ok(local) => (Tier::Local, local),
                Err(e) => {
                    self.session.open_slots.release();
                    reply.error(e.as_errno());
                    return;
                }
            }
        } else {
            (tier, backing)
        };

        let opts = open_options_for_flags(flags);
        match opts.open(&final_path) {
            Ok(file) => {
                let fh = self.session.alloc_fh();
                self.session.insert_open_file(
                    fh,
                    OpenFile {
                        file,
                        tier: final_tier,
                        virtual_path,
                    },
                );
                reply.opened(fh, 0);
            }
            Err(e) => {
                self.session.open_slots.release();
                reply.error(DriverError::from_io(&e).as_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        guarded!(self, reply);
        let mut buf = vec![0u8; size as usize];
        let result = self.session.with_open_file(fh, |of| {
            of.file.read_at(&mut buf, offset.max(0) as u64)
        });
        match result {
            Some(Ok(n)) => {
                // Only the counter is bumped here, not a change-notification
                // event: reads happen far more often than writes/creates, and
                // nothing in the notification consumer's dispatch table acts
                // on `ChangeEvent::Read` today. The variant and constructor
                // stay available for an embedder that wants to wire one up.
                self.session.counters.reads.fetch_add(1, Ordering::Relaxed);
                reply.data(&buf[..n]);
            }
            Some(Err(e)) => reply.error(DriverError::from_io(&e).as_errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        let result = self
            .session
            .with_open_file(fh, |of| of.file.write_at(data, offset.max(0) as u64));
        match result {
            Some(Ok(n)) => {
                self.session.counters.writes.fetch_add(1, Ordering::Relaxed);
                reply.written(n as u32);
            }
            Some(Err(e)) => reply.error(DriverError::from_io(&e).as_errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        guarded!(self, reply);
        match self.session.with_open_file(fh, |of| of.file.sync_all()) {
            Some(Ok(())) => reply.ok(),
            Some(Err(e)) => reply.error(DriverError::from_io(&e).as_errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // `written` fires unconditionally on release, matching the original
        // driver's behavior rather than gating it on whether a write
        // actually happened in this open/close cycle.
        if let Some(open) = self.session.remove_open_file(fh) {
            self.session.open_slots.release();
            self.session.publish(crate::notify::ChangeEvent::written(&open.virtual_path));
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        guarded!(self, reply);
        match self.session.with_open_file(fh, |of| of.file.sync_all()) {
            Some(Ok(())) => reply.ok(),
            Some(Err(e)) => reply.error(DriverError::from_io(&e).as_errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        guarded_root_exempt!(self, ino, reply);
        if !self.session.open_slots.acquire() {
            reply.error(DriverError::TooManyOpenFiles.as_errno());
            return;
        }
        let virtual_path = match self.session.path_of_ino(ino) {
            Some(p) => p,
            None => {
                self.session.open_slots.release();
                reply.error(libc::ENOENT);
                return;
            }
        };
        // Root stays navigable (but empty) while the readiness gate is
        // closed, so host UIs see a mounted-but-empty tree instead of a
        // hard failure (spec §4.D/§4.F).
        let entries = if ino == crate::session::ROOT_INODE && !self.session.is_index_ready() {
            vec![
                (ino, FileType::Directory, ".".to_string()),
                (ino, FileType::Directory, "..".to_string()),
            ]
        } else {
            self.list_union_dir(&virtual_path)
        };
        let fh = self.session.alloc_fh();
        self.session.insert_open_dir(fh, OpenDir { entries });
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        guarded_root_exempt!(self, ino, reply);
        let Some(entries) = self.session.with_open_dir(fh, |d| d.entries.clone()) else {
            reply.error(libc::EBADF);
            return;
        };
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        if self.session.remove_open_dir(fh).is_some() {
            self.session.open_slots.release();
        }
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let state = self.session.state.lock();
        let path = state.local_root.clone();
        drop(state);
        match statvfs(&path) {
            Ok(s) => reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, 255, s.frsize),
            Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        guarded!(self, reply);
        let (virtual_path, _, _) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => return reply.error(e.as_errno()),
        };
        // com.apple.* xattrs are routine Finder/Spotlight chatter managed by
        // the kernel and security framework; report success unconditionally
        // regardless of the underlying call's outcome (spec §4.D setxattr
        // row).
        if is_apple_reserved_xattr(name) {
            reply.ok();
            return;
        }
        let local = resolver::local_of(&self.session.state.lock(), &virtual_path);
        match swallow_permission_errors(xattr_set(&local, name, value)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        guarded!(self, reply);
        let (_, _, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => return reply.error(e.as_errno()),
        };
        match xattr_get(&backing, name) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&data);
                }
            }
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        guarded!(self, reply);
        let (_, _, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => return reply.error(e.as_errno()),
        };
        match xattr_list(&backing) {
            Ok(names) => {
                if size == 0 {
                    reply.size(names.len() as u32);
                } else if names.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&names);
                }
            }
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        guarded!(self, reply);
        let (_, _, backing) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(e) => return reply.error(e.as_errno()),
        };
        match swallow_permission_errors(xattr_remove(&backing, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        guarded!(self, reply);
        // Existence check only: the presented owner/mode are synthetic and
        // uniform, so permissions are always granted once the path resolves
        // (spec §4.D access row).
        match self.resolve_ino(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.as_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        guarded!(self, reply);
        if self.session.state.lock().readonly {
            reply.error(DriverError::ReadOnly.as_errno());
            return;
        }
        if !self.session.open_slots.acquire() {
            reply.error(DriverError::TooManyOpenFiles.as_errno());
            return;
        }
        let Some(name) = name.to_str() else {
            self.session.open_slots.release();
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.session.path_of_ino(parent) else {
            self.session.open_slots.release();
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = Session::child_virtual_path(&parent_path, name);
        let local = resolver::local_of(&self.session.state.lock(), &virtual_path);
        if let Some(parent_dir) = local.parent() {
            let _ = fs::create_dir_all(parent_dir);
        }
        let opts = open_options_for_flags(flags | libc::O_CREAT);
        match opts.mode(mode).open(&local) {
            Ok(file) => {
                let ino = self.session.intern_path(&virtual_path);
                let fh = self.session.alloc_fh();
                self.session.insert_open_file(
                    fh,
                    OpenFile {
                        file,
                        tier: Tier::Local,
                        virtual_path: virtual_path.clone(),
                    },
                );
                self.session.publish(crate::notify::ChangeEvent::created(
                    &virtual_path,
                    &local.to_string_lossy(),
                    false,
                ));
                match fs::symlink_metadata(&local) {
                    Ok(meta) => {
                        let (owner_uid, owner_gid) = self.session.owner();
                        reply.created(&ATTR_TTL, &meta_to_attr(ino, &meta, owner_uid, owner_gid), 0, fh, 0)
                    }
                    Err(e) => reply.error(DriverError::from_io(&e).as_errno()),
                }
            }
            Err(e) => {
                self.session.open_slots.release();
                reply.error(DriverError::from_io(&e).as_errno());
            }
        }
    }
}

impl UnionFs {
    /// Copy a file up from the external tier to the local tier ahead of a
    /// write, returning the new local backing path. Spec §4.E.
    fn promote_for_write(&self, virtual_path: &str, external_path: &Path) -> Result<PathBuf, DriverError> {
        let state = self.session.state.lock();
        if state.readonly {
            return Err(DriverError::ReadOnly);
        }
        let local_path = resolver::local_of(&state, virtual_path);
        let owner_state = MountState {
            mount_path: state.mount_path.clone(),
            local_root: state.local_root.clone(),
            external_root: state.external_root.clone(),
            mounted: state.mounted,
            external_offline: state.external_offline,
            readonly: state.readonly,
            index_ready: state.index_ready,
            owner_uid: state.owner_uid,
            owner_gid: state.owner_gid,
        };
        drop(state);
        copyup::copy_up(&owner_state, external_path, &local_path)?;
        self.session.publish(crate::notify::ChangeEvent::created(
            virtual_path,
            &local_path.to_string_lossy(),
            false,
        ));
        Ok(local_path)
    }

    /// Union a directory listing: local entries first, then external
    /// entries not shadowed by a same-named local entry or hidden by the
    /// eviction/pending-delete masks. `.`/`..` are synthesized first.
    fn list_union_dir(&self, virtual_path: &str) -> Vec<(u64, FileType, String)> {
        let state = self.session.state.lock();
        let local_dir = resolver::local_of(&state, virtual_path);
        let external_dir = resolver::external_of(&state, virtual_path);
        drop(state);

        let mut out = vec![(1, FileType::Directory, ".".to_string()), (1, FileType::Directory, "..".to_string())];
        let mut seen = std::collections::HashSet::new();

        if let Ok(read) = fs::read_dir(&local_dir) {
            for entry in read.flatten() {
                let name = entry.file_name();
                if is_excluded(&name) {
                    continue;
                }
                let Some(name_str) = name.to_str() else { continue };
                let child_virtual = Session::child_virtual_path(virtual_path, name_str);
                if self.session.masks.pending_delete.contains(&child_virtual) {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    let ino = self.session.intern_path(&child_virtual);
                    out.push((ino, file_type_of(&meta), name_str.to_string()));
                    seen.insert(name_str.to_string());
                }
            }
        }

        if let Some(external_dir) = external_dir {
            if let Ok(read) = fs::read_dir(&external_dir) {
                for entry in read.flatten() {
                    let name = entry.file_name();
                    if is_excluded(&name) {
                        continue;
                    }
                    let Some(name_str) = name.to_str() else { continue };
                    if seen.contains(name_str) {
                        continue;
                    }
                    let child_virtual = Session::child_virtual_path(virtual_path, name_str);
                    if self.session.masks.pending_delete.contains(&child_virtual)
                        || self.session.masks.evicting.contains(&child_virtual)
                    {
                        continue;
                    }
                    if let Ok(meta) = entry.metadata() {
                        let ino = self.session.intern_path(&child_virtual);
                        out.push((ino, file_type_of(&meta), name_str.to_string()));
                    }
                }
            }
        }
        out
    }
}

fn open_options_for_flags(flags: i32) -> OpenOptions {
    let open_flags = OpenFlags::from_bits_truncate(flags);
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => {
            opts.read(true);
        }
        libc::O_WRONLY => {
            opts.write(true);
        }
        _ => {
            opts.read(true).write(true);
        }
    }
    if open_flags.contains(OpenFlags::CREAT) {
        opts.create(true);
    }
    if open_flags.contains(OpenFlags::TRUNC) {
        opts.truncate(true);
    }
    if open_flags.contains(OpenFlags::APPEND) {
        opts.append(true);
    }
    opts
}

struct StatvfsResult {
    blocks: u64,
    bfree: u64,
    bavail: u64,
    files: u64,
    ffree: u64,
    bsize: u32,
    frsize: u32,
}

fn statvfs(path: &Path) -> std::io::Result<StatvfsResult> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(StatvfsResult {
        blocks: buf.f_blocks as u64,
        bfree: buf.f_bfree as u64,
        bavail: buf.f_bavail as u64,
        files: buf.f_files as u64,
        ffree: buf.f_ffree as u64,
        bsize: buf.f_bsize as u32,
        frsize: buf.f_frsize as u32,
    })
}

fn xattr_set(path: &Path, name: &OsStr, value: &[u8]) -> std::io::Result<()> {
    let c_path = cstr(path)?;
    let c_name = cstr_osstr(name)?;
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn xattr_get(path: &Path, name: &OsStr) -> Result<Vec<u8>, DriverError> {
    let c_path = cstr(path).map_err(|e| DriverError::from_io(&e))?;
    let c_name = cstr_osstr(name).map_err(|e| DriverError::from_io(&e))?;
    let needed = unsafe {
        libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
    };
    if needed < 0 {
        return Err(DriverError::from_io(&std::io::Error::last_os_error()));
    }
    let mut buf = vec![0u8; needed as usize];
    let got = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if got < 0 {
        return Err(DriverError::from_io(&std::io::Error::last_os_error()));
    }
    buf.truncate(got as usize);
    Ok(buf)
}

fn xattr_list(path: &Path) -> Result<Vec<u8>, DriverError> {
    let c_path = cstr(path).map_err(|e| DriverError::from_io(&e))?;
    let needed = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(DriverError::from_io(&std::io::Error::last_os_error()));
    }
    let mut buf = vec![0u8; needed as usize];
    let got =
        unsafe { libc::listxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if got < 0 {
        return Err(DriverError::from_io(&std::io::Error::last_os_error()));
    }
    buf.truncate(got as usize);
    Ok(buf)
}

fn xattr_remove(path: &Path, name: &OsStr) -> std::io::Result<()> {
    let c_path = cstr(path)?;
    let c_name = cstr_osstr(name)?;
    let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Convert a `fuser::TimeOrNow` into the `libc::timespec` `utimensat` wants,
/// using `UTIME_OMIT`/`UTIME_NOW` for the absent/now cases instead of
/// resolving "now" ourselves (avoids a TOCTOU gap against the kernel's own
/// clock read).
fn time_or_now_to_timespec(t: Option<fuser::TimeOrNow>) -> libc::timespec {
    match t {
        None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT as i64 },
        Some(fuser::TimeOrNow::Now) => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_NOW as i64 },
        Some(fuser::TimeOrNow::SpecificTime(time)) => {
            let dur = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: dur.subsec_nanos() as i64,
            }
        }
    }
}

/// Apply `atime`/`mtime` to `path` via `utimensat`. A no-op (not even a
/// syscall) when both are `None`, matching every other setattr field's
/// apply-only-if-present treatment.
fn set_times(
    path: &Path,
    atime: Option<fuser::TimeOrNow>,
    mtime: Option<fuser::TimeOrNow>,
) -> std::io::Result<()> {
    if atime.is_none() && mtime.is_none() {
        return Ok(());
    }
    let c_path = cstr(path)?;
    let times = [time_or_now_to_timespec(atime), time_or_now_to_timespec(mtime)];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// `com.apple.*` xattrs are Finder/Spotlight bookkeeping the kernel and
/// security framework manage out of band; setxattr reports success for
/// these unconditionally (spec §4.D setxattr row).
fn is_apple_reserved_xattr(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with("com.apple."))
}

fn cstr(path: &Path) -> std::io::Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))
}

fn cstr_osstr(name: &OsStr) -> std::io::Result<std::ffi::CString> {
    std::ffi::CString::new(name.as_encoded_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_flags_detects_write_intent() {
        assert!(!OpenFlags::from_bits_truncate(libc::O_RDONLY).wants_write());
        assert!(OpenFlags::from_bits_truncate(libc::O_WRONLY).wants_write());
        assert!(OpenFlags::from_bits_truncate(libc::O_RDWR).wants_write());
        assert!(OpenFlags::from_bits_truncate(libc::O_WRONLY | libc::O_CREAT).contains(OpenFlags::CREAT));
    }

    fn new_session(local: &Path, external: Option<&Path>) -> Arc<Session> {
        let logger: &'static crate::diag::DiagnosticLogger = Box::leak(Box::new(crate::diag::DiagnosticLogger::default()));
        let session = Session::new(
            PathBuf::from("/mnt"),
            local.to_path_buf(),
            external.map(Path::to_path_buf),
            logger,
        );
        session.set_index_ready(true);
        session
    }

    #[test]
    fn meta_to_attr_normalizes_dir_mode_and_owner() {
        let dir = tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        let meta = fs::symlink_metadata(dir.path()).unwrap();
        let attr = meta_to_attr(42, &meta, 4242, 4343);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.uid, 4242);
        assert_eq!(attr.gid, 4343);
        assert_eq!(attr.kind, FileType::Directory);
    }

    #[test]
    fn meta_to_attr_normalizes_regular_file_mode_keeping_execute_bit() {
        let dir = tempdir().unwrap();
        let exec_path = dir.path().join("exec");
        fs::write(&exec_path, b"x").unwrap();
        fs::set_permissions(&exec_path, fs::Permissions::from_mode(0o741)).unwrap();
        let meta = fs::symlink_metadata(&exec_path).unwrap();
        let attr = meta_to_attr(7, &meta, 10, 20);
        assert_eq!(attr.perm, 0o644 | 0o100);
        assert_eq!(attr.uid, 10);
        assert_eq!(attr.gid, 20);

        let noexec_path = dir.path().join("noexec");
        fs::write(&noexec_path, b"x").unwrap();
        fs::set_permissions(&noexec_path, fs::Permissions::from_mode(0o600)).unwrap();
        let meta = fs::symlink_metadata(&noexec_path).unwrap();
        let attr = meta_to_attr(8, &meta, 10, 20);
        assert_eq!(attr.perm, 0o644);
    }

    #[test]
    fn list_union_dir_prefers_local_over_external_same_name() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(local.path().join("f"), b"local").unwrap();
        fs::write(external.path().join("f"), b"external").unwrap();
        fs::write(external.path().join("only_ext"), b"x").unwrap();

        let session = new_session(local.path(), Some(external.path()));
        let ufs = UnionFs::new(session);
        let entries = ufs.list_union_dir("/");
        let names: Vec<_> = entries.iter().map(|(_, _, n)| n.clone()).collect();
        assert_eq!(names.iter().filter(|n| *n == "f").count(), 1);
        assert!(names.contains(&"only_ext".to_string()));
    }

    #[test]
    fn list_union_dir_hides_excluded_names() {
        let local = tempdir().unwrap();
        fs::write(local.path().join(".DS_Store"), b"x").unwrap();
        let session = new_session(local.path(), None);
        let ufs = UnionFs::new(session);
        let entries = ufs.list_union_dir("/");
        assert!(!entries.iter().any(|(_, _, n)| n == ".DS_Store"));
    }

    #[test]
    fn delete_path_clears_pending_mark_after_success() {
        let local = tempdir().unwrap();
        fs::write(local.path().join("f"), b"x").unwrap();
        let session = new_session(local.path(), None);
        let ufs = UnionFs::new(session.clone());
        ufs.delete_path("/f", false).unwrap();
        assert!(!session.masks.pending_delete.contains("/f"));
        assert!(!local.path().join("f").exists());
    }

    #[test]
    fn delete_path_retains_pending_mark_when_external_removal_fails() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(local.path().join("stale"), b"x").unwrap();
        // Stand in for a permission-denied external removal (spec §8
        // scenario 3): `delete_path` is called with `is_dir = false`, so
        // `remove_file` on a non-empty directory fails regardless of uid.
        fs::create_dir(external.path().join("stale")).unwrap();
        fs::write(external.path().join("stale/child"), b"y").unwrap();

        let session = new_session(local.path(), Some(external.path()));
        let ufs = UnionFs::new(session.clone());

        ufs.delete_path("/stale", false).unwrap();

        assert!(!local.path().join("stale").exists());
        assert!(session.masks.pending_delete.contains("/stale"));
    }

    #[test]
    fn rename_path_moves_local_file() {
        let local = tempdir().unwrap();
        fs::write(local.path().join("a.txt"), b"x").unwrap();
        let session = new_session(local.path(), None);
        let ufs = UnionFs::new(session);

        ufs.rename_path("/a.txt", "/b.txt").unwrap();

        assert!(!local.path().join("a.txt").exists());
        assert_eq!(fs::read(local.path().join("b.txt")).unwrap(), b"x");
    }

    #[test]
    fn rename_path_promotes_external_only_source_before_moving() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::write(external.path().join("old.txt"), b"hello").unwrap();

        let session = new_session(local.path(), Some(external.path()));
        let ufs = UnionFs::new(session);

        ufs.rename_path("/old.txt", "/new.txt").unwrap();

        assert!(!local.path().join("old.txt").exists());
        assert_eq!(fs::read(local.path().join("new.txt")).unwrap(), b"hello");
    }

    #[test]
    fn set_times_applies_specific_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let target = UNIX_EPOCH + Duration::from_secs(1_000_000);

        set_times(&path, None, Some(fuser::TimeOrNow::SpecificTime(target))).unwrap();

        let meta = fs::symlink_metadata(&path).unwrap();
        assert_eq!(meta.modified().unwrap(), target);
    }

    #[test]
    fn is_apple_reserved_xattr_detects_prefix_only() {
        assert!(is_apple_reserved_xattr(OsStr::new("com.apple.quarantine")));
        assert!(!is_apple_reserved_xattr(OsStr::new("user.mime_type")));
    }

    #[test]
    fn resolve_ino_succeeds_regardless_of_backing_permission_bits() {
        let local = tempdir().unwrap();
        let path = local.path().join("locked");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();

        let session = new_session(local.path(), None);
        let ino = session.intern_path("/locked");
        let ufs = UnionFs::new(session);

        assert!(ufs.resolve_ino(ino).is_ok());
    }
}
