//! Copy-up (spec §4.E): promote a file from the external tier into the
//! local tier the first time a write targets it. Best effort — a failure
//! anywhere in the stream leaves no local file behind rather than a
//! truncated one, so the resolver keeps serving the external copy.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::Path;

use log::warn;

use crate::error::DriverError;
use crate::state::MountState;

const COPY_CHUNK_BYTES: usize = 8 * 1024;

/// Copy `external_path` into `local_path`, creating parent directories
/// under the local root as needed, and chowning the result to the mount
/// owner. Preserves the source's permission bits when they're readable.
///
/// On any failure the partially-written local file is removed so the
/// resolver never observes a half-copied file as "local".
pub fn copy_up(state: &MountState, external_path: &Path, local_path: &Path) -> Result<(), DriverError> {
    if let Some(parent) = local_path.parent() {
        ensure_local_dir(state, parent)?;
    }

    let mut src = File::open(external_path).map_err(|e| DriverError::from_io(&e))?;
    let mode = src
        .metadata()
        .ok()
        .map(|m| m.permissions().mode())
        .unwrap_or(0o644);

    let result = stream_copy(&mut src, local_path, mode);
    if result.is_err() {
        let _ = fs::remove_file(local_path);
        return result;
    }

    if let Err(e) = chown(
        local_path,
        Some(state.owner_uid),
        Some(state.owner_gid),
    ) {
        warn!("copy-up of {local_path:?} left with wrong ownership: {e}");
    }

    Ok(())
}

fn stream_copy(src: &mut File, local_path: &Path, mode: u32) -> Result<(), DriverError> {
    let mut dst = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(local_path)
        .map_err(|e| DriverError::from_io(&e))?;

    let mut buf = [0u8; COPY_CHUNK_BYTES];
    loop {
        let n = src.read(&mut buf).map_err(|e| DriverError::from_io(&e))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).map_err(|e| DriverError::from_io(&e))?;
    }
    dst.flush().map_err(|e| DriverError::from_io(&e))?;
    Ok(())
}

/// Recursively create `dir` under the local root, owned by the mount
/// owner. A plain `create_dir_all` would leave new directories owned by
/// whatever uid the driver process runs as.
fn ensure_local_dir(state: &MountState, dir: &Path) -> Result<(), DriverError> {
    if dir.exists() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        if parent != dir {
            ensure_local_dir(state, parent)?;
        }
    }
    match fs::create_dir(dir) {
        Ok(()) => {
            if let Err(e) = chown(dir, Some(state.owner_uid), Some(state.owner_gid)) {
                warn!("copy-up directory {dir:?} left with wrong ownership: {e}");
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(DriverError::from_io(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn state_with(local: &Path, external: &Path) -> MountState {
        MountState::new(
            PathBuf::from("/mnt"),
            local.to_path_buf(),
            Some(external.to_path_buf()),
        )
    }

    #[test]
    fn copy_up_streams_content_and_creates_parent_dirs() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        fs::create_dir(external.path().join("sub")).unwrap();
        fs::write(external.path().join("sub/f.txt"), b"hello world").unwrap();

        let state = state_with(local.path(), external.path());
        let external_path = external.path().join("sub/f.txt");
        let local_path = local.path().join("sub/f.txt");

        copy_up(&state, &external_path, &local_path).unwrap();

        assert_eq!(fs::read(&local_path).unwrap(), b"hello world");
    }

    #[test]
    fn copy_up_of_large_file_crosses_chunk_boundary() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        let content = vec![7u8; COPY_CHUNK_BYTES * 3 + 17];
        fs::write(external.path().join("big.bin"), &content).unwrap();

        let state = state_with(local.path(), external.path());
        let local_path = local.path().join("big.bin");
        copy_up(&state, &external.path().join("big.bin"), &local_path).unwrap();

        assert_eq!(fs::read(&local_path).unwrap(), content);
    }

    #[test]
    fn copy_up_of_missing_source_leaves_no_local_file() {
        let local = tempdir().unwrap();
        let external = tempdir().unwrap();
        let state = state_with(local.path(), external.path());
        let local_path = local.path().join("ghost.txt");

        let result = copy_up(&state, &external.path().join("ghost.txt"), &local_path);

        assert!(result.is_err());
        assert!(!local_path.exists());
    }
}
