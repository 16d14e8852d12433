//! Error taxonomy (spec §7) and the conversions handlers need to turn an
//! internal failure into a negated-errno reply, the form `fuser`'s `Reply*`
//! types expect.

use std::fmt;
use std::io;

/// The eight-entry error taxonomy from the design: everything a handler can
/// fail with boils down to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Readiness gate closed, or path is in the *syncing* mask.
    RetryableBusy,
    /// Neither tier has the path.
    NotFound,
    /// Open-slot ceiling reached.
    TooManyOpenFiles,
    /// Virtual path depth exceeds the guard.
    PathTooDeep,
    /// Mutation requested while the mount (or the path) is read-only.
    ReadOnly,
    /// Any other errno surfaced by a backing syscall.
    Backing(i32),
}

impl DriverError {
    /// The negated-errno value a `fuser` reply should be given.
    pub fn as_errno(self) -> i32 {
        match self {
            DriverError::RetryableBusy => libc::EAGAIN,
            DriverError::NotFound => libc::ENOENT,
            DriverError::TooManyOpenFiles => libc::EMFILE,
            DriverError::PathTooDeep => libc::ELOOP,
            DriverError::ReadOnly => libc::EROFS,
            DriverError::Backing(errno) => errno,
        }
    }

    /// Map a `std::io::Error` arising from a backing-tier syscall onto the
    /// taxonomy. `NotFound` and permission errors get their own named
    /// variants where the distinction is externally observable; everything
    /// else passes the raw errno through (spec §7.7 "backing-error
    /// passthrough").
    pub fn from_io(err: &io::Error) -> DriverError {
        match err.kind() {
            io::ErrorKind::NotFound => DriverError::NotFound,
            _ => DriverError::Backing(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::RetryableBusy => write!(f, "retryable busy (readiness gate or sync lock)"),
            DriverError::NotFound => write!(f, "no such file or directory"),
            DriverError::TooManyOpenFiles => write!(f, "too many open files"),
            DriverError::PathTooDeep => write!(f, "path too deep (possible symlink loop)"),
            DriverError::ReadOnly => write!(f, "read-only filesystem"),
            DriverError::Backing(errno) => {
                write!(f, "backing filesystem error: {}", errno_to_string(*errno))
            }
        }
    }
}

impl std::error::Error for DriverError {}

/// Mount-time fatal errors (spec §7.8); these never reach a `fuser` reply,
/// they abort the `mount()` call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    InvalidArg,
    AlreadyMounted,
    NotMounted,
    MountFailed,
    SessionCreateFailed,
    ChannelMountFailed,
}

impl MountError {
    /// The small negative integer surfaced to callers (spec §6).
    pub fn code(self) -> i32 {
        match self {
            MountError::InvalidArg => -1,
            MountError::AlreadyMounted => -2,
            MountError::NotMounted => -3,
            MountError::MountFailed => -4,
            MountError::SessionCreateFailed => -5,
            MountError::ChannelMountFailed => -6,
        }
    }
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountError::InvalidArg => "invalid argument",
            MountError::AlreadyMounted => "already mounted",
            MountError::NotMounted => "not mounted",
            MountError::MountFailed => "mount failed",
            MountError::SessionCreateFailed => "FUSE session creation failed",
            MountError::ChannelMountFailed => "FUSE channel mount failed",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for MountError {}

/// Human interpretation of common `errno` values for the exit-diagnostics
/// block (spec §4.K).
pub fn errno_to_string(errno: i32) -> String {
    let meaning = match errno {
        libc::ENODEV => Some("kernel extension unloaded"),
        libc::ENOTCONN => Some("channel lost"),
        libc::EINTR => Some("interrupted by a signal"),
        libc::EIO => Some("I/O error"),
        libc::ENOENT => Some("no such file or directory"),
        _ => None,
    };
    match meaning {
        Some(m) => format!("{errno} ({m})"),
        None => format!("{errno}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_passthrough_keeps_raw_errno() {
        let err = DriverError::Backing(libc::EACCES);
        assert_eq!(err.as_errno(), libc::EACCES);
    }

    #[test]
    fn from_io_not_found_maps_to_named_variant() {
        let io_err = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(DriverError::from_io(&io_err), DriverError::NotFound);
    }

    #[test]
    fn errno_to_string_annotates_known_values() {
        assert!(errno_to_string(libc::ENODEV).contains("kernel extension"));
        assert_eq!(errno_to_string(9999), "9999");
    }
}
