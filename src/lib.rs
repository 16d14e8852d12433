//! `tierfuse`: a userspace union filesystem driver. Merges a fast, always
//! writable local directory tree with a slower, optional external tree
//! under one FUSE mount point, copying a file up to the local tier the
//! first time a write targets it.
//!
//! The crate is organized the way the driver actually runs: small,
//! independently testable building blocks (`resolver`, `masks`,
//! `openslots`, `notify`) underneath the two large stateful pieces
//! (`session`, which owns all of it, and `fs`, the `fuser::Filesystem`
//! impl that drives it from kernel requests) and the mount lifecycle
//! (`mount`) that ties a `Session` to a running FUSE channel.

pub mod config;
pub mod copyup;
pub mod diag;
pub mod error;
pub mod exclude;
pub mod fs;
pub mod masks;
pub mod mount;
pub mod notify;
pub mod openslots;
pub mod resolver;
pub mod session;
pub mod state;

pub use error::{DriverError, MountError};
pub use session::Session;
pub use state::Tier;
