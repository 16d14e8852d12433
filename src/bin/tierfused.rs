//! CLI entry point for the union filesystem driver: a `clap::Parser`
//! struct for the flags, `log` macros for anything the diagnostic logger
//! doesn't already cover at startup, and a direct call into the library's
//! blocking mount entry point.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use tierfuse::config::MountConfig;
use tierfuse::mount;
use tierfuse::session::Session;

#[derive(Parser)]
#[command(version, about = "Userspace union filesystem: merges a local and external directory tree under one FUSE mount point")]
struct Args {
    /// Path to a tierfuse.toml config file. Individual flags below override
    /// whatever it sets.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to mount the union view.
    #[arg(long)]
    mount_path: Option<PathBuf>,

    /// The fast, always-writable backing directory.
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// The optional, possibly-offline backing directory.
    #[arg(long)]
    external_dir: Option<PathBuf>,

    /// Mount read-only.
    #[arg(long)]
    readonly: bool,

    /// Enable DEBUG-level diagnostic logging.
    #[arg(long)]
    debug: bool,

    /// Write diagnostic log output to this file instead of stderr.
    #[arg(long)]
    log_path: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let logger = tierfuse::diag::install();

    let mut config = match &args.config {
        Some(path) => match MountConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load {path:?}: {e}");
                std::process::exit(1);
            }
        },
        None => MountConfig {
            mount_path: PathBuf::new(),
            local_dir: PathBuf::new(),
            external_dir: None,
            readonly: false,
            debug: false,
            log_path: None,
        },
    };

    config.apply_overrides(
        args.mount_path,
        args.local_dir,
        args.external_dir,
        args.readonly,
        args.debug,
        args.log_path,
    );

    if config.mount_path.as_os_str().is_empty() || config.local_dir.as_os_str().is_empty() {
        eprintln!("--mount-path and --local-dir are required (via flags or --config)");
        std::process::exit(1);
    }

    logger.set_debug(config.debug);
    if let Some(path) = &config.log_path {
        if let Err(e) = logger.set_log_path(Some(path)) {
            eprintln!("could not open log file {path:?}: {e}");
            std::process::exit(1);
        }
    }

    let session = Session::new(
        config.mount_path.clone(),
        config.local_dir.clone(),
        config.external_dir.clone(),
        logger,
    );
    session.set_readonly(config.readonly);
    // A real deployment would build its index (or otherwise determine
    // readiness) before flipping this; for the standalone binary, the
    // union view is considered ready as soon as both roots are in place.
    session.set_index_ready(true);

    info!(
        "starting tierfuse: mount={:?} local={:?} external={:?} readonly={}",
        config.mount_path, config.local_dir, config.external_dir, config.readonly
    );

    if let Err(e) = mount::mount_blocking(session) {
        error!("mount failed: {e}");
        std::process::exit(e.code().abs());
    }
}
