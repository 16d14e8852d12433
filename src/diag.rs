//! Diagnostic log (spec §4.J) and exit diagnostics (spec §4.K).
//!
//! The log is a small hand-rolled `log::Log` implementation rather than a
//! pass-through to `env_logger`, because the design calls for buffering and
//! a hot-swappable sink that the stock facade doesn't give for free. DEBUG
//! stays gated through `enabled()`, which the `log` macros already consult
//! before formatting a single argument, so "no cost when off" falls out of
//! the facade's own contract.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::notify::NotifyCounters;

const INFO_BUFFER_CAPACITY: usize = 8 * 1024;
const INFO_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum Sink {
    Stderr,
    File(File),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Stderr => std::io::stderr().write(buf),
            Sink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Stderr => std::io::stderr().flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

struct LogState {
    sink: Sink,
    path: Option<PathBuf>,
    info_buffer: String,
    last_flush: Instant,
}

/// Leveled, buffered, thread-safe diagnostic log with a runtime debug
/// toggle and a hot-swappable sink.
pub struct DiagnosticLogger {
    debug_enabled: AtomicBool,
    state: Mutex<LogState>,
}

impl Default for DiagnosticLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticLogger {
    pub fn new() -> Self {
        DiagnosticLogger {
            debug_enabled: AtomicBool::new(false),
            state: Mutex::new(LogState {
                sink: Sink::Stderr,
                path: None,
                info_buffer: String::with_capacity(INFO_BUFFER_CAPACITY),
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled.load(Ordering::Relaxed)
    }

    /// Swap the sink. Opens the new sink first, flushing and closing the
    /// old one only once the new one is ready, per spec §4.J.
    pub fn set_log_path(&self, path: Option<&Path>) -> std::io::Result<()> {
        let new_sink = match path {
            Some(p) => Sink::File(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)?,
            ),
            None => Sink::Stderr,
        };
        let mut state = self.state.lock();
        flush_locked(&mut state);
        let _ = state.sink.flush();
        state.sink = new_sink;
        state.path = path.map(Path::to_path_buf);
        Ok(())
    }

    pub fn flush(&self) {
        let mut state = self.state.lock();
        flush_locked(&mut state);
    }

    fn write_immediate(&self, line: &str) {
        let mut state = self.state.lock();
        flush_locked(&mut state);
        let _ = state.sink.write_all(line.as_bytes());
        let _ = state.sink.flush();
    }

    fn write_buffered(&self, line: &str) {
        let mut state = self.state.lock();
        state.info_buffer.push_str(line);
        let due_to_size = state.info_buffer.len() >= INFO_BUFFER_CAPACITY;
        let due_to_time = state.last_flush.elapsed() >= INFO_FLUSH_INTERVAL;
        if due_to_size || due_to_time {
            flush_locked(&mut state);
        }
    }
}

fn flush_locked(state: &mut LogState) {
    if !state.info_buffer.is_empty() {
        let _ = state.sink.write_all(state.info_buffer.as_bytes());
        state.info_buffer.clear();
    }
    let _ = state.sink.flush();
    state.last_flush = Instant::now();
}

impl Log for DiagnosticLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let max = if self.debug_enabled() {
            Level::Debug
        } else {
            Level::Info
        };
        metadata.level() <= max
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] {}\n", record.level(), record.args());
        match record.level() {
            Level::Error | Level::Warn => self.write_immediate(&line),
            Level::Info => self.write_buffered(&line),
            Level::Debug | Level::Trace => self.write_immediate(&line),
        }
    }

    fn flush(&self) {
        DiagnosticLogger::flush(self);
    }
}

/// Install the diagnostic logger as the global `log` backend and return a
/// `'static` handle the `Session` keeps for its runtime-control API
/// (set debug / set log path / flush).
pub fn install() -> &'static DiagnosticLogger {
    let logger: &'static DiagnosticLogger = Box::leak(Box::new(DiagnosticLogger::new()));
    if log::set_logger(logger).is_err() {
        log::warn!("diagnostic logger already installed; keeping the existing one");
    }
    log::set_max_level(LevelFilter::Trace);
    logger
}

/// Records the last signal received and a liveness heartbeat (spec §4.K /
/// §9). TERM/HUP/INT/USR1/USR2 are record-only: the driver notes them for
/// diagnostics but does not act on them itself.
pub struct SignalTracker {
    last_signal: AtomicI32,
}

impl SignalTracker {
    pub fn new() -> Self {
        SignalTracker {
            last_signal: AtomicI32::new(0),
        }
    }

    pub fn last_signal(&self) -> Option<i32> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            s => Some(s),
        }
    }

    fn record(&self, signal: i32) {
        self.last_signal.store(signal, Ordering::Relaxed);
    }
}

impl Default for SignalTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background thread that watches TERM/HUP/INT/USR1/USR2 and
/// updates `tracker`. Mirrors the `Signals::new(...).forever()` pattern.
pub fn spawn_signal_watcher(
    tracker: std::sync::Arc<SignalTracker>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let mut signals = Signals::new(&[SIGTERM, SIGHUP, SIGINT, SIGUSR1, SIGUSR2])
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(std::thread::Builder::new()
        .name("tierfuse-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                tracker.record(signal);
            }
        })
        .expect("spawning the signal-watcher thread should not fail"))
}

/// Liveness heartbeat: total operations handled and the timestamp of the
/// last one.
pub struct Heartbeat {
    op_count: AtomicU64,
    last_op_millis: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat {
            op_count: AtomicU64::new(0),
            last_op_millis: AtomicU64::new(now_millis()),
        }
    }

    pub fn record_op(&self) {
        self.op_count.fetch_add(1, Ordering::Relaxed);
        self.last_op_millis.store(now_millis(), Ordering::Relaxed);
    }

    pub fn total_ops(&self) -> u64 {
        self.op_count.load(Ordering::Relaxed)
    }

    pub fn seconds_since_last_op(&self) -> u64 {
        let last = self.last_op_millis.load(Ordering::Relaxed);
        now_millis().saturating_sub(last) / 1000
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything the exit-diagnostics block (spec §4.K) reports.
pub struct ExitReport {
    pub loop_result_errno: Option<i32>,
    pub last_signal: Option<i32>,
    pub total_ops: u64,
    pub seconds_since_last_op: u64,
    pub notify: NotifyCounters,
    pub macfuse_dev_count: usize,
    pub mount_point_stat_ok: bool,
    pub statfs_ok: bool,
    pub channel_valid: bool,
}

/// Count `/dev/macfuseN` nodes, a heuristic for kernel-extension health on
/// macOS-style FUSE mounts (spec §4.K).
pub fn count_macfuse_dev_nodes() -> usize {
    let dev = Path::new("/dev");
    let Ok(entries) = std::fs::read_dir(dev) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with("macfuse"))
                .unwrap_or(false)
        })
        .count()
}

/// Render the exit-diagnostics block as a single human-readable string,
/// suitable for one `error!`/`warn!` log call on event-loop exit.
pub fn format_exit_report(report: &ExitReport) -> String {
    let mut out = String::new();
    out.push_str("=== tierfuse exit diagnostics ===\n");
    match report.loop_result_errno {
        Some(errno) => out.push_str(&format!(
            "event loop exit errno: {}\n",
            crate::error::errno_to_string(errno)
        )),
        None => out.push_str("event loop exit: clean (no errno)\n"),
    }
    match report.last_signal {
        Some(s) => out.push_str(&format!("last signal received: {s}\n")),
        None => out.push_str("last signal received: none\n"),
    }
    out.push_str(&format!("total operations handled: {}\n", report.total_ops));
    out.push_str(&format!(
        "seconds since last operation: {}\n",
        report.seconds_since_last_op
    ));
    out.push_str(&format!(
        "notification bus: queued={} processed={} dropped={} pending={}\n",
        report.notify.queued, report.notify.processed, report.notify.dropped, report.notify.pending
    ));
    out.push_str(&format!(
        "/dev/macfuseN nodes: {}\n",
        report.macfuse_dev_count
    ));
    out.push_str(&format!(
        "mount point stat: {}\n",
        if report.mount_point_stat_ok { "ok" } else { "failed" }
    ));
    out.push_str(&format!(
        "mount point statfs: {}\n",
        if report.statfs_ok { "ok" } else { "failed" }
    ));
    out.push_str(&format!(
        "FUSE channel valid: {}\n",
        report.channel_valid
    ));
    out.push_str("==================================");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_counts_ops_and_tracks_recency() {
        let hb = Heartbeat::new();
        assert_eq!(hb.total_ops(), 0);
        hb.record_op();
        hb.record_op();
        assert_eq!(hb.total_ops(), 2);
        assert_eq!(hb.seconds_since_last_op(), 0);
    }

    #[test]
    fn signal_tracker_starts_empty() {
        let tracker = SignalTracker::new();
        assert_eq!(tracker.last_signal(), None);
        tracker.record(SIGTERM);
        assert_eq!(tracker.last_signal(), Some(SIGTERM));
    }

    #[test]
    fn exit_report_formats_known_errno() {
        let report = ExitReport {
            loop_result_errno: Some(libc::ENODEV),
            last_signal: Some(SIGTERM),
            total_ops: 42,
            seconds_since_last_op: 3,
            notify: NotifyCounters {
                queued: 5,
                processed: 4,
                dropped: 1,
                pending: 1,
            },
            macfuse_dev_count: 1,
            mount_point_stat_ok: true,
            statfs_ok: true,
            channel_valid: false,
        };
        let text = format_exit_report(&report);
        assert!(text.contains("kernel extension unloaded"));
        assert!(text.contains("dropped=1"));
        assert!(text.contains("FUSE channel valid: false"));
    }

    #[test]
    fn logger_buffers_info_and_flushes_warn_immediately() {
        let logger = DiagnosticLogger::new();
        logger.write_buffered("info line\n");
        assert!(!logger.state.lock().info_buffer.is_empty());
        logger.write_immediate("warn line\n");
        // write_immediate flushes the buffer first.
        assert!(logger.state.lock().info_buffer.is_empty());
    }
}
