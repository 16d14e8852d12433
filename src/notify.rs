//! Change-notification bus (spec §4.H): a bounded ring buffer plus a single
//! consumer thread. Producer threads (the operation handlers) must never
//! block on upper-layer work, so a full ring drops its oldest entry rather
//! than blocking the producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex, RwLock};

/// Bounded-length path, per the invariant in spec §3.
const MAX_EVENT_PATH_BYTES: usize = 1023;

fn truncate_path(path: &str) -> String {
    if path.len() <= MAX_EVENT_PATH_BYTES {
        return path.to_owned();
    }
    // Truncate on a char boundary so we never split a multi-byte codepoint.
    let mut end = MAX_EVENT_PATH_BYTES;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    path[..end].to_owned()
}

/// The five change kinds, each carrying at most two paths and an `is_dir`
/// flag, as described in spec §9.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Created {
        virtual_path: String,
        local_path: String,
        is_dir: bool,
    },
    Deleted {
        virtual_path: String,
        is_dir: bool,
    },
    Written {
        virtual_path: String,
    },
    Read {
        virtual_path: String,
    },
    Renamed {
        from: String,
        to: String,
        is_dir: bool,
    },
}

impl ChangeEvent {
    pub fn created(virtual_path: &str, local_path: &str, is_dir: bool) -> Self {
        ChangeEvent::Created {
            virtual_path: truncate_path(virtual_path),
            local_path: truncate_path(local_path),
            is_dir,
        }
    }

    pub fn deleted(virtual_path: &str, is_dir: bool) -> Self {
        ChangeEvent::Deleted {
            virtual_path: truncate_path(virtual_path),
            is_dir,
        }
    }

    pub fn written(virtual_path: &str) -> Self {
        ChangeEvent::Written {
            virtual_path: truncate_path(virtual_path),
        }
    }

    pub fn read(virtual_path: &str) -> Self {
        ChangeEvent::Read {
            virtual_path: truncate_path(virtual_path),
        }
    }

    pub fn renamed(from: &str, to: &str, is_dir: bool) -> Self {
        ChangeEvent::Renamed {
            from: truncate_path(from),
            to: truncate_path(to),
            is_dir,
        }
    }
}

type CreatedFn = dyn Fn(&str, &str, bool) + Send + Sync;
type DeletedFn = dyn Fn(&str, bool) + Send + Sync;
type WrittenFn = dyn Fn(&str) + Send + Sync;
type ReadFn = dyn Fn(&str) + Send + Sync;
type RenamedFn = dyn Fn(&str, &str, bool) + Send + Sync;

/// An installable record of optional function values (spec §9). Missing
/// entries silently drop the corresponding variant.
#[derive(Default)]
pub struct Callbacks {
    pub on_created: Option<Arc<CreatedFn>>,
    pub on_deleted: Option<Arc<DeletedFn>>,
    pub on_written: Option<Arc<WrittenFn>>,
    pub on_read: Option<Arc<ReadFn>>,
    pub on_renamed: Option<Arc<RenamedFn>>,
}

/// Snapshot of the bus's diagnostic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyCounters {
    pub queued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub pending: u64,
}

/// A fixed-capacity ring buffer with a single consumer. Producers take the
/// bus lock only long enough to copy an event in; the consumer releases the
/// lock before dispatching so a slow callback never blocks a producer.
pub struct NotificationBus {
    ring: Mutex<VecDeque<ChangeEvent>>,
    cv: Condvar,
    cap: usize,
    shutdown: AtomicBool,
    callbacks: RwLock<Callbacks>,
    queued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

const RING_CAPACITY: usize = 4096;

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(NotificationBus {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY.min(256))),
            cv: Condvar::new(),
            cap: RING_CAPACITY,
            shutdown: AtomicBool::new(false),
            callbacks: RwLock::new(Callbacks::default()),
            queued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.callbacks.write() = callbacks;
    }

    /// Enqueue an event. Never blocks on anything but the bus's own short
    /// critical section.
    pub fn publish(&self, event: ChangeEvent) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.cap {
            ring.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(event);
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.cv.notify_one();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    pub fn counters(&self) -> NotifyCounters {
        NotifyCounters {
            queued: self.queued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.ring.lock().len() as u64,
        }
    }

    /// Run the consumer loop on the calling thread until shutdown is
    /// requested and the ring has drained. Waits with a 1s timeout so it can
    /// observe the shutdown flag even with no events flowing.
    pub fn run_consumer(self: &Arc<Self>) {
        loop {
            let event = {
                let mut ring = self.ring.lock();
                loop {
                    if let Some(event) = ring.pop_front() {
                        break Some(event);
                    }
                    if self.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    self.cv.wait_for(&mut ring, Duration::from_secs(1));
                }
            };
            let Some(event) = event else { break };
            self.dispatch(&event);
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let callbacks = self.callbacks.read();
        match event {
            ChangeEvent::Created {
                virtual_path,
                local_path,
                is_dir,
            } => {
                if let Some(cb) = &callbacks.on_created {
                    cb(virtual_path, local_path, *is_dir);
                }
            }
            ChangeEvent::Deleted {
                virtual_path,
                is_dir,
            } => {
                if let Some(cb) = &callbacks.on_deleted {
                    cb(virtual_path, *is_dir);
                }
            }
            ChangeEvent::Written { virtual_path } => {
                if let Some(cb) = &callbacks.on_written {
                    cb(virtual_path);
                }
            }
            ChangeEvent::Read { virtual_path } => {
                if let Some(cb) = &callbacks.on_read {
                    cb(virtual_path);
                }
            }
            ChangeEvent::Renamed { from, to, is_dir } => {
                if let Some(cb) = &callbacks.on_renamed {
                    cb(from, to, *is_dir);
                }
            }
        }
    }
}

/// Spawn the single consumer thread described in spec §4.H / §4.I step 6.
pub fn spawn_consumer(bus: Arc<NotificationBus>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("tierfuse-notify".into())
        .spawn(move || bus.run_consumer())
        .unwrap_or_else(|e| {
            warn!("failed to spawn notification consumer thread: {e}");
            std::thread::spawn(|| {})
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc as StdArc;

    #[test]
    fn truncates_overlong_paths_without_splitting_utf8() {
        let long = "x".repeat(2000);
        let event = ChangeEvent::written(&long);
        if let ChangeEvent::Written { virtual_path } = event {
            assert!(virtual_path.len() <= MAX_EVENT_PATH_BYTES);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn full_ring_drops_oldest_and_counts_it() {
        let bus = NotificationBus::new();
        for i in 0..RING_CAPACITY + 5 {
            bus.publish(ChangeEvent::written(&format!("/f{i}")));
        }
        let counters = bus.counters();
        assert_eq!(counters.dropped, 5);
        assert_eq!(counters.pending as usize, RING_CAPACITY);
    }

    #[test]
    fn consumer_dispatches_to_installed_callback_and_drops_missing_variants() {
        let bus = NotificationBus::new();
        let seen = StdArc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.set_callbacks(Callbacks {
            on_written: Some(Arc::new(move |_p: &str| {
                seen2.fetch_add(1, Ordering::SeqCst);
            })),
            ..Callbacks::default()
        });
        bus.publish(ChangeEvent::written("/a"));
        // on_read has no callback installed; dispatch must not panic.
        bus.publish(ChangeEvent::read("/b"));
        bus.request_shutdown();
        bus.run_consumer();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.counters().processed, 2);
    }
}
