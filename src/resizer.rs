use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

/// A hash index that can be rehashed by a background worker.
pub(crate) trait RehashTarget: Send + Sync {
    /// Performs the scheduled rehash. Called at most once per scheduling;
    /// must be a no-op when no rehash is pending (a stale queue entry).
    fn rehash(&self);
}

struct ResizeQueue {
    pending: VecDeque<Weak<dyn RehashTarget>>,
    shutting_down: bool,
}

/// Queue half of the resizer, shared between the pool, its workers, and the
/// indices that schedule themselves onto it.
pub(crate) struct ResizerShared {
    queue: Mutex<ResizeQueue>,
    work_available: Condvar,
}

impl ResizerShared {
    /// Queues a table for rehashing. FIFO; a no-op once shutdown has begun.
    ///
    /// The index's resize flag guarantees each table is queued at most once
    /// per pending rehash, so no dedup happens here.
    pub(crate) fn enqueue(&self, table: Weak<dyn RehashTarget>) {
        let mut queue = self.queue.lock();
        if queue.shutting_down {
            return;
        }
        queue.pending.push_back(table);
        self.work_available.notify_one();
    }
}

/// Fixed pool of worker threads that rehash indices on demand.
///
/// Workers outlive individual rehashes; the pool is created once per cache
/// and torn down with it. On shutdown the workers drain whatever is still
/// queued, then exit.
pub(crate) struct IndexResizer {
    shared: Arc<ResizerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl IndexResizer {
    pub(crate) fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be greater than 0");
        let shared = Arc::new(ResizerShared {
            queue: Mutex::new(ResizeQueue {
                pending: VecDeque::new(),
                shutting_down: false,
            }),
            work_available: Condvar::new(),
        });
        let workers = (0..worker_count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("index-resizer-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn resize worker")
            })
            .collect();
        IndexResizer { shared, workers }
    }

    /// Handle that indices keep to schedule themselves.
    pub(crate) fn shared(&self) -> Arc<ResizerShared> {
        Arc::clone(&self.shared)
    }

    fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutting_down = true;
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for IndexResizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &ResizerShared) {
    loop {
        let table = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(table) = queue.pending.pop_front() {
                    break table;
                }
                if queue.shutting_down {
                    return;
                }
                shared.work_available.wait(&mut queue);
            }
        };
        // The owning cache may have been dropped while the entry sat in the
        // queue; a dead handle is simply skipped.
        let Some(table) = table.upgrade() else {
            continue;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| table.rehash())) {
            let reason: &str = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown panic payload");
            tracing::error!(reason, "background rehash panicked; table keeps its pre-rehash state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct CountingTarget {
        rehashes: AtomicUsize,
    }

    impl RehashTarget for CountingTarget {
        fn rehash(&self) {
            self.rehashes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingTarget;

    impl RehashTarget for PanickingTarget {
        fn rehash(&self) {
            panic!("rehash blew up");
        }
    }

    fn downgrade_dyn<T: RehashTarget + 'static>(arc: &Arc<T>) -> Weak<dyn RehashTarget> {
        let dynamic: Arc<dyn RehashTarget> = arc.clone();
        Arc::downgrade(&dynamic)
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn worker_runs_enqueued_rehash() {
        let resizer = IndexResizer::new(1);
        let target = Arc::new(CountingTarget {
            rehashes: AtomicUsize::new(0),
        });
        let weak = downgrade_dyn(&target);
        resizer.shared().enqueue(weak);
        assert!(wait_for(Duration::from_secs(5), || {
            target.rehashes.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn shutdown_drains_pending_work() {
        let target = Arc::new(CountingTarget {
            rehashes: AtomicUsize::new(0),
        });
        {
            let resizer = IndexResizer::new(2);
            for _ in 0..8 {
                let weak = downgrade_dyn(&target);
                resizer.shared().enqueue(weak);
            }
            // Drop joins the workers after they drain the queue.
        }
        assert_eq!(target.rehashes.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn enqueue_after_shutdown_is_noop() {
        let target = Arc::new(CountingTarget {
            rehashes: AtomicUsize::new(0),
        });
        let shared = {
            let resizer = IndexResizer::new(1);
            resizer.shared()
        };
        let weak = downgrade_dyn(&target);
        shared.enqueue(weak);
        assert_eq!(target.rehashes.load(Ordering::SeqCst), 0);
        assert!(shared.queue.lock().pending.is_empty());
    }

    #[test]
    fn dead_handles_are_skipped() {
        let resizer = IndexResizer::new(1);
        let weak = {
            let target = Arc::new(CountingTarget {
                rehashes: AtomicUsize::new(0),
            });
            downgrade_dyn(&target)
        };
        resizer.shared().enqueue(weak);
        // Nothing to assert beyond "does not hang or crash": follow with live
        // work to prove the worker survived.
        let live = Arc::new(CountingTarget {
            rehashes: AtomicUsize::new(0),
        });
        let weak = downgrade_dyn(&live);
        resizer.shared().enqueue(weak);
        assert!(wait_for(Duration::from_secs(5), || {
            live.rehashes.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn panicking_rehash_does_not_kill_worker() {
        let resizer = IndexResizer::new(1);
        let bomb = Arc::new(PanickingTarget);
        let bomb_weak = downgrade_dyn(&bomb);
        resizer.shared().enqueue(bomb_weak);
        let live = Arc::new(CountingTarget {
            rehashes: AtomicUsize::new(0),
        });
        let live_weak = downgrade_dyn(&live);
        resizer.shared().enqueue(live_weak);
        assert!(wait_for(Duration::from_secs(5), || {
            live.rehashes.load(Ordering::SeqCst) == 1
        }));
    }
}
