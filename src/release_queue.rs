// Deferred-release queue
//
// Native objects are not destroyed when their owner lets go of them. They are
// parked here with the fence value of the last submission that could still
// reference them and finalized once the GPU has passed that value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Deleter = Box<dyn FnOnce() + Send>;

struct ReleaseEntry {
    fence_value: u64,
    deleter: Deleter,
}

/// FIFO of pending native-object releases keyed by fence value
pub struct ReleaseQueue {
    entries: Mutex<VecDeque<ReleaseEntry>>,
    finalized: AtomicU64,
}

impl Default for ReleaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            finalized: AtomicU64::new(0),
        }
    }

    /// Park `handle` until `fence_value` completes, then pass it to `deleter`.
    ///
    /// Values never decrease along the queue: an entry enqueued with a value
    /// lower than its predecessor inherits the predecessor's value.
    pub fn enqueue<H, F>(&self, fence_value: u64, handle: H, deleter: F)
    where
        H: Send + 'static,
        F: FnOnce(H) + Send + 'static,
    {
        let mut entries = self.entries.lock();
        let fence_value = entries
            .back()
            .map_or(fence_value, |last| last.fence_value.max(fence_value));
        entries.push_back(ReleaseEntry {
            fence_value,
            deleter: Box::new(move || deleter(handle)),
        });
    }

    /// Finalize every entry whose fence value is at most `last_completed`, in
    /// FIFO order. Returns the number of finalized entries.
    pub fn tick(&self, last_completed: u64) -> usize {
        let ready: Vec<ReleaseEntry> = {
            let mut entries = self.entries.lock();
            let count = entries
                .iter()
                .take_while(|entry| entry.fence_value <= last_completed)
                .count();
            entries.drain(..count).collect()
        };
        // Deleters run outside the lock: they may drop objects that enqueue
        self.finalize(ready)
    }

    /// Finalize everything regardless of fence values. Only valid once the
    /// GPU is idle.
    pub fn drain_all(&self) -> usize {
        let all: Vec<ReleaseEntry> = self.entries.lock().drain(..).collect();
        self.finalize(all)
    }

    fn finalize(&self, entries: Vec<ReleaseEntry>) -> usize {
        let count = entries.len();
        for entry in entries {
            log::trace!("Releasing native object (fence {})", entry.fence_value);
            (entry.deleter)();
        }
        self.finalized.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fence value of the oldest pending entry
    pub fn oldest_fence_value(&self) -> Option<u64> {
        self.entries.lock().front().map(|entry| entry.fence_value)
    }

    /// Total number of entries finalized so far
    pub fn finalized_count(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        let remaining = self.drain_all();
        if remaining > 0 {
            log::debug!("Release queue dropped with {} pending entries", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<(u32, u64)>>>, impl Fn(u32, u64, &ReleaseQueue)) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let push = move |handle: u32, fence: u64, queue: &ReleaseQueue| {
            let sink = Arc::clone(&sink);
            queue.enqueue(fence, handle, move |h| sink.lock().push((h, fence)));
        };
        (log, push)
    }

    #[test]
    fn tick_never_finalizes_before_fence() {
        let queue = ReleaseQueue::new();
        let (released, push) = recorder();
        push(1, 1, &queue);
        push(2, 3, &queue);
        push(3, 5, &queue);

        assert_eq!(queue.tick(0), 0);
        assert_eq!(queue.tick(2), 1);
        assert_eq!(queue.tick(4), 1);
        for &(_, fence) in released.lock().iter() {
            assert!(4 >= fence);
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.tick(5), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.finalized_count(), 3);
    }

    #[test]
    fn release_order_is_fifo() {
        let queue = ReleaseQueue::new();
        let (released, push) = recorder();
        push(10, 2, &queue);
        // Lower value behind a higher one waits for its predecessor
        push(11, 1, &queue);
        assert_eq!(queue.tick(1), 0);
        assert_eq!(queue.tick(2), 2);
        let handles: Vec<u32> = released.lock().iter().map(|&(h, _)| h).collect();
        assert_eq!(handles, vec![10, 11]);
    }

    #[test]
    fn drain_all_finalizes_everything() {
        let queue = ReleaseQueue::new();
        let (released, push) = recorder();
        push(1, 100, &queue);
        push(2, 200, &queue);
        assert_eq!(queue.oldest_fence_value(), Some(100));
        assert_eq!(queue.drain_all(), 2);
        assert_eq!(released.lock().len(), 2);
    }

    #[test]
    fn deleter_may_enqueue_without_deadlock() {
        let queue = Arc::new(ReleaseQueue::new());
        let inner = Arc::clone(&queue);
        queue.enqueue(1, (), move |_| inner.enqueue(1, (), |_| {}));
        assert_eq!(queue.tick(1), 1);
        assert_eq!(queue.tick(1), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn dropping_queue_runs_pending_deleters() {
        let (released, push) = recorder();
        {
            let queue = ReleaseQueue::new();
            push(7, 9, &queue);
        }
        assert_eq!(released.lock().as_slice(), &[(7, 9)]);
    }

    #[test]
    fn enqueue_races_tick_without_early_release() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u64 = 500;

        let queue = ReleaseQueue::new();
        let completed = Arc::new(AtomicU64::new(0));
        let early = Arc::new(AtomicU64::new(0));
        let released = Arc::new(Mutex::new(Vec::new()));
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            let producers: Vec<_> = (0..PRODUCERS)
                .map(|producer| {
                    let queue = &queue;
                    let (completed, early, released) =
                        (completed.clone(), early.clone(), released.clone());
                    scope.spawn(move || {
                        for seq in 0..PER_PRODUCER {
                            let fence = completed.load(Ordering::Acquire) + 1 + seq % 4;
                            let (completed, early, released) =
                                (completed.clone(), early.clone(), released.clone());
                            queue.enqueue(fence, (producer, seq), move |handle| {
                                if completed.load(Ordering::Acquire) < fence {
                                    early.fetch_add(1, Ordering::Relaxed);
                                }
                                released.lock().push(handle);
                            });
                        }
                    })
                })
                .collect();

            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let value = completed.fetch_add(1, Ordering::AcqRel) + 1;
                    queue.tick(value);
                    std::thread::yield_now();
                }
            });

            for producer in producers {
                producer.join().unwrap();
            }
            done.store(true, Ordering::Release);
        });

        completed.store(u64::MAX, Ordering::Release);
        queue.tick(u64::MAX);
        assert!(queue.is_empty());
        assert_eq!(queue.drain_all(), 0);
        assert_eq!(early.load(Ordering::Relaxed), 0);
        assert_eq!(queue.finalized_count(), PRODUCERS as u64 * PER_PRODUCER);

        // Each producer's entries are finalized in the order they were enqueued
        let released = released.lock();
        for producer in 0..PRODUCERS {
            let order: Vec<u64> = released
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|&(_, seq)| seq)
                .collect();
            assert_eq!(order, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }
}
