// Queue timeline and user fences
//
// All submissions of a device go through one `Timeline`. It hands out the
// fence values the release queue is keyed by and turns dropped native
// handles into deferred releases.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, Command, RawHandle};
use crate::error::{EngineError, Result};
use crate::release_queue::ReleaseQueue;

pub(crate) struct Timeline {
    backend: Arc<dyn Backend>,
    release_queue: ReleaseQueue,
    submit_lock: Mutex<()>,
    last_submitted: AtomicU64,
}

impl Timeline {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            release_queue: ReleaseQueue::new(),
            submit_lock: Mutex::new(()),
            last_submitted: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn release_queue(&self) -> &ReleaseQueue {
        &self.release_queue
    }

    /// Submit `commands` and publish the resulting fence value before the
    /// caller lets go of the objects the commands reference.
    pub fn submit(&self, commands: &[Command]) -> Result<u64> {
        let _guard = self.submit_lock.lock();
        let value = self.backend.submit(commands)?;
        self.last_submitted.fetch_max(value, Ordering::AcqRel);
        log::trace!("Submitted {} commands (fence {})", commands.len(), value);
        Ok(value)
    }

    pub fn last_submitted(&self) -> u64 {
        self.last_submitted.load(Ordering::Acquire)
    }

    pub fn last_completed(&self) -> u64 {
        self.backend.last_completed_fence()
    }

    /// Destroy `handle` once every submission made so far has completed.
    pub fn safe_release(&self, handle: RawHandle) {
        let backend = Arc::clone(&self.backend);
        self.release_queue
            .enqueue(self.last_submitted(), handle, move |handle| backend.destroy(handle));
    }

    /// Finalize releases whose fence has completed
    pub fn purge(&self) -> usize {
        self.release_queue.tick(self.last_completed())
    }

    pub fn wait_for_fence(&self, value: u64) -> Result<()> {
        if value > self.last_completed() {
            self.backend.wait_for_fence(value)?;
        }
        Ok(())
    }

    /// Wait for all submitted work
    pub fn idle(&self) -> Result<()> {
        self.backend.wait_idle()
    }
}

struct FenceInner {
    name: String,
    timeline: Arc<Timeline>,
    /// (queue fence value, user value) pairs not yet known to be complete
    pending: Mutex<VecDeque<(u64, u64)>>,
    last_bound: AtomicU64,
    completed: AtomicU64,
}

/// User-visible fence with its own monotonically increasing values.
///
/// Values are bound to queue submissions by
/// [`DeviceContext::enqueue_signal`](crate::DeviceContext::enqueue_signal).
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub(crate) fn new(name: impl Into<String>, timeline: Arc<Timeline>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                name: name.into(),
                timeline,
                pending: Mutex::new(VecDeque::new()),
                last_bound: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Highest value the GPU has signaled so far
    pub fn completed_value(&self) -> u64 {
        self.resolve(self.inner.timeline.last_completed())
    }

    /// Block until `value` has been signaled
    pub fn wait(&self, value: u64) -> Result<()> {
        if value <= self.inner.completed.load(Ordering::Acquire) {
            return Ok(());
        }
        let queue_value = self
            .inner
            .pending
            .lock()
            .iter()
            .find(|(_, user_value)| *user_value >= value)
            .map(|(queue_value, _)| *queue_value);

        let Some(queue_value) = queue_value else {
            return Err(EngineError::ProtocolViolation(format!(
                "Fence \"{}\": waiting for value {} that was never enqueued for signaling",
                self.inner.name, value
            )));
        };
        self.inner.timeline.wait_for_fence(queue_value)?;
        self.resolve(self.inner.timeline.last_completed());
        Ok(())
    }

    /// Associate `user_value` with the submission signaled at `queue_value`.
    pub(crate) fn bind(&self, queue_value: u64, user_value: u64) -> Result<()> {
        let mut pending = self.inner.pending.lock();
        self.check_next(user_value)?;
        self.inner.last_bound.store(user_value, Ordering::Release);
        pending.push_back((queue_value, user_value));
        Ok(())
    }

    /// Fail unless `bind` would accept `user_value`
    pub(crate) fn check_next(&self, user_value: u64) -> Result<()> {
        let last = self.inner.last_bound.load(Ordering::Acquire);
        if user_value <= last {
            return Err(EngineError::ProtocolViolation(format!(
                "Fence \"{}\": value {} is not greater than the previously enqueued value {}",
                self.inner.name, user_value, last
            )));
        }
        Ok(())
    }

    fn resolve(&self, last_completed: u64) -> u64 {
        let mut pending = self.inner.pending.lock();
        while let Some(&(queue_value, user_value)) = pending.front() {
            if queue_value > last_completed {
                break;
            }
            self.inner.completed.fetch_max(user_value, Ordering::AcqRel);
            pending.pop_front();
        }
        self.inner.completed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.inner.name)
            .field("completed", &self.inner.completed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::desc::BufferDesc;
    use crate::memory::MemoryClass;

    fn timeline() -> (Arc<HostBackend>, Arc<Timeline>) {
        let backend = Arc::new(HostBackend::new());
        let timeline = Arc::new(Timeline::new(backend.clone()));
        (backend, timeline)
    }

    #[test]
    fn safe_release_waits_for_last_submission() {
        let (backend, timeline) = timeline();
        let handle = backend
            .create_buffer(&BufferDesc::new("b", 4), MemoryClass::DeviceLocal)
            .unwrap();
        timeline.submit(&[]).unwrap();
        timeline.safe_release(handle);

        assert_eq!(timeline.purge(), 0);
        assert!(backend.is_alive(handle));
        timeline.wait_for_fence(1).unwrap();
        assert_eq!(timeline.purge(), 1);
        assert!(!backend.is_alive(handle));
    }

    #[test]
    fn release_before_any_submission_is_immediate() {
        let (backend, timeline) = timeline();
        let handle = backend
            .create_buffer(&BufferDesc::new("b", 4), MemoryClass::DeviceLocal)
            .unwrap();
        timeline.safe_release(handle);
        assert_eq!(timeline.purge(), 1);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn fence_values_resolve_through_queue() {
        let (_backend, timeline) = timeline();
        let fence = Fence::new("frame", Arc::clone(&timeline));
        let first = timeline.submit(&[]).unwrap();
        fence.bind(first, 10).unwrap();
        let second = timeline.submit(&[]).unwrap();
        fence.bind(second, 20).unwrap();

        assert_eq!(fence.completed_value(), 0);
        fence.wait(10).unwrap();
        assert_eq!(fence.completed_value(), 10);
        fence.wait(15).unwrap();
        assert_eq!(fence.completed_value(), 20);
    }

    #[test]
    fn fence_values_must_increase() {
        let (_backend, timeline) = timeline();
        let fence = Fence::new("f", Arc::clone(&timeline));
        fence.bind(timeline.submit(&[]).unwrap(), 5).unwrap();
        assert!(fence.bind(2, 5).unwrap_err().is_protocol_violation());
        assert!(fence.wait(6).unwrap_err().is_protocol_violation());
    }
}
