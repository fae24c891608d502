// Dynamic/upload allocator
//
// Each context bump-allocates out of host-visible upload pages. Pages come
// from a device-wide pool; a context retires the pages it used at the end of
// a frame and the pool hands them out again once the GPU has consumed them.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::RawHandle;
use crate::error::{EngineError, Result};
use crate::sync::Timeline;

/// Persistently mapped upload memory
pub struct UploadPage {
    handle: RawHandle,
    cpu: NonNull<u8>,
    size: u64,
    dedicated: bool,
    timeline: Arc<Timeline>,
}

// SAFETY: the mapping stays valid until the page is released, and the page
// is only released through the deferred queue after its last owner is gone.
unsafe impl Send for UploadPage {}
unsafe impl Sync for UploadPage {}

impl UploadPage {
    pub(crate) fn new(timeline: &Arc<Timeline>, size: u64, dedicated: bool) -> Result<Self> {
        let (handle, cpu) = timeline.backend().create_upload_page(size)?;
        log::debug!(
            "Created {}upload page {:?} ({} bytes)",
            if dedicated { "dedicated " } else { "" },
            handle,
            size
        );
        Ok(Self {
            handle,
            cpu,
            size,
            dedicated,
            timeline: Arc::clone(timeline),
        })
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Copy `data` into the page at `offset`
    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len() as u64).map_or(true, |end| end > self.size) {
            return Err(EngineError::ProtocolViolation(format!(
                "Write of {} bytes at offset {} overflows upload page of {} bytes",
                data.len(),
                offset,
                self.size
            )));
        }
        // SAFETY: range checked above; the page memory is never handed out
        // as a Rust reference.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.cpu.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

impl Drop for UploadPage {
    fn drop(&mut self) {
        self.timeline.safe_release(self.handle);
    }
}

impl std::fmt::Debug for UploadPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPage")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

/// A range of an upload page handed out for one frame
#[derive(Debug, Clone)]
pub struct DynamicAllocation {
    page: Arc<UploadPage>,
    offset: u64,
    size: u64,
    frame: u64,
}

impl DynamicAllocation {
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        // SAFETY: offset + size lies within the page
        unsafe { NonNull::new_unchecked(self.page.cpu.as_ptr().add(self.offset as usize)) }
    }

    /// Offset of the allocation inside its page, as seen by the GPU
    pub fn gpu_offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn page_handle(&self) -> RawHandle {
        self.page.handle
    }

    pub(crate) fn page(&self) -> &Arc<UploadPage> {
        &self.page
    }

    /// The page may have been recycled once the frame is over
    pub fn is_stale(&self, current_frame: u64) -> bool {
        self.frame != current_frame
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagePoolStats {
    pub created: u64,
    pub recycled: u64,
    pub free: usize,
    pub retired: usize,
    pub awaiting_submit: usize,
}

#[derive(Default)]
struct PoolInner {
    free: Vec<Arc<UploadPage>>,
    retired: VecDeque<(u64, Arc<UploadPage>)>,
    /// Pages of deferred contexts, retired at the next immediate submission
    awaiting_submit: Vec<Arc<UploadPage>>,
    created: u64,
    recycled: u64,
}

/// Device-wide pool of upload pages
pub(crate) struct PagePool {
    timeline: Arc<Timeline>,
    page_size: u64,
    inner: Mutex<PoolInner>,
}

impl PagePool {
    pub fn new(timeline: Arc<Timeline>, page_size: u64) -> Self {
        Self {
            timeline,
            page_size,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Reuse a reclaimed page or create a new one. Requests larger than the
    /// page size get a dedicated page.
    pub fn acquire(&self, min_size: u64) -> Result<Arc<UploadPage>> {
        if min_size > self.page_size {
            let page = UploadPage::new(&self.timeline, min_size, true)?;
            self.inner.lock().created += 1;
            return Ok(Arc::new(page));
        }

        {
            let mut inner = self.inner.lock();
            Self::reclaim_locked(&mut inner, self.timeline.last_completed());
            if let Some(page) = inner.free.pop() {
                return Ok(page);
            }
        }

        let page = UploadPage::new(&self.timeline, self.page_size, false)?;
        self.inner.lock().created += 1;
        Ok(Arc::new(page))
    }

    /// Hand pages back, reusable once `fence_value` has completed. Dedicated
    /// pages are released instead.
    pub fn retire(&self, fence_value: u64, pages: Vec<Arc<UploadPage>>) {
        if pages.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let fence_value = inner
            .retired
            .back()
            .map_or(fence_value, |(last, _)| (*last).max(fence_value));
        for page in pages {
            if !page.dedicated {
                inner.retired.push_back((fence_value, page));
            }
        }
    }

    /// Park pages whose commands have not been submitted yet
    pub fn defer(&self, pages: Vec<Arc<UploadPage>>) {
        self.inner.lock().awaiting_submit.extend(pages);
    }

    pub fn take_awaiting(&self) -> Vec<Arc<UploadPage>> {
        std::mem::take(&mut self.inner.lock().awaiting_submit)
    }

    /// Move retired pages whose fence completed to the free list
    pub fn reclaim(&self, last_completed: u64) -> usize {
        Self::reclaim_locked(&mut self.inner.lock(), last_completed)
    }

    fn reclaim_locked(inner: &mut PoolInner, last_completed: u64) -> usize {
        let mut count = 0;
        while let Some((fence_value, _)) = inner.retired.front() {
            if *fence_value > last_completed {
                break;
            }
            if let Some((_, page)) = inner.retired.pop_front() {
                inner.free.push(page);
                count += 1;
            }
        }
        inner.recycled += count as u64;
        count
    }

    /// Drop every pooled page. Only valid once the GPU is idle.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.free.clear();
        inner.retired.clear();
        inner.awaiting_submit.clear();
    }

    pub fn stats(&self) -> PagePoolStats {
        let inner = self.inner.lock();
        PagePoolStats {
            created: inner.created,
            recycled: inner.recycled,
            free: inner.free.len(),
            retired: inner.retired.len(),
            awaiting_submit: inner.awaiting_submit.len(),
        }
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Per-context bump allocator
pub(crate) struct DynamicHeap {
    context_id: usize,
    alignment: u64,
    current: Option<Arc<UploadPage>>,
    cursor: u64,
    /// Every page touched since the last retire, current page included
    used: Vec<Arc<UploadPage>>,
}

impl DynamicHeap {
    pub fn new(context_id: usize, alignment: u64) -> Self {
        Self {
            context_id,
            alignment,
            current: None,
            cursor: 0,
            used: Vec::new(),
        }
    }

    pub fn allocate(
        &mut self,
        pool: &PagePool,
        size: u64,
        alignment: u64,
        frame: u64,
    ) -> Result<DynamicAllocation> {
        if size == 0 {
            return Err(EngineError::ProtocolViolation(
                "Zero-sized dynamic allocation".into(),
            ));
        }
        let alignment = alignment.max(self.alignment).next_power_of_two();

        if size > pool.page_size() {
            let page = pool.acquire(size)?;
            self.used.push(Arc::clone(&page));
            return Ok(DynamicAllocation {
                page,
                offset: 0,
                size,
                frame,
            });
        }

        let fits = |page: &UploadPage, cursor: u64| align_up(cursor, alignment) + size <= page.size;
        let reuse = match &self.current {
            Some(page) if fits(&**page, self.cursor) => Some(Arc::clone(page)),
            _ => None,
        };
        let page = match reuse {
            Some(page) => page,
            None => {
                let page = pool.acquire(size)?;
                log::trace!(
                    "Context {} switched to upload page {:?}",
                    self.context_id,
                    page.handle
                );
                self.used.push(Arc::clone(&page));
                self.current = Some(Arc::clone(&page));
                self.cursor = 0;
                page
            }
        };

        let offset = align_up(self.cursor, alignment);
        self.cursor = offset + size;
        Ok(DynamicAllocation {
            page,
            offset,
            size,
            frame,
        })
    }

    /// Give up every page used since the last call
    pub fn retire(&mut self) -> Vec<Arc<UploadPage>> {
        self.current = None;
        self.cursor = 0;
        std::mem::take(&mut self.used)
    }

    #[cfg(test)]
    pub fn used_pages(&self) -> usize {
        self.used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, HostBackend};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(page_size: u64) -> (Arc<HostBackend>, PagePool) {
        let backend = Arc::new(HostBackend::new());
        let timeline = Arc::new(Timeline::new(backend.clone()));
        (backend, PagePool::new(timeline, page_size))
    }

    #[test]
    fn allocations_in_one_frame_are_disjoint() {
        let (_backend, pool) = pool(256);
        let mut heap = DynamicHeap::new(0, 16);
        let mut ranges = Vec::new();
        for size in [40u64, 100, 8, 200, 1] {
            let allocation = heap.allocate(&pool, size, 1, 0).unwrap();
            assert_eq!(allocation.gpu_offset() % 16, 0);
            ranges.push((allocation.page_handle(), allocation.gpu_offset(), size));
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.0 == b.0 {
                    assert!(a.1 + a.2 <= b.1 || b.1 + b.2 <= a.1, "{:?} overlaps {:?}", a, b);
                }
            }
        }
        assert_eq!(heap.used_pages(), 2);
    }

    #[test]
    fn oversized_requests_get_dedicated_pages() {
        let (backend, pool) = pool(64);
        let mut heap = DynamicHeap::new(0, 16);
        let big = heap.allocate(&pool, 1000, 16, 0).unwrap();
        assert_eq!(big.gpu_offset(), 0);
        assert!(big.page().is_dedicated());
        let handle = big.page_handle();

        pool.retire(0, heap.retire());
        drop(big);
        assert_eq!(pool.stats().retired, 0);
        pool.timeline.purge();
        assert!(!backend.is_alive(handle));
    }

    #[test]
    fn pages_are_recycled_after_their_fence() {
        let (backend, pool) = pool(64);
        let mut heap = DynamicHeap::new(0, 16);
        let first = heap.allocate(&pool, 32, 16, 0).unwrap().page_handle();

        let fence = pool.timeline.submit(&[]).unwrap();
        pool.retire(fence, heap.retire());
        assert_eq!(pool.stats().retired, 1);

        // Not completed yet: a fresh page is created
        let second = heap.allocate(&pool, 32, 16, 1).unwrap().page_handle();
        assert_ne!(first, second);

        backend.wait_idle().unwrap();
        pool.retire(fence, heap.retire());
        let third = heap.allocate(&pool, 32, 16, 2).unwrap().page_handle();
        assert!(third == first || third == second);
        assert_eq!(pool.stats().created, 2);
        assert!(pool.stats().recycled >= 1);
    }

    #[test]
    fn allocations_from_older_frames_are_stale() {
        let (_backend, pool) = pool(64);
        let mut heap = DynamicHeap::new(0, 16);
        let allocation = heap.allocate(&pool, 16, 16, 3).unwrap();
        assert!(!allocation.is_stale(3));
        assert!(allocation.is_stale(4));
    }

    #[test]
    fn zero_sized_allocations_are_rejected() {
        let (_backend, pool) = pool(64);
        let mut heap = DynamicHeap::new(0, 16);
        assert!(heap.allocate(&pool, 0, 16, 0).is_err());
    }

    #[test]
    fn concurrent_acquire_never_shares_a_page() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        let (backend, pool) = pool(64);
        let in_use = Mutex::new(HashSet::new());
        let shared = AtomicUsize::new(0);
        let running = AtomicUsize::new(THREADS);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for round in 0..ROUNDS {
                        let page = pool.acquire(32).unwrap();
                        if !in_use.lock().insert(page.handle()) {
                            shared.fetch_add(1, Ordering::Relaxed);
                        }
                        page.write(0, &[round as u8; 32]).unwrap();
                        in_use.lock().remove(&page.handle());
                        let fence = pool.timeline.submit(&[]).unwrap();
                        pool.retire(fence, vec![page]);
                    }
                    running.fetch_sub(1, Ordering::AcqRel);
                });
            }

            while running.load(Ordering::Acquire) > 0 {
                backend.wait_idle().unwrap();
                pool.reclaim(pool.timeline.last_completed());
                std::thread::yield_now();
            }
        });

        assert_eq!(shared.load(Ordering::Relaxed), 0);
        backend.wait_idle().unwrap();
        pool.reclaim(pool.timeline.last_completed());
        let stats = pool.stats();
        assert_eq!(stats.retired, 0);
        assert_eq!(stats.free as u64, stats.created);
    }
}
