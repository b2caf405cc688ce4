use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Bookkeeping guarded by the instance mutex
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

/// One buffer pool instance: a fixed array of frames, a page table, a free
/// list, and an LRU replacer. Page ids allocated here satisfy
/// `page_id % num_instances == instance_index`, so a router can dispatch
/// by modulo without per-page bookkeeping.
pub struct BufferPoolInstance {
    pool_size: usize,
    num_instances: u32,
    instance_index: u32,
    frames: Vec<FramePtr>,
    state: Mutex<PoolState>,
    // Acquired strictly inside the state mutex
    replacer: Mutex<LruReplacer>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolInstance {
    pub fn new(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0, "buffer pool needs at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            num_instances,
            instance_index,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                next_page_id: instance_index,
            }),
            replacer: Mutex::new(LruReplacer::new(pool_size)),
            disk_manager,
        }
    }

    /// Stand-alone instance over its own backing file
    pub fn open(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::new(pool_size, 1, 0, disk_manager))
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetch a page, reading it from disk on a cache miss. Fails with
    /// `BufferPoolFull` when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let mut frame = self.frames[frame_id as usize].write();
            frame.pin_count += 1;
            self.replacer.lock().pin(frame_id);
            return Ok(frame.page.clone());
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let mut frame = self.frames[frame_id as usize].write();
        {
            let mut page = frame.page.write();
            self.disk_manager.read_page(page_id, &mut page)?;
        }
        frame.pin_count = 1;
        frame.is_dirty = false;

        state.page_table.insert(page_id, frame_id);
        self.replacer.lock().pin(frame_id);

        Ok(frame.page.clone())
    }

    /// Allocate a fresh page and pin it. Fails with `BufferPoolFull` when
    /// every frame is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();

        let frame_id = self.acquire_frame(&mut state)?;
        let page_id = self.allocate_page(&mut state);

        let mut frame = self.frames[frame_id as usize].write();
        {
            let mut page = frame.page.write();
            *page = Page::new(page_id);
        }
        frame.pin_count = 1;
        frame.is_dirty = false;

        state.page_table.insert(page_id, frame_id);
        self.replacer.lock().pin(frame_id);

        Ok((frame.page.clone(), page_id))
    }

    /// Drop one pin on a resident page, optionally marking it dirty. The
    /// frame becomes evictable when its pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let mut frame = self.frames[frame_id as usize].write();
        assert!(
            frame.pin_count > 0,
            "unpinning page {} whose pin count is already zero",
            page_id
        );
        if is_dirty {
            frame.is_dirty = true;
        }
        frame.pin_count -= 1;
        if frame.pin_count == 0 {
            self.replacer.lock().unpin(frame_id);
        }

        Ok(())
    }

    /// Write a resident page back to disk and clear its dirty bit. Pinning
    /// is unaffected.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let mut frame = self.frames[frame_id as usize].write();
        {
            let page = frame.page.read();
            self.disk_manager.write_page(&page)?;
        }
        frame.is_dirty = false;

        Ok(())
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let state = self.state.lock();

        for &frame_id in state.page_table.values() {
            let mut frame = self.frames[frame_id as usize].write();
            {
                let page = frame.page.read();
                self.disk_manager.write_page(&page)?;
            }
            frame.is_dirty = false;
        }

        Ok(())
    }

    /// Remove a page from the pool and deallocate it. A page that is not
    /// resident is vacuously deleted; a pinned page cannot be deleted.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Ok(()),
        };

        let mut frame = self.frames[frame_id as usize].write();
        if frame.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.disk_manager.deallocate_page(page_id);
        state.page_table.remove(&page_id);
        {
            let mut page = frame.page.write();
            *page = Page::new(INVALID_PAGE_ID);
        }
        frame.is_dirty = false;
        frame.pin_count = 0;

        self.replacer.lock().pin(frame_id);
        state.free_list.push_back(frame_id);

        Ok(())
    }

    /// Hand out the next page id in this instance's residue class
    fn allocate_page(&self, state: &mut PoolState) -> PageId {
        let page_id = state.next_page_id;
        state.next_page_id += self.num_instances;
        debug_assert_eq!(page_id % self.num_instances, self.instance_index);
        page_id
    }

    /// Find a frame to hold a new page: free list first, then the replacer.
    /// A dirty victim is written back before reuse.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = match self.replacer.lock().victim() {
            Some(id) => id,
            None => return Err(BufferPoolError::BufferPoolFull),
        };

        let mut frame = self.frames[frame_id as usize].write();
        let old_page_id = frame.page.read().page_id;
        if frame.is_dirty {
            debug!("evicting dirty page {} from frame {}", old_page_id, frame_id);
            let page = frame.page.read();
            self.disk_manager.write_page(&page)?;
        }
        if old_page_id != INVALID_PAGE_ID {
            state.page_table.remove(&old_page_id);
        }
        frame.is_dirty = false;
        frame.pin_count = 0;

        Ok(frame_id)
    }
}
