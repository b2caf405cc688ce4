use std::path::Path;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::{PageId, PagePtr};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::instance::BufferPoolInstance;
use crate::storage::disk::DiskManager;

/// Partitions page ids across several buffer pool instances and presents
/// the single facade used by the rest of the system. Operations addressed
/// by page id route to `instances[page_id % num_instances]`; `new_page`
/// round-robins a start index across instances.
pub struct ParallelBufferPool {
    instances: Vec<Arc<BufferPoolInstance>>,
    start_index: Mutex<usize>,
}

impl ParallelBufferPool {
    pub fn new(
        num_instances: u32,
        pool_size: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        assert!(num_instances > 0, "buffer pool needs at least one instance");

        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let instances = (0..num_instances)
            .map(|i| {
                Arc::new(BufferPoolInstance::new(
                    pool_size,
                    num_instances,
                    i,
                    disk_manager.clone(),
                ))
            })
            .collect();

        Ok(Self {
            instances,
            start_index: Mutex::new(0),
        })
    }

    /// Total number of frames across all instances
    pub fn pool_size(&self) -> usize {
        self.instances.len() * self.instances[0].pool_size()
    }

    fn instance_for(&self, page_id: PageId) -> &BufferPoolInstance {
        &self.instances[page_id as usize % self.instances.len()]
    }

    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    /// Try each instance in round-robin order until one has a free frame.
    /// Fails only when every instance has every frame pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut start_index = self.start_index.lock();

        for _ in 0..self.instances.len() {
            let result = self.instances[*start_index].new_page();
            *start_index = (*start_index + 1) % self.instances.len();
            match result {
                Ok(created) => return Ok(created),
                Err(BufferPoolError::BufferPoolFull) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(BufferPoolError::BufferPoolFull)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).delete_page(page_id)
    }

    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }
}
