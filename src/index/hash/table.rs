use std::io::Cursor;
use std::sync::Arc;
use log::debug;
use murmur3::murmur3_x64_128;
use parking_lot::RwLock;

use crate::common::types::{Page, PageId, Rid};
use crate::storage::buffer::{BufferPoolError, ParallelBufferPool};
use crate::storage::page::{BucketPage, DirectoryPage, BUCKET_CAPACITY};

/// Disk-backed extendible hash index: one directory page plus a set of
/// bucket pages, all owned by the buffer pool.
///
/// Read paths and the fast insert/remove paths hold the table latch in
/// shared mode; split and merge reacquire it exclusively and re-check the
/// directory, since the picture may have changed in between.
pub struct ExtendibleHashTable {
    buffer_pool: Arc<ParallelBufferPool>,
    directory_page_id: PageId,
    table_latch: RwLock<()>,
    directory: DirectoryPage,
    bucket: BucketPage,
}

impl ExtendibleHashTable {
    /// Create a fresh table: an empty directory at depth zero pointing at a
    /// single empty bucket
    pub fn new(buffer_pool: Arc<ParallelBufferPool>) -> Result<Self, BufferPoolError> {
        let directory = DirectoryPage::new();
        let bucket = BucketPage::new();

        let (dir_ptr, directory_page_id) = buffer_pool.new_page()?;
        let (bucket_ptr, bucket_page_id) = buffer_pool.new_page()?;
        {
            let mut dir = dir_ptr.write();
            directory.init(&mut dir);
            directory.set_bucket_page_id(&mut dir, 0, bucket_page_id);
        }
        {
            let mut page = bucket_ptr.write();
            bucket.reset(&mut page);
        }
        buffer_pool.unpin_page(bucket_page_id, true)?;
        buffer_pool.unpin_page(directory_page_id, true)?;

        Ok(Self {
            buffer_pool,
            directory_page_id,
            table_latch: RwLock::new(()),
            directory,
            bucket,
        })
    }

    /// Low 32 bits of MurmurHash3 over the key's little-endian bytes
    pub fn hash(key: i32) -> u32 {
        let hash = murmur3_x64_128(&mut Cursor::new(key.to_le_bytes()), 0)
            .expect("hashing an in-memory buffer cannot fail");
        hash as u32
    }

    fn key_to_directory_index(&self, dir: &Page, key: i32) -> u32 {
        Self::hash(key) & self.directory.global_depth_mask(dir)
    }

    /// Collect every value stored under `key`
    pub fn get_value(&self, key: i32) -> Result<Vec<Rid>, BufferPoolError> {
        let _table = self.table_latch.read();

        let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let bucket_page_id = {
            let dir = dir_ptr.read();
            let idx = self.key_to_directory_index(&dir, key);
            self.directory.bucket_page_id(&dir, idx)
        };

        let bucket_ptr = self.buffer_pool.fetch_page(bucket_page_id)?;
        let mut result = Vec::new();
        {
            let page = bucket_ptr.read();
            self.bucket.get_value(&page, key, &mut result);
        }

        self.buffer_pool.unpin_page(bucket_page_id, false)?;
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(result)
    }

    /// Insert a `(key, value)` pair. Returns false when the exact pair is
    /// already present; duplicate keys with distinct values are fine.
    pub fn insert(&self, key: i32, value: Rid) -> Result<bool, BufferPoolError> {
        {
            let _table = self.table_latch.read();

            let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let dir = dir_ptr.read();
                let idx = self.key_to_directory_index(&dir, key);
                self.directory.bucket_page_id(&dir, idx)
            };

            let bucket_ptr = self.buffer_pool.fetch_page(bucket_page_id)?;
            let mut full = false;
            let mut inserted = false;
            {
                let mut page = bucket_ptr.write();
                if self.bucket.is_full(&page) {
                    full = true;
                } else {
                    inserted = self.bucket.insert(&mut page, key, value);
                }
            }

            self.buffer_pool.unpin_page(bucket_page_id, inserted)?;
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;

            if !full {
                return Ok(inserted);
            }
        }

        self.split_insert(key, value)
    }

    /// Slow insert path: split the target bucket under the exclusive table
    /// latch until the pair fits. Splitting loops because a pathological
    /// key set can land every rehashed entry in the same half.
    ///
    /// Buffer pool calls are never made while a page latch is held; the
    /// exclusive table latch keeps the directory stable across the gaps.
    fn split_insert(&self, key: i32, value: Rid) -> Result<bool, BufferPoolError> {
        let _table = self.table_latch.write();

        loop {
            let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let dir = dir_ptr.read();
                let idx = self.key_to_directory_index(&dir, key);
                self.directory.bucket_page_id(&dir, idx)
            };
            let bucket_ptr = self.buffer_pool.fetch_page(bucket_page_id)?;

            // The bucket may have gained room between the shared-latch
            // probe and this exclusive retry
            let mut inserted = false;
            let full = {
                let mut page = bucket_ptr.write();
                if self.bucket.is_full(&page) {
                    true
                } else {
                    inserted = self.bucket.insert(&mut page, key, value);
                    false
                }
            };
            if !full {
                self.buffer_pool.unpin_page(bucket_page_id, inserted)?;
                self.buffer_pool.unpin_page(self.directory_page_id, false)?;
                return Ok(inserted);
            }

            let (new_ptr, new_page_id) = self.buffer_pool.new_page()?;

            {
                let mut dir = dir_ptr.write();
                let bucket_idx = self.key_to_directory_index(&dir, key);

                if self.directory.local_depth(&dir, bucket_idx)
                    == self.directory.global_depth(&dir)
                {
                    self.directory.incr_global_depth(&mut dir);
                }

                self.directory.incr_local_depth(&mut dir, bucket_idx);
                let new_local_depth = self.directory.local_depth(&dir, bucket_idx);
                let local_mask = (1u32 << new_local_depth) - 1;

                // Repoint the half of the old bucket's directory slots
                // whose low bits now disagree with it
                for i in 0..self.directory.size(&dir) {
                    if self.directory.bucket_page_id(&dir, i) == bucket_page_id {
                        self.directory
                            .set_local_depth(&mut dir, i, new_local_depth as u8);
                        if (i & local_mask) != (bucket_idx & local_mask) {
                            self.directory.set_bucket_page_id(&mut dir, i, new_page_id);
                        }
                    }
                }

                debug!(
                    "split bucket page {} into {} at local depth {}",
                    bucket_page_id, new_page_id, new_local_depth
                );

                // Redistribute the old bucket's live entries by their new
                // directory index
                let mut old_page = bucket_ptr.write();
                let mut new_page = new_ptr.write();
                self.bucket.reset(&mut new_page);
                for slot in 0..BUCKET_CAPACITY {
                    if !self.bucket.is_readable(&old_page, slot) {
                        continue;
                    }
                    let slot_key = self.bucket.key_at(&old_page, slot);
                    let slot_value = self.bucket.value_at(&old_page, slot);
                    let target_idx = self.key_to_directory_index(&dir, slot_key);
                    let target_pid = self.directory.bucket_page_id(&dir, target_idx);
                    debug_assert!(target_pid == bucket_page_id || target_pid == new_page_id);
                    if target_pid == new_page_id {
                        self.bucket.remove_at(&mut old_page, slot);
                        self.bucket.insert(&mut new_page, slot_key, slot_value);
                    }
                }
            }

            self.buffer_pool.unpin_page(bucket_page_id, true)?;
            self.buffer_pool.unpin_page(new_page_id, true)?;
            self.buffer_pool.unpin_page(self.directory_page_id, true)?;
            // Retry the insert against the refreshed directory
        }
    }

    /// Remove the unique `(key, value)` pair. An emptied bucket is handed
    /// to the merge path.
    pub fn remove(&self, key: i32, value: Rid) -> Result<bool, BufferPoolError> {
        let removed;
        let emptied;
        {
            let _table = self.table_latch.read();

            let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let dir = dir_ptr.read();
                let idx = self.key_to_directory_index(&dir, key);
                self.directory.bucket_page_id(&dir, idx)
            };

            let bucket_ptr = self.buffer_pool.fetch_page(bucket_page_id)?;
            {
                let mut page = bucket_ptr.write();
                removed = self.bucket.remove(&mut page, key, value);
                emptied = self.bucket.is_empty(&page);
            }

            self.buffer_pool.unpin_page(bucket_page_id, removed)?;
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        }

        if emptied {
            self.merge(key)?;
        }
        Ok(removed)
    }

    /// Fold an empty bucket into its split image and shrink the directory
    /// while possible. Refuses when the bucket is at depth zero, when the
    /// split image sits at a different depth, or when a concurrent insert
    /// refilled the bucket.
    fn merge(&self, key: i32) -> Result<(), BufferPoolError> {
        let _table = self.table_latch.write();

        let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let merge_target = {
            let dir = dir_ptr.read();
            let bucket_idx = self.key_to_directory_index(&dir, key);
            let local_depth = self.directory.local_depth(&dir, bucket_idx);
            if local_depth == 0 {
                None
            } else {
                let split_idx = self.directory.split_image_index(&dir, bucket_idx);
                if self.directory.local_depth(&dir, split_idx) != local_depth {
                    None
                } else {
                    Some((
                        self.directory.bucket_page_id(&dir, bucket_idx),
                        self.directory.bucket_page_id(&dir, split_idx),
                        local_depth,
                    ))
                }
            }
        };
        let (bucket_page_id, split_page_id, local_depth) = match merge_target {
            Some(target) => target,
            None => {
                self.buffer_pool.unpin_page(self.directory_page_id, false)?;
                return Ok(());
            }
        };
        debug_assert_ne!(bucket_page_id, split_page_id);

        let bucket_ptr = self.buffer_pool.fetch_page(bucket_page_id)?;
        let still_empty = {
            let page = bucket_ptr.read();
            self.bucket.is_empty(&page)
        };
        if !still_empty {
            self.buffer_pool.unpin_page(bucket_page_id, false)?;
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            return Ok(());
        }

        {
            let mut dir = dir_ptr.write();
            for i in 0..self.directory.size(&dir) {
                let pid = self.directory.bucket_page_id(&dir, i);
                if pid == bucket_page_id || pid == split_page_id {
                    self.directory.set_bucket_page_id(&mut dir, i, split_page_id);
                    self.directory
                        .set_local_depth(&mut dir, i, local_depth as u8 - 1);
                }
            }

            while self.directory.can_shrink(&dir) {
                self.directory.decr_global_depth(&mut dir);
            }

            debug!(
                "merged empty bucket page {} into {}, global depth now {}",
                bucket_page_id,
                split_page_id,
                self.directory.global_depth(&dir)
            );
        }

        self.buffer_pool.unpin_page(bucket_page_id, false)?;
        if let Err(e) = self.buffer_pool.delete_page(bucket_page_id) {
            debug!("leaving merged bucket page {} in place: {}", bucket_page_id, e);
        }
        self.buffer_pool.unpin_page(self.directory_page_id, true)?;

        Ok(())
    }

    /// Current directory depth
    pub fn global_depth(&self) -> Result<u32, BufferPoolError> {
        let _table = self.table_latch.read();

        let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let depth = {
            let dir = dir_ptr.read();
            self.directory.global_depth(&dir)
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(depth)
    }

    /// Assert the directory invariants; panics when they do not hold
    pub fn verify_integrity(&self) -> Result<(), BufferPoolError> {
        let _table = self.table_latch.read();

        let dir_ptr = self.buffer_pool.fetch_page(self.directory_page_id)?;
        {
            let dir = dir_ptr.read();
            self.directory.verify_integrity(&dir);
        }
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(())
    }
}
