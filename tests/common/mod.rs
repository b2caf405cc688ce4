use std::sync::Arc;
use anyhow::Result;
use tempfile::NamedTempFile;

use stratadb::index::ExtendibleHashTable;
use stratadb::storage::buffer::{BufferPoolInstance, ParallelBufferPool};

// Route crate logging through the test harness
#[allow(dead_code)]
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a single buffer pool instance over a temporary database
#[allow(dead_code)]
pub fn create_test_pool(pool_size: usize) -> Result<(Arc<BufferPoolInstance>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let pool = Arc::new(BufferPoolInstance::open(pool_size, path)?);
    Ok((pool, file))
}

// Create a parallel buffer pool over a temporary database
#[allow(dead_code)]
pub fn create_test_parallel_pool(
    num_instances: u32,
    pool_size: usize,
) -> Result<(Arc<ParallelBufferPool>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let pool = Arc::new(ParallelBufferPool::new(num_instances, pool_size, path)?);
    Ok((pool, file))
}

// Create an extendible hash table backed by its own parallel pool
#[allow(dead_code)]
pub fn create_test_hash_table(
    num_instances: u32,
    pool_size: usize,
) -> Result<(ExtendibleHashTable, NamedTempFile)> {
    let (pool, file) = create_test_parallel_pool(num_instances, pool_size)?;
    let table = ExtendibleHashTable::new(pool)?;
    Ok((table, file))
}
