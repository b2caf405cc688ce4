use anyhow::Result;

use stratadb::storage::buffer::BufferPoolError;

mod common;
use common::{create_test_parallel_pool, create_test_pool, init_test_logger};

#[test]
fn test_new_page() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(10)?;

    let (page, page_id) = pool.new_page()?;
    {
        let page_guard = page.read();
        assert_eq!(page_guard.page_id, page_id);
        assert!(page_guard.data.iter().all(|&b| b == 0));
    }

    pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_fetch_page() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(10)?;

    let (_, page_id) = pool.new_page()?;
    pool.unpin_page(page_id, false)?;

    let fetched = pool.fetch_page(page_id)?;
    {
        let page_guard = fetched.read();
        assert_eq!(page_guard.page_id, page_id);
    }

    pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_page_modification() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(10)?;

    let (page, page_id) = pool.new_page()?;
    {
        let mut page_guard = page.write();
        let test_data = b"Test Data";
        page_guard.data[100..100 + test_data.len()].copy_from_slice(test_data);
    }
    pool.unpin_page(page_id, true)?;

    let fetched = pool.fetch_page(page_id)?;
    {
        let page_guard = fetched.read();
        let test_data = b"Test Data";
        assert_eq!(&page_guard.data[100..100 + test_data.len()], test_data);
    }

    pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_eviction_round_trips_through_disk() -> Result<()> {
    init_test_logger();
    // A single frame forces every new page to evict the previous one
    let (pool, _temp_file) = create_test_pool(1)?;

    let (page, first_id) = pool.new_page()?;
    {
        let mut page_guard = page.write();
        page_guard.data[0..5].copy_from_slice(b"hello");
    }
    pool.unpin_page(first_id, true)?;

    // Evicts the dirty first page, which must be written back
    let (_, second_id) = pool.new_page()?;
    pool.unpin_page(second_id, false)?;

    let fetched = pool.fetch_page(first_id)?;
    {
        let page_guard = fetched.read();
        assert_eq!(&page_guard.data[0..5], b"hello");
    }
    pool.unpin_page(first_id, false)?;
    Ok(())
}

#[test]
fn test_buffer_pool_eviction() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(3)?;

    let mut page_ids = Vec::new();
    for _ in 0..5 {
        let (_, page_id) = pool.new_page()?;
        pool.unpin_page(page_id, true)?;
        page_ids.push(page_id);
    }

    // The first page was evicted; fetching it reads it back from disk
    let first_page = pool.fetch_page(page_ids[0])?;
    {
        let page_guard = first_page.read();
        assert_eq!(page_guard.page_id, page_ids[0]);
    }
    pool.unpin_page(page_ids[0], false)?;
    Ok(())
}

#[test]
fn test_all_frames_pinned_fails() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(3)?;

    let mut page_ids = Vec::new();
    for _ in 0..3 {
        let (_, page_id) = pool.new_page()?;
        page_ids.push(page_id);
    }

    // Every frame is pinned: neither a new page nor a miss can get a frame
    assert!(matches!(
        pool.new_page(),
        Err(BufferPoolError::BufferPoolFull)
    ));

    // Unpinning one frame makes room again
    pool.unpin_page(page_ids[0], false)?;
    let (_, page_id) = pool.new_page()?;
    pool.unpin_page(page_id, false)?;

    for &page_id in &page_ids[1..] {
        pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_unpin_unknown_page_fails() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(3)?;
    assert!(matches!(
        pool.unpin_page(1234, false),
        Err(BufferPoolError::PageNotFound(1234))
    ));
    Ok(())
}

#[test]
fn test_flush_page() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(10)?;

    let (page, page_id) = pool.new_page()?;
    {
        let mut page_guard = page.write();
        let test_data = b"Test Data For Flushing";
        page_guard.data[100..100 + test_data.len()].copy_from_slice(test_data);
    }
    pool.unpin_page(page_id, true)?;
    pool.flush_page(page_id)?;

    let fetched = pool.fetch_page(page_id)?;
    {
        let page_guard = fetched.read();
        let test_data = b"Test Data For Flushing";
        assert_eq!(&page_guard.data[100..100 + test_data.len()], test_data);
    }
    pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_flush_all_pages() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(10)?;

    let mut page_ids = Vec::new();
    for i in 0..5 {
        let (page, page_id) = pool.new_page()?;
        {
            let mut page_guard = page.write();
            let test_data = format!("Test Data {}", i).into_bytes();
            page_guard.data[100..100 + test_data.len()].copy_from_slice(&test_data);
        }
        pool.unpin_page(page_id, true)?;
        page_ids.push(page_id);
    }

    pool.flush_all_pages()?;

    for (i, &page_id) in page_ids.iter().enumerate() {
        let fetched = pool.fetch_page(page_id)?;
        {
            let page_guard = fetched.read();
            let expected = format!("Test Data {}", i).into_bytes();
            assert_eq!(&page_guard.data[100..100 + expected.len()], expected.as_slice());
        }
        pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_delete_page() -> Result<()> {
    let (pool, _temp_file) = create_test_pool(10)?;

    let (_, page_id) = pool.new_page()?;

    // A pinned page cannot be deleted
    assert!(matches!(
        pool.delete_page(page_id),
        Err(BufferPoolError::PagePinned(_))
    ));

    pool.unpin_page(page_id, false)?;
    pool.delete_page(page_id)?;

    // A page that is not resident is vacuously deleted
    pool.delete_page(9999)?;

    // The freed frame is reusable
    let (new_page, new_page_id) = pool.new_page()?;
    {
        let page_guard = new_page.read();
        assert_eq!(page_guard.page_id, new_page_id);
    }
    pool.unpin_page(new_page_id, false)?;
    Ok(())
}

#[test]
fn test_parallel_pool_residue_classes() -> Result<()> {
    let (pool, _temp_file) = create_test_parallel_pool(3, 5)?;
    assert_eq!(pool.pool_size(), 15);

    let mut page_ids = Vec::new();
    for _ in 0..9 {
        let (_, page_id) = pool.new_page()?;
        pool.unpin_page(page_id, false)?;
        page_ids.push(page_id);
    }

    // Round-robin allocation covers every residue class mod 3
    for residue in 0..3u32 {
        assert_eq!(
            page_ids.iter().filter(|&&id| id % 3 == residue).count(),
            3,
            "residue class {} not evenly allocated",
            residue
        );
    }

    // Every page routes back to the instance that allocated it
    for &page_id in &page_ids {
        let page = pool.fetch_page(page_id)?;
        assert_eq!(page.read().page_id, page_id);
        pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_parallel_pool_modification_round_trip() -> Result<()> {
    let (pool, _temp_file) = create_test_parallel_pool(4, 3)?;

    let mut page_ids = Vec::new();
    for i in 0..8u32 {
        let (page, page_id) = pool.new_page()?;
        {
            let mut page_guard = page.write();
            page_guard.data[0..4].copy_from_slice(&i.to_le_bytes());
        }
        pool.unpin_page(page_id, true)?;
        page_ids.push(page_id);
    }

    for (i, &page_id) in page_ids.iter().enumerate() {
        let page = pool.fetch_page(page_id)?;
        {
            let page_guard = page.read();
            assert_eq!(page_guard.data[0..4], (i as u32).to_le_bytes());
        }
        pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_parallel_pool_full_only_when_all_instances_full() -> Result<()> {
    let (pool, _temp_file) = create_test_parallel_pool(2, 2)?;

    let mut page_ids = Vec::new();
    for _ in 0..4 {
        let (_, page_id) = pool.new_page()?;
        page_ids.push(page_id);
    }

    assert!(matches!(
        pool.new_page(),
        Err(BufferPoolError::BufferPoolFull)
    ));

    // Freeing a single frame anywhere unblocks allocation
    pool.unpin_page(page_ids[0], false)?;
    let (_, page_id) = pool.new_page()?;
    pool.unpin_page(page_id, false)?;

    for &page_id in &page_ids[1..] {
        pool.unpin_page(page_id, false)?;
    }
    Ok(())
}
