use std::sync::Arc;
use parking_lot::RwLock;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type; a lower id means an older transaction
pub type TxnId = u32;

/// Sentinel for "no transaction"
pub const INVALID_TXN_ID: TxnId = u32::MAX;

/// Row ID type
pub type Rid = u32;

/// Page structure
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the page contents, keeping the id
    pub fn reset_memory(&mut self) {
        self.data = [0; PAGE_SIZE];
    }
}

/// Smart pointer to a page; the RwLock is the per-page latch
pub type PagePtr = Arc<RwLock<Page>>;

/// Buffer pool frame structure
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId, page: PagePtr) -> Self {
        Self {
            page,
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FramePtr = Arc<RwLock<Frame>>;
