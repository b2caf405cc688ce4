mod bucket;
mod directory;

pub use bucket::{BucketPage, BUCKET_CAPACITY};
pub use directory::{DirectoryPage, DIRECTORY_ARRAY_SIZE, MAX_DEPTH};
