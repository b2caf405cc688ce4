mod table;

pub use table::ExtendibleHashTable;
