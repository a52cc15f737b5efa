pub mod allocator;
pub mod error;
pub mod pool;
pub mod range;
