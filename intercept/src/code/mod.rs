pub mod access;
pub mod allocator;
pub mod cache;
pub mod patcher;
