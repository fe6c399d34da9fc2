//! MMAP coded-input pool and DMA-BUF decoded-output pool.

pub mod coded;
pub mod decoded;

pub use coded::CodedPool;
pub use decoded::DecodedPool;
