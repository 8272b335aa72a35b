//! A fixed-capacity, block-structured circular buffer in shared memory.
//!
//! Variable-length messages travel between writer and reader processes
//! without a kernel round-trip on the data path: payload spans a chain of
//! fixed-size blocks linked by index, two process-shared counting
//! semaphores account for capacity and readiness, and four cursors carve
//! the block array into free, mid-write, committed and draining regions.

mod core;
pub mod errors;
pub mod reader;
mod sem;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{
    reader_context, writer_context, RingConfig, RingConfigBuilder, RingService, BLOCK_ALIGN,
};
pub use crate::errors::RingError;
