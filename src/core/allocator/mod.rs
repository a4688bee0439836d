//! Sector slot allocation for storage folders
//!
//! Each storage folder tracks slot occupancy with a [`bitmap::BitmapAllocator`]:
//! one bit per sector slot, packed into 64-bit words. Allocation is
//! randomized so writes spread over the whole folder instead of piling up at
//! low offsets.

pub mod bitmap;

pub use bitmap::BitmapAllocator;

/// Random word probes attempted before falling back to a sweep
pub const DEFAULT_PROBE_LIMIT: usize = 256;
