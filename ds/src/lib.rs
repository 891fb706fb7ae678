//! Data storage interface for the MYFATFS file system engine.
//!
//! A `DataStorage` is a fixed-capacity, randomly addressable byte store. The
//! engine never assumes anything about what backs it: a real file, a RAM disk
//! for tests, or eventually a block device driver. There is no caching layer
//! here — every `read`/`write` call is expected to go straight through.

pub use myfatfs_err::{Error, Result};

/// Number of addressable blocks in an image.
pub const TOTAL_BLOCKS: u64 = 65536;
/// Bytes per block.
pub const BLOCK_SIZE: u64 = 1024;
/// Total byte size of an image: `TOTAL_BLOCKS * BLOCK_SIZE` (64 MiB).
pub const TOTAL_BYTES: u64 = TOTAL_BLOCKS * BLOCK_SIZE;

pub trait DataStorage {
    /// Reads `buffer.len()` bytes starting at `offset`.
    ///
    /// Fails if `offset + buffer.len()` exceeds [`TOTAL_BYTES`].
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer.len()` bytes starting at `offset`.
    ///
    /// Fails if `offset + buffer.len()` exceeds [`TOTAL_BYTES`].
    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}

/// Bounds-checks an access against the fixed image size, mapping a violation
/// to [`Error::OutOfRangeBlock`]. Implementors of [`DataStorage`] call this
/// before touching the backing store.
pub fn check_bounds(offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .filter(|&end| end <= TOTAL_BYTES);
    if end.is_none() {
        return Err(Error::OutOfRangeBlock((offset / BLOCK_SIZE) as u32));
    }
    Ok(())
}
