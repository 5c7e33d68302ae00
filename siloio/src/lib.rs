// SPDX-License-Identifier: MIT
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(not(feature = "std"), feature = "alloc"))]
extern crate alloc;

// === Core modules ===
pub mod error;
mod macros;

// === Backend modules ===
#[cfg(feature = "std")]
mod file;

#[cfg(feature = "mem")]
mod mem;

// === Prelude re-exports (central entrypoint) ===
pub mod prelude {
    pub use super::BlockDev;
    pub use super::BlockDevExt;
    pub use super::error::*;

    #[cfg(feature = "std")]
    pub use super::file::FileBlockDev;

    #[cfg(feature = "mem")]
    pub use super::mem::MemBlockDev;
}

// === Internal use ===
use error::*;
#[allow(clippy::single_component_path_imports)]
use paste;

#[cfg(feature = "std")]
pub use file::FileBlockDev;
#[cfg(feature = "mem")]
pub use mem::MemBlockDev;

/// Block device abstraction trait.
///
/// Storage is addressed as `num_blocks` fixed-size blocks, where a block is
/// the erase unit of the medium. Reads and writes address a byte range
/// within one block; erases reset a whole block.
///
/// Devices may require `offset` and the buffer length to be multiples of
/// their minimum read/write size. Callers that honor a minimum IO size are
/// expected to issue only aligned accesses; backends in this crate accept
/// arbitrary ranges.
pub trait BlockDev {
    /// Reads `buf.len()` bytes into `buf` from `offset` within `block`.
    fn read(&mut self, block: u16, offset: u32, buf: &mut [u8]) -> DevResult;

    /// Writes `data` at `offset` within `block`.
    ///
    /// Written regions must previously have been erased; the device is
    /// responsible for wear-leveling.
    fn write(&mut self, block: u16, offset: u32, data: &[u8]) -> DevResult;

    /// Erases a whole block. Erased regions read back as zero.
    fn erase(&mut self, block: u16) -> DevResult;
}

/// Extension helpers for BlockDev.
///
/// Provides read/write helpers for primitive little-endian values, mostly
/// useful for tooling and tests that inspect raw on-device structures.
pub trait BlockDevExt: BlockDev {
    // Implements read/write helpers for primitive types (u16, u32, u64)
    blockdev_impl_primitive_rw!(u16, u32, u64);
}

impl<T: BlockDev + ?Sized> BlockDevExt for T {}
