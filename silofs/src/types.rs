// SPDX-License-Identifier: MIT

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of independent byte streams interleaved within an object.
pub const NUM_STREAMS: usize = 16;

/// Pseudo-stream selecting all streams mixed in write order when opening
/// an object for reading.
pub const WILDCARD_STREAM: u8 = u8::MAX;

/// Reserved object ID; never assigned to a stored object.
pub const INVALID_OBJECT_ID: u16 = 0;

pub(crate) const INVALID_BLOCK: u16 = u16::MAX;

/// Reserved region at the end of every v2 block holding the footer magic
/// and the block summary seek chunk.
pub(crate) const BLOCK_FOOTER_LENGTH: u32 = 128;

// Chunk types. Data chunks carry the stream number in their low nibble.
pub(crate) const CHUNK_TYPE_DATA_FIRST: u8 = 0xd0;
pub(crate) const CHUNK_TYPE_DATA_LAST: u8 = 0xdf;
pub(crate) const CHUNK_TYPE_END: u8 = 0xed;
pub(crate) const CHUNK_TYPE_OFFSET: u8 = 0x3e;
pub(crate) const CHUNK_TYPE_SEEK: u8 = 0x5e;
pub(crate) const CHUNK_TYPE_INVALID_ZERO: u8 = 0x00;
pub(crate) const CHUNK_TYPE_INVALID_ONE: u8 = 0xff;

pub(crate) const CHUNK_MAX_LENGTH: u32 = 0x00ff_ffff;

// Block magic values
pub(crate) const HEADER_MAGIC_V1: [u8; 4] = *b"AFS1";
pub(crate) const HEADER_MAGIC_V2: [u8; 4] = *b"AFS2";
pub(crate) const FOOTER_MAGIC: [u8; 4] = *b"afs2";

/// Geometry of the backing storage.
///
/// `block_size` is the erase unit (should match the allocation unit of the
/// medium, typically 4 MiB); `min_read_write_size` should match the medium's
/// IO block size (typically 512 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// The size of a block in bytes.
    pub block_size: u32,
    /// The total number of blocks.
    pub num_blocks: u16,
    /// Equal-sized partitions per block used for intra-block seek.
    pub sub_blocks_per_block: u32,
    /// The minimum read/write size in bytes.
    pub min_read_write_size: u32,
}

impl Geometry {
    pub(crate) fn validate(&self) {
        assert!(self.num_blocks > 0 && self.num_blocks < INVALID_BLOCK);
        assert!(self.min_read_write_size >= BLOCK_FOOTER_LENGTH);
        assert!(self.block_size > 0 && self.block_size % self.min_read_write_size == 0);
        assert!(self.sub_blocks_per_block > 0 && self.block_size % self.sub_blocks_per_block == 0);
        assert!(self.sub_block_size() >= BLOCK_FOOTER_LENGTH);
    }

    #[inline]
    pub(crate) fn sub_block_size(&self) -> u32 {
        self.block_size / self.sub_blocks_per_block
    }

    /// End of the writable body of a v2 block.
    #[inline]
    pub(crate) fn body_end(&self) -> u32 {
        self.block_size - BLOCK_FOOTER_LENGTH
    }
}

bitflags! {
    /// Bitmask selecting streams for size queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamMask: u16 {
        const ALL = 0xffff;
    }
}

impl StreamMask {
    /// Mask selecting a single stream.
    pub fn stream(stream: u8) -> Self {
        assert!((stream as usize) < NUM_STREAMS);
        Self::from_bits_retain(1 << stream)
    }

    #[inline]
    pub(crate) fn contains_stream(&self, stream: u8) -> bool {
        self.bits() & (1 << stream) != 0
    }
}

/// Position within the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Position {
    /// The physical block index
    pub block: u16,
    /// The offset within the block
    pub offset: u32,
}

// On-disk block header type
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub(crate) struct BlockHeader {
    /// Magic value
    pub magic: [u8; 4],
    /// The object ID which is stored in this block
    pub object_id: u16,
    /// The block index of the object stored in this block
    pub object_block_index: u16,
}

impl BlockHeader {
    pub(crate) const SIZE: u32 = core::mem::size_of::<Self>() as u32;

    /// Returns `Some(is_v2)` for a valid header, `None` otherwise.
    pub(crate) fn version(&self) -> Option<bool> {
        let magic = self.magic;
        match magic {
            HEADER_MAGIC_V1 => Some(false),
            HEADER_MAGIC_V2 => Some(true),
            _ => None,
        }
    }

    pub(crate) fn is_all_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
}

// On-disk chunk header type
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub(crate) struct ChunkHeader {
    /// The upper 8 bits are the type and the lower 24 are the length of
    /// data which follows the header
    pub tag: u32,
}

impl ChunkHeader {
    pub(crate) const SIZE: u32 = core::mem::size_of::<Self>() as u32;

    pub(crate) fn new(chunk_type: u8, length: u32) -> Self {
        Self {
            tag: ((chunk_type as u32) << 24) | (length & CHUNK_MAX_LENGTH),
        }
    }

    #[inline]
    pub(crate) fn chunk_type(&self) -> u8 {
        (self.tag >> 24) as u8
    }

    #[inline]
    pub(crate) fn length(&self) -> u32 {
        self.tag & CHUNK_MAX_LENGTH
    }
}

/// Per-stream absolute byte offsets as of the start of a block, scattered
/// from an offset chunk.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OffsetData {
    pub offsets: [u64; NUM_STREAMS],
}

/// Per-stream byte offsets within the current block, scattered from a
/// seek chunk.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SeekData {
    pub offsets: [u32; NUM_STREAMS],
}

const OFFSET_ENTRY_MASK: u64 = 0x0fff_ffff_ffff_ffff;
const SEEK_ENTRY_MASK: u32 = 0x0fff_ffff;

#[inline]
pub(crate) fn offset_entry(stream: u8, offset: u64) -> u64 {
    ((stream as u64) << 60) | (offset & OFFSET_ENTRY_MASK)
}

#[inline]
pub(crate) fn offset_entry_stream(value: u64) -> u8 {
    (value >> 60) as u8
}

#[inline]
pub(crate) fn offset_entry_offset(value: u64) -> u64 {
    value & OFFSET_ENTRY_MASK
}

#[inline]
pub(crate) fn seek_entry(stream: u8, offset: u32) -> u32 {
    ((stream as u32) << 28) | (offset & SEEK_ENTRY_MASK)
}

#[inline]
pub(crate) fn seek_entry_stream(value: u32) -> u8 {
    (value >> 28) as u8
}

#[inline]
pub(crate) fn seek_entry_offset(value: u32) -> u32 {
    value & SEEK_ENTRY_MASK
}
