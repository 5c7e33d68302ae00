// SPDX-License-Identifier: MIT

use crate::cache::Cache;
use crate::types::{BLOCK_FOOTER_LENGTH, BlockHeader, ChunkHeader, Geometry, NUM_STREAMS};

/// Configuration used when creating or opening objects.
#[derive(Debug, Clone, Copy)]
pub struct ObjectConfig {
    /// Size of the buffer allocated for the object.
    ///
    /// Must be a multiple of the minimum read/write size and either divide
    /// the sub-block size evenly or be a multiple of it.
    pub buffer_size: u32,
}

pub(crate) fn validate_buffer_size(geom: &Geometry, buffer_size: u32) {
    assert!(buffer_size >= BlockHeader::SIZE + ChunkHeader::SIZE);
    assert!(buffer_size >= BLOCK_FOOTER_LENGTH);
    assert!(buffer_size >= geom.min_read_write_size);
    let sub_block_size = geom.sub_block_size();
    if buffer_size > sub_block_size {
        assert_eq!(buffer_size % sub_block_size, 0);
    } else {
        assert_eq!(sub_block_size % buffer_size, 0);
    }
    assert_eq!(buffer_size % geom.min_read_write_size, 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjState {
    Invalid,
    Reading,
    Writing,
}

#[derive(Debug, Default)]
pub(crate) struct ReadState {
    /// The current read offset for the underlying storage
    pub storage_offset: u64,
    /// The remaining bytes in the current chunk we're reading
    pub data_chunk_length: u32,
    /// The stream the object was opened to read
    pub stream: u8,
    /// The current stream being read (for wildcard streams)
    pub current_stream: u8,
}

#[derive(Debug, Default)]
pub(crate) struct WriteState {
    /// The index of the next block within the object
    pub next_block_index: u16,
}

/// In-memory context for an open object.
///
/// Obtained from [`Store::create`](crate::Store::create) or
/// [`Store::open`](crate::Store::open) and passed back into the store for
/// every operation. The object owns its IO buffer for the lifetime of the
/// handle.
#[derive(Debug)]
pub struct Object {
    pub(crate) state: ObjState,
    pub(crate) object_id: u16,
    /// The current offset within the object of each stream
    pub(crate) object_offset: [u64; NUM_STREAMS],
    /// The current offset within the block of each stream
    pub(crate) block_offset: [u32; NUM_STREAMS],
    pub(crate) read: ReadState,
    pub(crate) write: WriteState,
    pub(crate) cache: Cache,
}

impl Object {
    /// The ID of the object.
    pub fn id(&self) -> u16 {
        self.object_id
    }

    pub(crate) fn new_writer(object_id: u16, buffer_size: u32) -> Self {
        Self {
            state: ObjState::Writing,
            object_id,
            object_offset: [0; NUM_STREAMS],
            block_offset: [0; NUM_STREAMS],
            read: ReadState::default(),
            write: WriteState::default(),
            cache: Cache::new(buffer_size),
        }
    }

    pub(crate) fn new_reader(object_id: u16, stream: u8, buffer_size: u32) -> Self {
        Self {
            state: ObjState::Reading,
            object_id,
            object_offset: [0; NUM_STREAMS],
            block_offset: [0; NUM_STREAMS],
            read: ReadState {
                stream,
                ..ReadState::default()
            },
            write: WriteState::default(),
            cache: Cache::new(buffer_size),
        }
    }
}

/// A saved read position within an object.
///
/// Saving and restoring does not touch the medium; a position stays valid
/// across close/reopen as long as the underlying storage is unchanged.
#[derive(Debug, Clone)]
pub struct ReadPosition {
    pub(crate) object_offset: [u64; NUM_STREAMS],
    pub(crate) block_offset: [u32; NUM_STREAMS],
    pub(crate) storage_offset: u64,
    pub(crate) data_chunk_length: u32,
    pub(crate) current_stream: u8,
}
