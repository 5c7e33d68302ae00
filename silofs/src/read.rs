// SPDX-License-Identifier: MIT

use log::{debug, error};
use siloio::BlockDev;

use crate::errors::*;
use crate::object::Object;
use crate::storage;
use crate::store::Ctx;
use crate::types::*;
use crate::utils::align_up;

fn process_block_header<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    position: &mut Position,
) -> StoreResult<()> {
    // Read the block header
    let header = storage::read_block_header(ctx.dev, ctx.geom, &mut obj.cache, position)?;

    // Validate the header as a sanity check
    let object_id = header.object_id;
    let object_block_index = header.object_block_index;
    assert!(header.version().is_some());
    assert_eq!(object_id, obj.object_id);
    assert_eq!(
        object_block_index as u64,
        obj.read.storage_offset / ctx.geom.block_size as u64
    );

    // Advance past the header
    obj.read.storage_offset += BlockHeader::SIZE as u64;
    debug!("Read block header");
    Ok(())
}

fn process_read_data(obj: &mut Object, max_length: u32) -> u32 {
    let chunk_read_length = obj.read.data_chunk_length.min(max_length);
    obj.read.data_chunk_length -= chunk_read_length;
    obj.read.storage_offset += chunk_read_length as u64;
    let stream = if obj.read.stream == WILDCARD_STREAM {
        obj.read.current_stream
    } else {
        obj.read.stream
    };
    obj.object_offset[stream as usize] += chunk_read_length as u64;
    obj.block_offset[stream as usize] += chunk_read_length;
    debug!("Read {chunk_read_length} bytes of data");
    chunk_read_length
}

/// Parses the chunk header at the current position and dispatches on its
/// type. Returns `(proceed, has_more)`: `proceed` says whether the step
/// should fall through to the region-alignment logic, `has_more` whether
/// further reads can make progress.
fn process_new_chunk<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    position: &mut Position,
    block_end: u32,
) -> StoreResult<(bool, bool)> {
    let header = storage::read_chunk_header(ctx.dev, ctx.geom, &mut obj.cache, position)?;
    let chunk_type = header.chunk_type();
    let chunk_length = header.length();
    debug!("Read chunk header (type=0x{chunk_type:x}, length={chunk_length})");

    // Check the chunk length
    let length_invalid = match chunk_type {
        CHUNK_TYPE_DATA_FIRST..=CHUNK_TYPE_DATA_LAST => position.offset + chunk_length > block_end,
        CHUNK_TYPE_OFFSET => chunk_length as usize > size_of::<u64>() * NUM_STREAMS,
        CHUNK_TYPE_SEEK => chunk_length as usize > size_of::<u32>() * NUM_STREAMS,
        CHUNK_TYPE_END => chunk_length > 0,
        _ => false,
    };
    if length_invalid {
        error!("Invalid length (type=0x{chunk_type:x}, length={chunk_length})");
        // Assume the storage got corrupted, so just bail
        return Ok((false, false));
    }

    // Process the chunk
    match chunk_type {
        CHUNK_TYPE_DATA_FIRST..=CHUNK_TYPE_DATA_LAST => {
            obj.read.storage_offset += ChunkHeader::SIZE as u64;
            let stream = chunk_type & 0xf;
            if obj.read.stream == WILDCARD_STREAM || stream == obj.read.stream {
                obj.read.data_chunk_length = chunk_length;
                obj.read.current_stream = stream;
            } else {
                // Skip over this chunk since it's a different stream
                obj.read.storage_offset += chunk_length as u64;
            }
            Ok((true, true))
        }
        CHUNK_TYPE_OFFSET | CHUNK_TYPE_SEEK => {
            // Skip over this chunk
            obj.read.storage_offset += (ChunkHeader::SIZE + chunk_length) as u64;
            Ok((true, true))
        }
        CHUNK_TYPE_END => {
            // Reached the end of the object - keep the context in this state
            // in case we try to read again
            Ok((false, false))
        }
        CHUNK_TYPE_INVALID_ZERO | CHUNK_TYPE_INVALID_ONE => {
            // No more chunks in this block, so move to the next block
            obj.read.storage_offset =
                align_up(obj.read.storage_offset, ctx.geom.block_size as u64);
            obj.block_offset = [0; NUM_STREAMS];
            Ok((false, true))
        }
        _ => {
            error!("Unexpected chunk type (0x{chunk_type:x})");
            // Assume the storage got corrupted, so just bail
            Ok((false, false))
        }
    }
}

/// Aligns the read offset up to the next region when the current one has no
/// room left for another chunk.
fn align_storage_offset<D: BlockDev>(ctx: &mut Ctx<'_, D>, obj: &mut Object, position: &Position) {
    let block_size = ctx.geom.block_size;
    let block_offset = (obj.read.storage_offset % block_size as u64) as u32;
    assert!(block_offset <= block_size);
    if ctx.lut.is_v2(position.block) {
        if ctx.geom.body_end() - block_offset < ChunkHeader::SIZE + 1 {
            // No more chunks or data in this block, so move to the next block
            debug!("No more chunks in current block");
            obj.read.storage_offset = align_up(obj.read.storage_offset, block_size as u64);
            obj.block_offset = [0; NUM_STREAMS];
        } else {
            let sub_block_size = ctx.geom.sub_block_size();
            let sub_block_offset = block_offset % sub_block_size;
            if sub_block_size - sub_block_offset < ChunkHeader::SIZE + 1 {
                // No more chunks or data in this sub-block, so align up to
                // the next sub-block
                debug!("No more chunks in current sub-block");
                obj.read.storage_offset =
                    align_up(obj.read.storage_offset, sub_block_size as u64);
            }
        }
    } else if block_size - block_offset < ChunkHeader::SIZE + 1 {
        // No more chunks or data in this block, so move to the next block
        debug!("No more chunks in current block");
        obj.read.storage_offset = align_up(obj.read.storage_offset, block_size as u64);
        obj.block_offset = [0; NUM_STREAMS];
    }
}

/// One read/seek step. Does exactly one of: consume the block header, copy
/// data bytes, parse a chunk header, or handle end-of-region. Returns
/// `(read_bytes, has_more)`; passing no destination advances the position
/// without touching the payload, which is how seek drives it.
pub(crate) fn process<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    data: Option<&mut [u8]>,
    max_length: u32,
) -> StoreResult<(u32, bool)> {
    let block_size = ctx.geom.block_size;
    let block_index = (obj.read.storage_offset / block_size as u64) as u16;
    let mut position = Position {
        block: ctx.lut.get_block(obj.object_id, block_index),
        offset: (obj.read.storage_offset % block_size as u64) as u32,
    };
    debug!(
        "Reading/seeking (index={}, block={}, offset=0x{:x})",
        block_index, position.block, position.offset
    );

    if position.block == INVALID_BLOCK && position.offset == 0 {
        // Writing got interrupted in the middle of the previous block, so
        // just bail
        return Ok((0, false));
    }
    assert_ne!(position.block, INVALID_BLOCK);
    let is_v2 = ctx.lut.is_v2(position.block);
    let block_end = block_size - if is_v2 { BLOCK_FOOTER_LENGTH } else { 0 };
    assert!(position.offset < block_end);

    let mut read_bytes = 0;
    if position.offset == 0 {
        // Process the block header
        process_block_header(ctx, obj, &mut position)?;
        return Ok((0, true));
    } else if obj.read.data_chunk_length > 0 {
        // We are within a data chunk, so read as much data as possible from
        // it
        read_bytes = process_read_data(obj, max_length);
        if read_bytes > 0 {
            if let Some(dst) = data {
                storage::read_data(
                    ctx.dev,
                    ctx.geom,
                    &mut obj.cache,
                    &mut position,
                    &mut dst[..read_bytes as usize],
                )?;
            }
        }
    } else {
        // We need to read a new chunk
        let (proceed, has_more) = process_new_chunk(ctx, obj, &mut position, block_end)?;
        if !proceed {
            return Ok((0, has_more));
        }
    }

    if obj.read.data_chunk_length > 0 {
        // More data to read in the current data chunk
        return Ok((read_bytes, true));
    }

    align_storage_offset(ctx, obj, &position);
    Ok((read_bytes, true))
}
