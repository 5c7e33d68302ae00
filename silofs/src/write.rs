// SPDX-License-Identifier: MIT

use log::{debug, error};
use siloio::BlockDev;
use zerocopy::IntoBytes;

use crate::errors::*;
use crate::object::Object;
use crate::storage;
use crate::store::Ctx;
use crate::types::*;
use crate::utils::{align_down, align_up};

/// Calculates the remaining space within the block body.
#[inline]
fn remaining_block_space(geom: &Geometry, obj: &Object) -> u32 {
    geom.body_end() - obj.cache.write_position()
}

/// Calculates the remaining space within the sub-block.
#[inline]
fn remaining_sub_block_space(geom: &Geometry, obj: &Object) -> u32 {
    let write_pos = obj.cache.write_position();
    let sub_block_size = geom.sub_block_size();
    (align_up(write_pos as u64, sub_block_size as u64) - write_pos as u64) as u32
}

/// Flushes the current write buffer, acquiring a block first when the
/// buffer sits at the start of a not-yet-allocated block.
fn flush_write_buffer<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    pad: bool,
) -> StoreResult<()> {
    if obj.cache.offset == 0 {
        // We are writing at the start of the block, so we need to find a
        // block to write to
        assert_eq!(obj.cache.block, INVALID_BLOCK);
        assert!(obj.write.next_block_index > 0);
        let block_index = obj.write.next_block_index - 1;
        let Some((block, is_erased)) = ctx.lut.acquire_block(obj.object_id, block_index) else {
            error!("Could not find free block");
            return Err(StoreError::Full);
        };
        obj.cache.block = block;
        if !is_erased {
            storage::erase(ctx.dev, ctx.geom, ctx.cache, block)?;
        }
    } else {
        assert_ne!(obj.cache.block, INVALID_BLOCK);
    }
    debug!(
        "Flushing cache (block={}, offset=0x{:x}, length={})",
        obj.cache.block, obj.cache.offset, obj.cache.len
    );
    let (block, offset, length) = storage::write_cache(ctx.dev, ctx.geom, &mut obj.cache, pad)?;
    // Invalidate the store's read cache
    ctx.cache.invalidate(block, offset, length);
    Ok(())
}

/// Writes a seek chunk into the cache.
fn cache_write_seek_chunk(obj: &mut Object) {
    // Get the size of the seek chunk
    let num_offsets = obj.block_offset.iter().filter(|offset| **offset != 0).count() as u32;

    // Calculate the length of the data that'll be written to the disk
    let data_length = num_offsets * size_of::<u32>() as u32;

    // Write the seek chunk header
    debug!(
        "Writing seek chunk header into the cache (offset=0x{:x})",
        obj.cache.offset
    );
    let header = ChunkHeader::new(CHUNK_TYPE_SEEK, data_length);
    obj.cache.push(header.as_bytes());

    // Write the seek chunk offsets
    for stream in 0..NUM_STREAMS {
        let offset = obj.block_offset[stream];
        if offset == 0 {
            continue;
        }
        debug!(
            "Writing seek chunk offset into the cache (offset=0x{:x})",
            obj.cache.offset
        );
        assert_eq!(seek_entry_stream(offset), 0);
        let value = seek_entry(stream as u8, offset);
        obj.cache.push(&value.to_le_bytes());
    }
}

/// Helper function to write the footer at the end of the current block.
fn write_footer<D: BlockDev>(ctx: &mut Ctx<'_, D>, obj: &mut Object) -> StoreResult<()> {
    debug!(
        "Writing footer (cache.offset=0x{:x}, cache.length={})",
        obj.cache.offset, obj.cache.len
    );
    let footer_offset = ctx.geom.body_end();
    assert!(obj.cache.offset + obj.cache.len <= footer_offset);
    if obj.cache.offset + obj.cache.size() < ctx.geom.block_size {
        // The current cache doesn't go to the end of the block, so flush it
        // to disk
        assert!(obj.cache.offset + obj.cache.size() <= footer_offset);
        flush_write_buffer(ctx, obj, true)?;
        // Advance to the end of the block
        assert_ne!(obj.cache.block, INVALID_BLOCK);
        assert_eq!(obj.cache.len, 0);
        obj.cache.offset =
            align_down(footer_offset as u64, ctx.geom.min_read_write_size as u64) as u32;
    }

    // Pad the cache with 0's to advance it to the offset of the footer (if
    // necessary)
    let cache_buffer_offset = footer_offset - obj.cache.offset;
    if obj.cache.len < cache_buffer_offset {
        debug!(
            "Padding cache (cache_buffer_offset=0x{:x}, cache.length=0x{:x})",
            cache_buffer_offset, obj.cache.len
        );
        obj.cache.push_zeros(cache_buffer_offset - obj.cache.len);
    } else {
        assert_eq!(obj.cache.len, cache_buffer_offset);
    }

    // Write the footer into the cache
    debug!(
        "Writing block footer into the cache (offset=0x{:x})",
        obj.cache.offset
    );
    obj.cache.push(&FOOTER_MAGIC);

    // Write the seek chunk
    cache_write_seek_chunk(obj);

    // Flush the buffer
    flush_write_buffer(ctx, obj, true)
}

/// Helper function to write data for an object.
fn write_data<D: BlockDev>(ctx: &mut Ctx<'_, D>, obj: &mut Object, data: &[u8]) -> StoreResult<()> {
    debug!(
        "Writing data (length={}, cache.offset=0x{:x}, cache.length={})",
        data.len(),
        obj.cache.offset,
        obj.cache.len
    );
    let mut done = 0usize;
    while done < data.len() {
        // Write as much as we can into the buffer
        let buffer_space = (obj.cache.size() - obj.cache.len) as usize;
        let write_size = (data.len() - done).min(buffer_space);
        obj.cache.push(&data[done..done + write_size]);
        done += write_size;
        if obj.cache.len == obj.cache.size() {
            // The buffer is full so flush it to disk
            flush_write_buffer(ctx, obj, false)?;
        }
    }
    Ok(())
}

/// Writes the block header, and for every block after the first, the offset
/// chunk recording each stream's absolute offset as of this block.
fn write_block_header<D: BlockDev>(ctx: &mut Ctx<'_, D>, obj: &mut Object) -> StoreResult<()> {
    assert_ne!(obj.object_id, INVALID_OBJECT_ID);

    let object_block_index = obj.write.next_block_index;
    debug!(
        "Writing block header (object_id={}, object_block_index={object_block_index})",
        obj.object_id
    );
    let block_header = BlockHeader {
        magic: HEADER_MAGIC_V2,
        object_id: obj.object_id,
        object_block_index,
    };
    obj.write.next_block_index += 1;
    write_data(ctx, obj, block_header.as_bytes())?;

    if object_block_index == 0 {
        // This is the first block, so don't need an offset chunk
        return Ok(());
    }

    // Get the size of the offset chunk
    let mut num_offsets = 0u32;
    for stream in 0..NUM_STREAMS {
        let offset = obj.object_offset[stream];
        if offset != 0 {
            assert_eq!(offset_entry_stream(offset), 0);
            num_offsets += 1;
        }
    }
    let offset_data_length = num_offsets * size_of::<u64>() as u32;

    // Write the offset chunk header
    debug!(
        "Writing offset chunk header into the cache (offset=0x{:x}, num={})",
        obj.cache.offset, num_offsets
    );
    let header = ChunkHeader::new(CHUNK_TYPE_OFFSET, offset_data_length);
    obj.cache.push(header.as_bytes());

    // Write the offset chunk values
    for stream in 0..NUM_STREAMS {
        let offset = obj.object_offset[stream];
        if offset != 0 {
            let value = offset_entry(stream as u8, offset);
            obj.cache.push(&value.to_le_bytes());
        }
    }

    Ok(())
}

/// Helper function to prepare for writing at least `length` bytes of data.
/// Returns the usable space at the resulting position.
fn prepare_for_write<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    length: u32,
) -> StoreResult<u32> {
    debug!(
        "Preparing for write (length={}, position=0x{:x})",
        length,
        obj.cache.write_position()
    );

    // Check if we're at the end of the block
    let block_space = remaining_block_space(ctx.geom, obj);
    if block_space < length {
        debug!("Not enough space left in block ({block_space})");
        // Not enough room left in this block, so write out the footer and
        // advance to the next block
        write_footer(ctx, obj)?;
        // Clear our block offsets
        obj.block_offset = [0; NUM_STREAMS];
        // Reset the cache for the start of next block
        obj.cache.reset();
    }

    // Check if we're at the start of a block
    if obj.cache.write_position() == 0 {
        // This is the first write in a block, so write the header
        write_block_header(ctx, obj)?;
    }

    // Check if we're at the end of the sub-block
    let sub_block_space = remaining_sub_block_space(ctx.geom, obj);
    if sub_block_space < length {
        debug!("Not enough space left in sub-block ({sub_block_space})");
        // Not enough room left in this sub-block, so advance to the next
        // sub-block and write out a seek chunk
        // Pad the rest of the sub-block
        obj.cache.push_zeros(sub_block_space);
        // Check if we're at the end of the cache and need to flush it
        if obj.cache.len == obj.cache.size() {
            // No space left in the cache, so need to flush it
            flush_write_buffer(ctx, obj, false)?;
        }
        // Write the seek chunk
        cache_write_seek_chunk(obj);
    }

    let write_space = remaining_block_space(ctx.geom, obj).min(remaining_sub_block_space(ctx.geom, obj));
    assert!(write_space > 0);
    Ok(write_space)
}

/// Writes a single data chunk, returning the number of payload bytes
/// consumed so the caller can loop.
pub(crate) fn process<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    stream: u8,
    data: &[u8],
) -> StoreResult<u32> {
    // Make sure we can write the chunk header and at least 1 byte of data in
    // the current block
    let write_space = prepare_for_write(ctx, obj, ChunkHeader::SIZE + 1)?;

    // Write the chunk header
    let chunk_length = (data.len() as u64)
        .min((write_space - ChunkHeader::SIZE) as u64)
        .min(CHUNK_MAX_LENGTH as u64) as u32;
    debug!("Writing data chunk (length={chunk_length})");
    let chunk_header = ChunkHeader::new(CHUNK_TYPE_DATA_FIRST | stream, chunk_length);
    write_data(ctx, obj, chunk_header.as_bytes())?;

    // Write the chunk data
    write_data(ctx, obj, &data[..chunk_length as usize])?;
    obj.object_offset[stream as usize] += chunk_length as u64;
    obj.block_offset[stream as usize] += chunk_length;
    Ok(chunk_length)
}

/// Finalizes the write side of an object with an end chunk and the footer
/// of its last block.
pub(crate) fn finish<D: BlockDev>(ctx: &mut Ctx<'_, D>, obj: &mut Object) -> StoreResult<()> {
    // Make sure we can write the end chunk header in the current block
    prepare_for_write(ctx, obj, ChunkHeader::SIZE)?;

    // Write the end chunk header
    let chunk_header = ChunkHeader::new(CHUNK_TYPE_END, 0);
    write_data(ctx, obj, chunk_header.as_bytes())?;

    // Write the block footer
    write_footer(ctx, obj)
}
