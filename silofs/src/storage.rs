// SPDX-License-Identifier: MIT

use log::{error, warn};
use siloio::BlockDev;
use zerocopy::FromBytes;

use crate::cache::Cache;
use crate::errors::*;
use crate::types::*;
use crate::utils::{align_down, align_up};

fn populate_cache<D: BlockDev>(
    dev: &mut D,
    cache: &mut Cache,
    position: &Position,
) -> StoreResult<()> {
    cache.block = position.block;
    cache.offset = align_down(position.offset as u64, cache.size() as u64) as u32;
    dev.read(cache.block, cache.offset, &mut cache.buf)?;
    cache.len = cache.size();
    Ok(())
}

/// Reads data from storage through the given cache window, advancing
/// `position` past what was read.
pub(crate) fn read_data<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    position: &mut Position,
    buf: &mut [u8],
) -> StoreResult<()> {
    assert_ne!(position.block, INVALID_BLOCK);
    assert!(position.offset as u64 + buf.len() as u64 <= geom.block_size as u64);
    let mut done = 0usize;
    while done < buf.len() {
        if !cache.contains(position) {
            // Populate the cache for the requested position
            populate_cache(dev, cache, position)?;
        }

        // Read what we can from the cache
        let read_length = cache.read(position, &mut buf[done..]) as usize;
        debug_assert!(read_length > 0);

        // Advance our pointers
        position.offset += read_length as u32;
        done += read_length;
    }
    Ok(())
}

/// Reads a block header from storage
pub(crate) fn read_block_header<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    position: &mut Position,
) -> StoreResult<BlockHeader> {
    let mut bytes = [0u8; BlockHeader::SIZE as usize];
    read_data(dev, geom, cache, position, &mut bytes)?;
    Ok(BlockHeader::read_from_bytes(&bytes).unwrap())
}

/// Reads a chunk header from storage
pub(crate) fn read_chunk_header<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    position: &mut Position,
) -> StoreResult<ChunkHeader> {
    let mut bytes = [0u8; ChunkHeader::SIZE as usize];
    read_data(dev, geom, cache, position, &mut bytes)?;
    Ok(ChunkHeader::read_from_bytes(&bytes).unwrap())
}

fn read_seek_chunk<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    position: &mut Position,
) -> StoreResult<Option<SeekData>> {
    // Read the seek chunk header
    let header = read_chunk_header(dev, geom, cache, position)?;
    let tag = header.tag;

    // Validate the seek chunk data length
    let data_length = header.length();
    let num_entries = data_length / size_of::<u32>() as u32;
    if header.chunk_type() != CHUNK_TYPE_SEEK {
        error!("Invalid seek chunk (0x{tag:08x})");
        return Ok(None);
    } else if data_length > geom.block_size - position.offset {
        // Seek chunk can't be bigger than the remaining space in the block
        error!("Invalid seek chunk (0x{tag:08x})");
        return Ok(None);
    } else if data_length % size_of::<u32>() as u32 != 0 {
        // Length should be a multiple of the size of the entries (4 bytes)
        error!("Invalid seek chunk (0x{tag:08x})");
        return Ok(None);
    } else if num_entries as usize > NUM_STREAMS {
        // Invalid number of entries
        error!("Invalid seek chunk (0x{tag:08x})");
        return Ok(None);
    }

    // Read the data one value at a time into the result offsets. The reading
    // is cached (doesn't actually hit the device) in practice so this isn't
    // as inefficient as it might seem and makes the logic a bit simpler.
    let mut data = SeekData::default();
    for _ in 0..num_entries {
        let mut bytes = [0u8; size_of::<u32>()];
        read_data(dev, geom, cache, position, &mut bytes)?;
        let value = u32::from_le_bytes(bytes);
        let stream = seek_entry_stream(value);
        if stream as usize >= NUM_STREAMS {
            error!("Invalid stream ({stream})");
            return Ok(None);
        } else if data.offsets[stream as usize] != 0 {
            error!("Duplicate stream ({stream})");
            return Ok(None);
        }
        data.offsets[stream as usize] = seek_entry_offset(value);
    }

    Ok(Some(data))
}

/// Reads the offset chunk which follows the header of `block`.
///
/// Returns `Ok(None)` when the record is missing or malformed; the caller
/// treats the block as lacking offset data.
pub(crate) fn read_offset_data<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    block: u16,
) -> StoreResult<Option<OffsetData>> {
    // Create a read pointer
    let mut position = Position { block, offset: 0 };

    // Read the block header for validation
    let block_header = read_block_header(dev, geom, cache, &mut position)?;
    assert!(block_header.version().is_some());

    // Read the offset chunk header
    let header = read_chunk_header(dev, geom, cache, &mut position)?;
    let tag = header.tag;

    // Validate the offset chunk header
    if header.chunk_type() != CHUNK_TYPE_OFFSET {
        // There must not be any data in this block since the offset chunk
        // wasn't written
        warn!("Invalid offset chunk (0x{tag:08x})");
        return Ok(None);
    }
    let data_length = header.length();
    let num_streams = data_length / size_of::<u64>() as u32;
    if data_length % size_of::<u64>() as u32 != 0 || num_streams as usize > NUM_STREAMS {
        error!("Invalid number of streams ({num_streams})");
        return Ok(None);
    }

    // Read the data one value at a time into the result offsets
    let mut data = OffsetData::default();
    for _ in 0..num_streams {
        let mut bytes = [0u8; size_of::<u64>()];
        read_data(dev, geom, cache, &mut position, &mut bytes)?;
        let value = u64::from_le_bytes(bytes);
        let stream = offset_entry_stream(value);
        if stream as usize >= NUM_STREAMS {
            error!("Invalid stream ({stream})");
            return Ok(None);
        } else if data.offsets[stream as usize] != 0 {
            error!("Duplicate stream ({stream})");
            return Ok(None);
        }
        data.offsets[stream as usize] = offset_entry_offset(value);
    }
    Ok(Some(data))
}

/// Reads the footer of `block` and returns its seek chunk data.
pub(crate) fn read_footer_seek_data<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    block: u16,
) -> StoreResult<Option<SeekData>> {
    // Create a read pointer
    let mut position = Position {
        block,
        offset: geom.block_size - BLOCK_FOOTER_LENGTH,
    };

    // Read the footer magic for validation
    let mut magic = [0u8; 4];
    read_data(dev, geom, cache, &mut position, &mut magic)?;
    if magic != FOOTER_MAGIC {
        return Ok(None);
    }

    // Read the seek chunk
    read_seek_chunk(dev, geom, cache, &mut position)
}

/// Reads the seek chunk data from the start of a sub-block.
pub(crate) fn read_seek_data<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    block: u16,
    sub_block_index: u32,
) -> StoreResult<Option<SeekData>> {
    if sub_block_index == 0 {
        // The first sub-block has all offsets of 0
        return Ok(Some(SeekData::default()));
    } else if sub_block_index == geom.sub_blocks_per_block - 1 {
        // The last sub-block has the offsets within the footer
        return read_footer_seek_data(dev, geom, cache, block);
    }
    let mut position = Position {
        block,
        offset: sub_block_index * geom.sub_block_size(),
    };
    read_seek_chunk(dev, geom, cache, &mut position)
}

/// Writes buffered data out to storage, padding up to the minimum write
/// size when `pad` is set. Returns the written region so the caller can
/// invalidate any overlapping read cache.
pub(crate) fn write_cache<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    pad: bool,
) -> StoreResult<(u16, u32, u32)> {
    // Pad what we're writing up to the minimum write size
    let aligned_length = align_up(cache.len as u64, geom.min_read_write_size as u64) as u32;
    if aligned_length > cache.len {
        assert!(pad);
        assert!(aligned_length <= cache.size());
        cache.buf[cache.len as usize..aligned_length as usize].fill(0);
    }
    assert!(cache.offset + aligned_length <= geom.block_size);

    // Write the data
    dev.write(cache.block, cache.offset, &cache.buf[..aligned_length as usize])?;
    let written = (cache.block, cache.offset, aligned_length);

    // Advance the cache forward
    cache.offset += aligned_length;
    cache.len = 0;
    assert!(cache.offset <= geom.block_size);
    if cache.offset == geom.block_size {
        // No more space in the current block or we added padding, so advance
        // to the next one
        cache.block = INVALID_BLOCK;
        cache.offset = 0;
    }
    Ok(written)
}

/// Erases a block of storage and drops any cached view of it.
pub(crate) fn erase<D: BlockDev>(
    dev: &mut D,
    geom: &Geometry,
    cache: &mut Cache,
    block: u16,
) -> StoreResult<()> {
    dev.erase(block)?;
    cache.invalidate(block, 0, geom.block_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use siloio::MemBlockDev;

    const GEOM: Geometry = Geometry {
        block_size: 4096,
        num_blocks: 4,
        sub_blocks_per_block: 8,
        min_read_write_size: 512,
    };

    #[test]
    fn test_read_data_spans_cache_refills() {
        let mut dev = MemBlockDev::new(GEOM.block_size, GEOM.num_blocks);
        let pattern: alloc::vec::Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        dev.write(1, 0, &pattern).unwrap();

        let mut cache = Cache::new(GEOM.min_read_write_size);
        let mut position = Position {
            block: 1,
            offset: 100,
        };
        let mut buf = [0u8; 1000];
        read_data(&mut dev, &GEOM, &mut cache, &mut position, &mut buf).unwrap();
        assert_eq!(position.offset, 1100);
        assert_eq!(&buf[..], &pattern[100..1100]);
    }

    #[test]
    fn test_write_cache_pads_and_advances() {
        let mut dev = MemBlockDev::new(GEOM.block_size, GEOM.num_blocks);
        let mut cache = Cache::new(1024);
        cache.block = 0;
        cache.offset = 0;
        cache.push(&[0xAB; 100]);

        write_cache(&mut dev, &GEOM, &mut cache, true).unwrap();
        assert_eq!(cache.offset, 512);
        assert_eq!(cache.len, 0);
        assert_eq!(&dev.bytes()[..100], &[0xAB; 100]);
        assert_eq!(&dev.bytes()[100..512], &[0u8; 412]);
    }

    #[test]
    fn test_malformed_seek_chunk_degrades() {
        let mut dev = MemBlockDev::new(GEOM.block_size, GEOM.num_blocks);
        // Footer magic followed by a seek chunk with a bad tag
        let footer_offset = GEOM.block_size - BLOCK_FOOTER_LENGTH;
        let mut footer = [0u8; 128];
        footer[..4].copy_from_slice(&FOOTER_MAGIC);
        footer[4..8].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        dev.write(0, footer_offset, &footer).unwrap();

        let mut cache = Cache::new(GEOM.min_read_write_size);
        let data = read_footer_seek_data(&mut dev, &GEOM, &mut cache, 0).unwrap();
        assert!(data.is_none());

        // Missing footer magic entirely
        let data = read_footer_seek_data(&mut dev, &GEOM, &mut cache, 1).unwrap();
        assert!(data.is_none());
    }
}
