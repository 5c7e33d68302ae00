// SPDX-License-Identifier: MIT

use log::error;
use siloio::BlockDev;

use crate::errors::*;
use crate::object::Object;
use crate::storage;
use crate::store::Ctx;
use crate::types::*;
use crate::utils::{block_stream_offset, stream_offset};

const SEARCH_RESULT_NO_CHANGE: u16 = u16::MAX;

const MIN_DATA_OFFSET_FOR_DENSITY: u64 = 1024;
const DENSITY_MULTIPLIER: u64 = 1_000_000;
const DEFAULT_DENSITY: u64 = 980_000;
const MIN_DENSITY: u64 = 1_000;

/// Estimates the payload density (payload bytes per storage byte, scaled by
/// `DENSITY_MULTIPLIER`) from a known data point.
#[inline]
fn estimate_update_density(data_offset: u64, storage_offset: u64) -> u64 {
    if data_offset < MIN_DATA_OFFSET_FOR_DENSITY {
        // Not enough data to accurately calculate the density, so just
        // assume the default
        return DEFAULT_DENSITY;
    }
    let density = data_offset * DENSITY_MULTIPLIER / storage_offset;
    density.clamp(MIN_DENSITY, DENSITY_MULTIPLIER)
}

#[inline]
fn estimate_calculate_index(density: u64, target_offset: u64, region_size: u32) -> u64 {
    target_offset * DENSITY_MULTIPLIER / density / region_size as u64
}

fn get_offset_chunk_data<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    object_id: u16,
    block_index: u16,
) -> StoreResult<Option<OffsetData>> {
    let block = ctx.lut.get_block(object_id, block_index);
    if block == INVALID_BLOCK {
        return Ok(None);
    }
    storage::read_offset_data(ctx.dev, ctx.geom, ctx.cache, block)
}

/// Probes the recorded stream offset at the start of `block_index`.
///
/// Returns `u64::MAX` when the block has no usable offset chunk (an unclean
/// write), which makes the search treat it as above any target.
fn get_block_stream_offset<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &Object,
    block_index: u16,
) -> StoreResult<(u64, OffsetData)> {
    match get_offset_chunk_data(ctx, obj.object_id, block_index)? {
        Some(data) => Ok((stream_offset(&data.offsets, obj.read.stream), data)),
        None => Ok((u64::MAX, OffsetData::default())),
    }
}

/// Finds the highest block index whose recorded stream offset does not
/// exceed `target_offset`, starting from a density-based estimate.
fn search_block_index<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &Object,
    target_offset: u64,
) -> StoreResult<(u16, OffsetData)> {
    let block_size = ctx.geom.block_size;
    let current_index = (obj.read.storage_offset / block_size as u64) as u16;
    let max_index = ctx.lut.get_num_blocks(obj.object_id) - 1;
    let mut new_offsets = OffsetData::default();
    if current_index == max_index {
        // Can't go any higher, so assume we're already at the right index
        return Ok((SEARCH_RESULT_NO_CHANGE, new_offsets));
    }

    let mut density = estimate_update_density(
        stream_offset(&obj.object_offset, obj.read.stream),
        obj.read.storage_offset,
    );

    // Find an index which is above the target offset (ideally as close as
    // possible)
    let mut index = (estimate_calculate_index(density, target_offset, block_size) + 1)
        .min(max_index as u64) as u16;
    let mut prev_check_was_prev_index = false;
    let mut offset_data;
    loop {
        let (probe, data) = get_block_stream_offset(ctx, obj, index)?;
        offset_data = data;
        if probe > target_offset {
            // Found the index we're after for this loop
            if prev_check_was_prev_index {
                // We previously checked the previous index and it was lower,
                // so that was the target index
                index -= 1;
                let result = if index == current_index {
                    SEARCH_RESULT_NO_CHANGE
                } else {
                    index
                };
                return Ok((result, new_offsets));
            }
            break;
        }
        // Need to go higher
        new_offsets = offset_data;
        if index == max_index {
            // Can't go higher, so just bail
            return Ok((SEARCH_RESULT_NO_CHANGE, new_offsets));
        }
        density = estimate_update_density(
            stream_offset(&offset_data.offsets, obj.read.stream),
            index as u64 * block_size as u64,
        );
        let new_estimate = estimate_calculate_index(density, target_offset, block_size) + 1;
        index += 1;
        prev_check_was_prev_index = true;
        if new_estimate <= max_index as u64 && new_estimate > index as u64 {
            // Jump ahead to the new estimate instead
            index = new_estimate as u16;
            prev_check_was_prev_index = false;
        }
    }

    if index == current_index {
        // Can't go lower - should never happen
        error!("Failed to find block index ({current_index})");
        return Ok((SEARCH_RESULT_NO_CHANGE, new_offsets));
    }

    // Linearly loop down towards the current index
    loop {
        index -= 1;
        if index <= current_index {
            break;
        }
        let (probe, data) = get_block_stream_offset(ctx, obj, index)?;
        offset_data = data;
        if probe > target_offset {
            // Still need to go lower
            continue;
        }
        // Found the index which contains the target offset
        break;
    }

    if index == current_index {
        // Already on this index
        return Ok((SEARCH_RESULT_NO_CHANGE, new_offsets));
    }

    new_offsets = offset_data;
    Ok((index, new_offsets))
}

/// Probes the recorded within-block stream offset at the start of
/// sub-block `index` of the current block.
fn get_sub_block_offset<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &Object,
    index: u32,
) -> StoreResult<(u64, SeekData)> {
    let block_index = (obj.read.storage_offset / ctx.geom.block_size as u64) as u16;
    let block = ctx.lut.get_block(obj.object_id, block_index);
    match storage::read_seek_data(ctx.dev, ctx.geom, ctx.cache, block, index)? {
        Some(data) => Ok((block_stream_offset(&data.offsets, obj.read.stream), data)),
        None => Ok((u64::MAX, SeekData::default())),
    }
}

/// Sub-block counterpart of `search_block_index`. Sub-block density is
/// treated as uniform, so no density adaptation happens between probes.
fn search_sub_block_index<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &Object,
    target_offset: u64,
) -> StoreResult<(u32, SeekData)> {
    let sub_block_size = ctx.geom.sub_block_size();
    let current_index = (obj.read.storage_offset % ctx.geom.block_size as u64) as u32 / sub_block_size;
    let max_index = ctx.geom.sub_blocks_per_block - 1;
    let mut new_offsets = SeekData::default();
    if current_index == max_index {
        // Can't go any higher, so assume we're already at the right index
        return Ok((SEARCH_RESULT_NO_CHANGE as u32, new_offsets));
    }

    let density = estimate_update_density(
        stream_offset(&obj.object_offset, obj.read.stream),
        obj.read.storage_offset,
    );

    // Find an index which is above the target offset (ideally as close as
    // possible)
    let mut index = (estimate_calculate_index(density, target_offset, sub_block_size) + 1)
        .min(max_index as u64) as u32;
    let mut prev_check_was_prev_index = false;
    let mut seek_data;
    loop {
        let (probe, data) = get_sub_block_offset(ctx, obj, index)?;
        seek_data = data;
        if probe > target_offset {
            // Found the index we're after for this loop
            if prev_check_was_prev_index {
                // We previously checked the previous index and it was lower,
                // so that was the target index
                index -= 1;
                let result = if index == current_index {
                    SEARCH_RESULT_NO_CHANGE as u32
                } else {
                    index
                };
                return Ok((result, new_offsets));
            }
            break;
        }
        // Need to go higher
        new_offsets = seek_data;
        if index == max_index {
            // Can't go higher, so just bail
            return Ok((SEARCH_RESULT_NO_CHANGE as u32, new_offsets));
        }
        index += 1;
        prev_check_was_prev_index = true;
    }

    if index == current_index {
        // Can't go lower - should never happen
        error!("Failed to find sub-block index ({current_index})");
        return Ok((SEARCH_RESULT_NO_CHANGE as u32, new_offsets));
    }

    // Linearly loop down towards the current index
    loop {
        index -= 1;
        if index <= current_index {
            break;
        }
        let (probe, data) = get_sub_block_offset(ctx, obj, index)?;
        seek_data = data;
        if probe > target_offset {
            // Still need to go lower
            continue;
        }
        // Found the index which contains the target offset
        break;
    }

    if index == current_index {
        // Already on this index
        return Ok((SEARCH_RESULT_NO_CHANGE as u32, new_offsets));
    }

    new_offsets = seek_data;
    Ok((index, new_offsets))
}

/// Block-level fast-forward. Returns the remaining forward delta after
/// advancing to the best block.
pub(crate) fn to_block<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    offset: u64,
) -> StoreResult<u64> {
    let prev_stream_offset = stream_offset(&obj.object_offset, obj.read.stream);
    let target_stream_offset = prev_stream_offset + offset;
    let (new_index, new_offsets) = search_block_index(ctx, obj, target_stream_offset)?;
    if new_index == SEARCH_RESULT_NO_CHANGE {
        return Ok(offset);
    }

    // Advance to the new block
    obj.read.storage_offset = new_index as u64 * ctx.geom.block_size as u64;
    obj.read.data_chunk_length = 0;
    obj.object_offset = new_offsets.offsets;
    obj.block_offset = [0; NUM_STREAMS];
    let amount_moved = stream_offset(&new_offsets.offsets, obj.read.stream) - prev_stream_offset;
    assert!(amount_moved <= offset);
    Ok(offset - amount_moved)
}

/// Sub-block-level fast-forward within the current block (v2 blocks only).
pub(crate) fn to_sub_block<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    obj: &mut Object,
    offset: u64,
) -> StoreResult<u64> {
    let block_index = (obj.read.storage_offset / ctx.geom.block_size as u64) as u16;
    let block = ctx.lut.get_block(obj.object_id, block_index);
    assert_ne!(block, INVALID_BLOCK);
    if !ctx.lut.is_v2(block) {
        // No sub-blocks
        return Ok(offset);
    }

    let prev_block_offset = block_stream_offset(&obj.block_offset, obj.read.stream);
    let target_block_offset = prev_block_offset + offset;
    let (new_index, new_offsets) = search_sub_block_index(ctx, obj, target_block_offset)?;
    if new_index == SEARCH_RESULT_NO_CHANGE as u32 {
        return Ok(offset);
    }

    // Advance to the new sub-block
    let sub_block_size = ctx.geom.sub_block_size();
    obj.read.storage_offset = block_index as u64 * ctx.geom.block_size as u64
        + new_index as u64 * sub_block_size as u64;
    obj.read.data_chunk_length = 0;
    for stream in 0..NUM_STREAMS {
        obj.object_offset[stream] += (new_offsets.offsets[stream] - obj.block_offset[stream]) as u64;
    }
    obj.block_offset = new_offsets.offsets;
    let amount_moved = block_stream_offset(&new_offsets.offsets, obj.read.stream) - prev_block_offset;
    assert!(amount_moved <= offset);
    Ok(offset - amount_moved)
}

/// Advances the read position to the last block which has usable offset
/// data, used by the full-scan size fallback.
pub(crate) fn to_last_block<D: BlockDev>(ctx: &mut Ctx<'_, D>, obj: &mut Object) -> StoreResult<()> {
    let current_block_index = (obj.read.storage_offset / ctx.geom.block_size as u64) as u16;
    let mut last_block_index = ctx.lut.get_num_blocks(obj.object_id) - 1;
    while last_block_index > current_block_index {
        let Some(offset_data) = get_offset_chunk_data(ctx, obj.object_id, last_block_index)? else {
            // Must not have written the offsets to this block, so ignore it
            // and try the previous one
            last_block_index -= 1;
            continue;
        };
        obj.read.storage_offset = last_block_index as u64 * ctx.geom.block_size as u64;
        obj.read.data_chunk_length = 0;
        obj.object_offset = offset_data.offsets;
        obj.block_offset = [0; NUM_STREAMS];
        break;
    }
    Ok(())
}

/// Computes the object size from the last block's footer seek chunk and
/// offset chunk. Returns `None` when the last block is not v2 or the
/// records are unusable, in which case the caller falls back to a scan.
pub(crate) fn v2_object_size<D: BlockDev>(
    ctx: &mut Ctx<'_, D>,
    object_id: u16,
    stream_bitmask: StreamMask,
) -> StoreResult<Option<u64>> {
    let last_block = ctx.lut.get_last_block(object_id);
    if last_block == INVALID_BLOCK || !ctx.lut.is_v2(last_block) {
        return Ok(None);
    }

    // Read the seek chunk from the end of the last block
    let Some(seek_data) = storage::read_footer_seek_data(ctx.dev, ctx.geom, ctx.cache, last_block)?
    else {
        return Ok(None);
    };

    // Read the offset data from the start of the last block if there are
    // more than 1
    let mut offset_data = OffsetData::default();
    if ctx.lut.get_num_blocks(object_id) > 1 {
        match storage::read_offset_data(ctx.dev, ctx.geom, ctx.cache, last_block)? {
            Some(data) => offset_data = data,
            None => return Ok(None),
        }
    }

    let mut size = 0u64;
    for stream in 0..NUM_STREAMS {
        if stream_bitmask.contains_stream(stream as u8) {
            size += offset_data.offsets[stream] + seek_data.offsets[stream] as u64;
        }
    }
    Ok(Some(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_density_default_below_threshold() {
        assert_eq!(estimate_update_density(0, 0), DEFAULT_DENSITY);
        assert_eq!(estimate_update_density(1023, 4096), DEFAULT_DENSITY);
    }

    #[test]
    fn test_density_clamped() {
        // Perfectly dense data clamps to the multiplier
        assert_eq!(estimate_update_density(4096, 4096), DENSITY_MULTIPLIER);
        // Extremely sparse data clamps to the minimum
        assert_eq!(
            estimate_update_density(2048, 4 * 1024 * 1024 * 1024),
            MIN_DENSITY
        );
    }

    #[test]
    fn test_estimate_index() {
        // With near-full density, the estimated index is just below the
        // naive offset / block_size
        let density = 980_000;
        let index = estimate_calculate_index(density, 10 * 4096, 4096);
        assert_eq!(index, 10 * 1_000_000 / 980_000);
    }
}
