// SPDX-License-Identifier: MIT

use alloc::vec::Vec;

use log::{debug, warn};
use siloio::BlockDev;

use crate::cache::Cache;
use crate::errors::*;
use crate::lookup::{
    BLOCK_STATE_GARBAGE, BLOCK_STATE_MAYBE_ERASED, BLOCK_STATE_UNKNOWN, LookupTable,
};
use crate::object::{ObjState, Object, ObjectConfig, ReadPosition, validate_buffer_size};
use crate::types::*;
use crate::{read, seek, storage, write};

/// Split-borrow view over the store used by the read/write/seek engines.
pub(crate) struct Ctx<'a, D: BlockDev> {
    pub dev: &'a mut D,
    pub geom: &'a Geometry,
    pub lut: &'a mut LookupTable,
    /// The store-level read cache
    pub cache: &'a mut Cache,
}

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    object_id: u16,
    writing: bool,
}

/// An append-only object store over a block-erasable device.
///
/// Objects are opaque byte containers identified by 16-bit IDs, each
/// interleaving up to [`NUM_STREAMS`] independent byte streams. Writes are
/// append-only per object; the medium is the sole source of truth and the
/// in-memory index is rebuilt from it on every mount.
pub struct Store<D: BlockDev> {
    dev: D,
    geom: Geometry,
    lut: LookupTable,
    cache: Cache,
    open: Vec<OpenEntry>,
}

impl<D: BlockDev> Store<D> {
    /// Mounts the store, scanning every block to rebuild the index.
    pub fn mount(dev: D, geometry: Geometry) -> StoreResult<Self> {
        Self::mount_inner(dev, geometry, None)
    }

    /// Mounts the store, invoking `object_found(object_id, stream, data)`
    /// for every object as it is discovered.
    ///
    /// `data` captures the leading data chunks of a single stream found
    /// within the first read unit of the object's first block. This is an
    /// optimization for callers that store short indexable metadata at the
    /// head of an object; no guarantees are made for larger heads.
    pub fn mount_with<F>(dev: D, geometry: Geometry, mut object_found: F) -> StoreResult<Self>
    where
        F: FnMut(u16, u8, &[u8]),
    {
        Self::mount_inner(dev, geometry, Some(&mut object_found))
    }

    fn mount_inner<'a, 'b>(
        dev: D,
        geometry: Geometry,
        mut object_found: Option<&'a mut (dyn FnMut(u16, u8, &[u8]) + 'b)>,
    ) -> StoreResult<Self> {
        geometry.validate();
        let mut store = Self {
            dev,
            geom: geometry,
            lut: LookupTable::new(geometry.num_blocks),
            cache: Cache::new(geometry.min_read_write_size),
            open: Vec::new(),
        };

        // Populate the lookup table from the storage
        for block in 0..geometry.num_blocks {
            let hook = object_found.as_deref_mut();
            store.populate_for_block(block, hook)?;
        }

        // Remove any entries from our lookup table for deleted objects
        for block in 0..geometry.num_blocks {
            let value = store.lut.value_at(block);
            let object_id = (value >> 16) as u16;
            if object_id == INVALID_OBJECT_ID {
                // Free block
                continue;
            }
            let object_block_index = value as u16;
            if object_block_index == 0 {
                // This is the first block, so the object is valid
                continue;
            }
            if !store.lut.contains_block0(object_id) {
                debug!(
                    "Removing deleted object from lookup table (object_id={object_id}, object_block_index={object_block_index})"
                );
                store.lut.set_free(block, BLOCK_STATE_GARBAGE);
            }
        }

        Ok(store)
    }

    fn populate_for_block<'b>(
        &mut self,
        block: u16,
        object_found: Option<&mut (dyn FnMut(u16, u8, &[u8]) + 'b)>,
    ) -> StoreResult<()> {
        let mut position = Position { block, offset: 0 };
        let header =
            storage::read_block_header(&mut self.dev, &self.geom, &mut self.cache, &mut position)?;
        match header.version() {
            Some(is_v2) => {
                self.lut
                    .set_value(block, header.object_id, header.object_block_index);
                self.lut.set_is_v2(block, is_v2);
                if header.object_block_index == 0 {
                    if let Some(object_found) = object_found {
                        // Call the object found callback
                        assert_eq!(self.cache.block, block);
                        let (stream, data_length) = extract_head_data(&mut self.cache);
                        object_found(header.object_id, stream, &self.cache.buf[..data_length]);
                    }
                }
            }
            None => {
                // Check if the header is completely empty as that might be an
                // indication that the block is erased, so we'll use this
                // block before we use other ones that might have
                // more-expensive erase operations
                let state = if header.is_all_zero() {
                    BLOCK_STATE_MAYBE_ERASED
                } else {
                    BLOCK_STATE_UNKNOWN
                };
                self.lut.set_free(block, state);
                self.lut.set_is_v2(block, false);
            }
        }
        // Use the lookup value to generate some randomness in our seed
        self.lut.seed ^= self.lut.value_at(block);
        Ok(())
    }

    /// Releases the store, returning the device. All objects must have been
    /// closed.
    pub fn unmount(self) -> D {
        assert!(self.open.is_empty(), "objects still open");
        self.dev
    }

    /// Borrows the underlying device.
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[inline]
    fn ctx(&mut self) -> Ctx<'_, D> {
        Ctx {
            dev: &mut self.dev,
            geom: &self.geom,
            lut: &mut self.lut,
            cache: &mut self.cache,
        }
    }

    fn is_open(&self, object_id: u16) -> bool {
        self.open.iter().any(|entry| entry.object_id == object_id)
    }

    /// Creates a new object for writing, returning its handle.
    ///
    /// Nothing is committed to the medium until the object's buffer first
    /// fills or the object is closed.
    pub fn create(&mut self, config: &ObjectConfig) -> Object {
        validate_buffer_size(&self.geom, config.buffer_size);
        // The generator excludes IDs present in the lookup table; writers
        // which haven't committed a block yet are only known to the open
        // list, so screen against those separately
        let object_id = loop {
            let candidate = self.lut.next_object_id();
            if !self.is_open(candidate) {
                break candidate;
            }
        };
        let obj = Object::new_writer(object_id, config.buffer_size);
        self.open.push(OpenEntry {
            object_id,
            writing: true,
        });
        obj
    }

    /// Appends data to the given stream of an object created with
    /// [`Store::create`].
    ///
    /// Fails with [`StoreError::Full`] when no free block is left; on-media
    /// state stays consistent at the last completed flush.
    pub fn write(&mut self, obj: &mut Object, stream: u8, data: &[u8]) -> StoreResult<()> {
        assert!(!data.is_empty());
        assert_eq!(obj.state, ObjState::Writing);
        assert!((stream as usize) < NUM_STREAMS);
        let mut done = 0usize;
        while done < data.len() {
            let written = write::process(&mut self.ctx(), obj, stream, &data[done..])?;
            done += written as usize;
        }
        Ok(())
    }

    /// Opens an existing object for reading on a single stream, or on all
    /// streams with [`WILDCARD_STREAM`].
    pub fn open(&mut self, stream: u8, object_id: u16, config: &ObjectConfig) -> StoreResult<Object> {
        assert!((stream as usize) < NUM_STREAMS || stream == WILDCARD_STREAM);
        assert_ne!(object_id, INVALID_OBJECT_ID);
        validate_buffer_size(&self.geom, config.buffer_size);

        // Find the first block from our lookup table
        let block = self.lut.get_block(object_id, 0);
        if block == INVALID_BLOCK {
            warn!("Did not find block (object_id={object_id})");
            return Err(StoreError::NotFound);
        }

        let obj = Object::new_reader(object_id, stream, config.buffer_size);
        self.open.push(OpenEntry {
            object_id,
            writing: false,
        });
        Ok(obj)
    }

    fn read_inner(
        &mut self,
        obj: &mut Object,
        buf: &mut [u8],
        single_chunk: bool,
    ) -> StoreResult<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            let max_length = u32::try_from(buf.len() - total).unwrap_or(u32::MAX);
            let (read_bytes, has_more) =
                read::process(&mut self.ctx(), obj, Some(&mut buf[total..]), max_length)?;
            total += read_bytes as usize;
            if !has_more {
                break;
            }
            if single_chunk && read_bytes > 0 {
                // Only read a single chunk of data so the stream can be
                // reported
                break;
            }
        }
        Ok(total)
    }

    /// Reads from the stream the object was opened on, returning the number
    /// of bytes read (0 at end-of-object, or at a corruption point).
    pub fn read(&mut self, obj: &mut Object, buf: &mut [u8]) -> StoreResult<usize> {
        assert!(!buf.is_empty());
        assert_eq!(obj.state, ObjState::Reading);
        assert_ne!(obj.read.stream, WILDCARD_STREAM);
        self.read_inner(obj, buf, false)
    }

    /// Reads at most one data chunk from a wildcard-opened object,
    /// reporting the stream it belongs to.
    pub fn read_stream(&mut self, obj: &mut Object, buf: &mut [u8]) -> StoreResult<(usize, u8)> {
        assert!(!buf.is_empty());
        assert_eq!(obj.state, ObjState::Reading);
        assert_eq!(obj.read.stream, WILDCARD_STREAM);
        let total = self.read_inner(obj, buf, true)?;
        Ok((total, obj.read.current_stream))
    }

    /// Seeks the requested amount further into the object stream.
    ///
    /// Block and sub-block indexes are used to fast-forward; the residual
    /// distance is consumed through the reader.
    pub fn seek(&mut self, obj: &mut Object, offset: u64) -> StoreResult<()> {
        assert_eq!(obj.state, ObjState::Reading);

        // Try to seek directly to the block and sub-block containing the
        // offset as an optimization
        let offset = seek::to_block(&mut self.ctx(), obj, offset)?;
        let mut offset = seek::to_sub_block(&mut self.ctx(), obj, offset)?;

        // Read the remaining bytes through the object
        while offset > 0 {
            let max_length = u32::try_from(offset).unwrap_or(u32::MAX);
            let (read_bytes, has_more) = read::process(&mut self.ctx(), obj, None, max_length)?;
            if !has_more {
                return Err(StoreError::OutOfRange);
            }
            offset -= read_bytes as u64;
        }
        Ok(())
    }

    /// Gets the total size of the object streams selected by
    /// `stream_bitmask`.
    ///
    /// The mask must be empty for objects opened on a single stream
    /// (meaning "the opened stream") and non-empty for wildcard-opened
    /// objects.
    pub fn object_size(&mut self, obj: &mut Object, stream_bitmask: StreamMask) -> StoreResult<u64> {
        assert_eq!(obj.state, ObjState::Reading);
        let stream_bitmask = if obj.read.stream == WILDCARD_STREAM {
            assert!(!stream_bitmask.is_empty());
            stream_bitmask
        } else {
            assert!(stream_bitmask.is_empty());
            StreamMask::stream(obj.read.stream)
        };

        // Try to utilize the v2 features to calculate the size quickly
        if let Some(size) = seek::v2_object_size(&mut self.ctx(), obj.object_id, stream_bitmask)? {
            return Ok(size);
        }

        // Save the current read position
        let prev_pos = self.save_read_position(obj);

        // Advance to the last block
        seek::to_last_block(&mut self.ctx(), obj)?;

        // Read until the end of the object
        loop {
            let (_, has_more) = read::process(&mut self.ctx(), obj, None, u32::MAX)?;
            if !has_more {
                break;
            }
        }

        // Get the size based on the current position
        let mut size = 0u64;
        for stream in 0..NUM_STREAMS {
            if stream_bitmask.contains_stream(stream as u8) {
                size += obj.object_offset[stream];
            }
        }

        // Restore the previous read position
        self.restore_read_position(obj, &prev_pos);

        Ok(size)
    }

    /// Saves the current read position.
    pub fn save_read_position(&self, obj: &Object) -> ReadPosition {
        assert_eq!(obj.state, ObjState::Reading);
        ReadPosition {
            object_offset: obj.object_offset,
            block_offset: obj.block_offset,
            storage_offset: obj.read.storage_offset,
            data_chunk_length: obj.read.data_chunk_length,
            current_stream: obj.read.current_stream,
        }
    }

    /// Restores a previously-saved read position.
    pub fn restore_read_position(&mut self, obj: &mut Object, position: &ReadPosition) {
        assert_eq!(obj.state, ObjState::Reading);
        obj.object_offset = position.object_offset;
        obj.block_offset = position.block_offset;
        obj.read.storage_offset = position.storage_offset;
        obj.read.data_chunk_length = position.data_chunk_length;
        obj.read.current_stream = position.current_stream;
    }

    /// Closes an object handle.
    ///
    /// For writers this finalizes the object with an end chunk and footer;
    /// it fails with [`StoreError::Full`] only if that flush could not
    /// acquire a block, in which case the object stays open.
    pub fn close(&mut self, obj: &mut Object) -> StoreResult<()> {
        assert_ne!(obj.state, ObjState::Invalid);

        let writing = obj.state == ObjState::Writing;
        if writing {
            write::finish(&mut self.ctx(), obj)?;
        }

        let index = self
            .open
            .iter()
            .position(|entry| entry.object_id == obj.object_id && entry.writing == writing)
            .expect("object not in open list");
        self.open.remove(index);
        obj.state = ObjState::Invalid;
        Ok(())
    }

    /// Iterates over all objects: committed ones in physical block order,
    /// then writers which haven't hit the storage yet.
    pub fn objects(&self) -> Objects<'_, D> {
        Objects {
            store: self,
            block: 0,
            open_index: 0,
        }
    }

    /// Gets the number of blocks used by an object (which will be larger
    /// than the actual object data size).
    pub fn object_num_blocks(&self, object_id: u16) -> u16 {
        assert_ne!(object_id, INVALID_OBJECT_ID);
        self.lut.get_num_blocks(object_id)
    }

    /// Deletes an object. The object must not be open.
    pub fn delete(&mut self, object_id: u16) -> StoreResult<()> {
        assert_ne!(object_id, INVALID_OBJECT_ID);

        // Make sure the object isn't open
        assert!(!self.is_open(object_id), "object is open");

        // Remove the object from our lookup table and erase its first block,
        // which is what commits the deletion
        debug!("Deleting object ({object_id})");
        let first_block = self.lut.delete_object(object_id);
        storage::erase(&mut self.dev, &self.geom, &mut self.cache, first_block)
    }

    /// Deletes all objects.
    ///
    /// With `secure` set every in-use block is erased; otherwise only first
    /// blocks are erased and the rest are marked garbage, which is enough
    /// to keep a future mount from resurrecting them.
    pub fn wipe(&mut self, secure: bool) -> StoreResult<()> {
        assert!(self.open.is_empty());
        let mut block = 0u16;
        loop {
            let mut should_erase = secure;
            block = self.lut.wipe_next_in_use(block, &mut should_erase);
            if block == INVALID_BLOCK {
                break;
            }
            if should_erase {
                storage::erase(&mut self.dev, &self.geom, &mut self.cache, block)?;
            }
        }
        Ok(())
    }

    /// Total number of blocks currently in use.
    pub fn size(&self) -> u16 {
        self.lut.total_in_use()
    }

    /// Returns whether the store is full (which causes writes to fail).
    pub fn is_storage_full(&self) -> bool {
        self.lut.is_full()
    }

    /// Pre-erases free blocks until `num_blocks` of them are ready, for
    /// predictable future write latency.
    pub fn prepare_storage(&mut self, num_blocks: u16) -> StoreResult<()> {
        assert!(num_blocks > 0);
        // Check how many are already erased
        let num_erased = self.lut.num_erased();
        if num_erased >= num_blocks {
            return Ok(());
        }
        let mut num_blocks = num_blocks - num_erased;
        // Find some blocks which can be erased
        let mut erase_block = 0u16;
        while num_blocks > 0 {
            erase_block = self.lut.next_pending_erase(erase_block);
            if erase_block == INVALID_BLOCK {
                break;
            }
            storage::erase(&mut self.dev, &self.geom, &mut self.cache, erase_block)?;
            num_blocks -= 1;
        }
        Ok(())
    }
}

/// Extracts the concatenated payload of the leading data chunks of a single
/// stream from the cached first read unit of a block, reusing the cache
/// buffer as the payload buffer.
fn extract_head_data(cache: &mut Cache) -> (u8, usize) {
    assert_eq!(cache.len, cache.size());
    assert_eq!(cache.offset, 0);

    let mut read_offset = BlockHeader::SIZE as usize;
    let mut stream = WILDCARD_STREAM;
    let mut data_length = 0usize;
    loop {
        // Read the chunk header
        if cache.len as usize - read_offset < ChunkHeader::SIZE as usize {
            break;
        }
        let tag = u32::from_le_bytes(cache.buf[read_offset..read_offset + 4].try_into().unwrap());
        read_offset += ChunkHeader::SIZE as usize;

        // Check if this is a data chunk
        let chunk_type = (tag >> 24) as u8;
        let chunk_stream = chunk_type & 0xf;
        if !(CHUNK_TYPE_DATA_FIRST..=CHUNK_TYPE_DATA_LAST).contains(&chunk_type) {
            break;
        }
        // Check it's of the same stream we previously read if it's not the
        // first one
        if stream == WILDCARD_STREAM {
            stream = chunk_stream;
        }
        if chunk_stream != stream {
            break;
        }
        // Read and shift the data down within the cache in order to reuse
        // its buffer
        let chunk_length =
            ((tag & CHUNK_MAX_LENGTH) as usize).min(cache.len as usize - read_offset);
        cache.buf.copy_within(read_offset..read_offset + chunk_length, data_length);
        read_offset += chunk_length;
        data_length += chunk_length;
    }

    // Wipe the cache since we reused its buffer
    cache.len = 0;
    (stream, data_length)
}

/// Iterator over the object IDs in a store, created by [`Store::objects`].
pub struct Objects<'a, D: BlockDev> {
    store: &'a Store<D>,
    block: u16,
    open_index: usize,
}

impl<D: BlockDev> Iterator for Objects<'_, D> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        // Find the next block which contains the first block of an object
        let object_id = self.store.lut.iter_next_object(&mut self.block);
        if object_id != INVALID_OBJECT_ID {
            return Some(object_id);
        }

        // Check the objects which are open for writing and haven't written
        // to the storage yet
        while self.open_index < self.store.open.len() {
            let entry = self.store.open[self.open_index];
            self.open_index += 1;
            if entry.writing && self.store.lut.get_num_blocks(entry.object_id) == 0 {
                return Some(entry.object_id);
            }
        }
        None
    }
}
