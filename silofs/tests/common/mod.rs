// SPDX-License-Identifier: MIT
#![allow(dead_code)]

use silofs::prelude::*;
use siloio::prelude::*;

pub const BLOCK_FOOTER_LENGTH: u32 = 128;

/// The reference geometry: 4 MiB blocks, 8 sub-blocks, 512 B min IO.
pub fn geom(num_blocks: u16) -> Geometry {
    Geometry {
        block_size: 4 * 1024 * 1024,
        num_blocks,
        sub_blocks_per_block: 8,
        min_read_write_size: 512,
    }
}

/// A reduced geometry for capacity and wipe scenarios.
pub const SMALL: Geometry = Geometry {
    block_size: 4096,
    num_blocks: 4,
    sub_blocks_per_block: 8,
    min_read_write_size: 512,
};

/// RAM device which asserts that the store only ever issues accesses
/// aligned to the minimum read/write size, per the driver contract.
pub struct AlignedDev {
    pub inner: MemBlockDev,
    rw_size: u32,
}

impl AlignedDev {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            inner: MemBlockDev::new(geometry.block_size, geometry.num_blocks),
            rw_size: geometry.min_read_write_size,
        }
    }
}

impl BlockDev for AlignedDev {
    fn read(&mut self, block: u16, offset: u32, buf: &mut [u8]) -> DevResult {
        assert_eq!(offset % self.rw_size, 0);
        assert_eq!(buf.len() as u32 % self.rw_size, 0);
        self.inner.read(block, offset, buf)
    }

    fn write(&mut self, block: u16, offset: u32, data: &[u8]) -> DevResult {
        assert_eq!(offset % self.rw_size, 0);
        assert_eq!(data.len() as u32 % self.rw_size, 0);
        self.inner.write(block, offset, data)
    }

    fn erase(&mut self, block: u16) -> DevResult {
        self.inner.erase(block)
    }
}

/// Deterministic pseudo-random test data.
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

fn expect_zero_run(bytes: &[u8], start: usize, len: usize) {
    for (i, b) in bytes[start..start + len].iter().enumerate() {
        assert_eq!(*b, 0, "expected zero at storage offset 0x{:x}", start + i);
    }
}

/// Walks the raw storage contents, asserting the exact on-device layout
/// record by record.
pub struct StorageWalker<'a> {
    dev: &'a mut AlignedDev,
    offset: u64,
    block_size: u64,
}

impl<'a> StorageWalker<'a> {
    pub fn new(dev: &'a mut AlignedDev) -> Self {
        let block_size = dev.inner.block_size() as u64;
        Self {
            dev,
            offset: 0,
            block_size,
        }
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    fn split(&self) -> (u16, u32) {
        (
            (self.offset / self.block_size) as u16,
            (self.offset % self.block_size) as u32,
        )
    }

    fn read_u16(&mut self) -> u16 {
        let (block, offset) = self.split();
        let value = self.dev.inner.read_u16_at(block, offset).unwrap();
        self.offset += 2;
        value
    }

    fn read_u32(&mut self) -> u32 {
        let (block, offset) = self.split();
        let value = self.dev.inner.read_u32_at(block, offset).unwrap();
        self.offset += 4;
        value
    }

    fn read_u64(&mut self) -> u64 {
        let (block, offset) = self.split();
        let value = self.dev.inner.read_u64_at(block, offset).unwrap();
        self.offset += 8;
        value
    }

    fn expect_magic(&mut self, magic: &[u8; 4]) {
        let start = self.offset as usize;
        assert_eq!(
            &self.dev.inner.bytes()[start..start + 4],
            magic,
            "magic at storage offset 0x{start:x}"
        );
        self.offset += 4;
    }

    pub fn expect_block_header(&mut self, object_id: u16, object_block_index: u16) {
        self.expect_magic(b"AFS2");
        assert_eq!(self.read_u16(), object_id, "block header object_id");
        assert_eq!(
            self.read_u16(),
            object_block_index,
            "block header object_block_index"
        );
    }

    pub fn expect_block_header_v1(&mut self, object_id: u16, object_block_index: u16) {
        self.expect_magic(b"AFS1");
        assert_eq!(self.read_u16(), object_id, "block header object_id");
        assert_eq!(
            self.read_u16(),
            object_block_index,
            "block header object_block_index"
        );
    }

    pub fn expect_data_chunk(&mut self, stream: u8, payload: &[u8]) {
        let at = self.offset;
        let tag = self.read_u32();
        let expected = ((0xd0 | stream as u32) << 24) | payload.len() as u32;
        assert_eq!(tag, expected, "data chunk tag at storage offset 0x{at:x}");
        let start = self.offset as usize;
        let actual = &self.dev.inner.bytes()[start..start + payload.len()];
        if actual != payload {
            let first = actual
                .iter()
                .zip(payload)
                .position(|(a, b)| a != b)
                .unwrap();
            panic!("data chunk payload mismatch at storage offset 0x{:x}", start + first);
        }
        self.offset += payload.len() as u64;
    }

    pub fn expect_offset_chunk(&mut self, values: &[u64]) {
        let at = self.offset;
        let tag = self.read_u32();
        let expected = (0x3e << 24) | (values.len() * 8) as u32;
        assert_eq!(tag, expected, "offset chunk tag at storage offset 0x{at:x}");
        for (i, value) in values.iter().enumerate() {
            assert_eq!(self.read_u64(), *value, "offset chunk value [{i}]");
        }
    }

    pub fn expect_seek_chunk(&mut self, values: &[u32]) {
        let at = self.offset;
        let tag = self.read_u32();
        let expected = (0x5e << 24) | (values.len() * 4) as u32;
        assert_eq!(tag, expected, "seek chunk tag at storage offset 0x{at:x}");
        for (i, value) in values.iter().enumerate() {
            assert_eq!(self.read_u32(), *value, "seek chunk value [{i}]");
        }
    }

    pub fn expect_end_chunk(&mut self) {
        let at = self.offset;
        let tag = self.read_u32();
        assert_eq!(tag, 0xed00_0000, "end chunk tag at storage offset 0x{at:x}");
    }

    pub fn expect_footer(&mut self) {
        self.expect_magic(b"afs2");
    }

    pub fn expect_unused(&mut self, len: usize) {
        expect_zero_run(self.dev.inner.bytes(), self.offset as usize, len);
        self.offset += len as u64;
    }

    pub fn expect_unused_until_footer(&mut self) {
        let len = self.block_size - BLOCK_FOOTER_LENGTH as u64 - self.offset % self.block_size;
        self.expect_unused(len as usize);
    }

    pub fn expect_unused_until_block_end(&mut self) {
        let len = self.block_size - self.offset % self.block_size;
        self.expect_unused(len as usize);
    }

    /// The remainder of the storage must be untouched (zero).
    pub fn finish(self) {
        let total = self.dev.inner.bytes().len();
        expect_zero_run(self.dev.inner.bytes(), self.offset as usize, total - self.offset as usize);
    }
}

pub fn assert_storage_all_zero(dev: &AlignedDev) {
    expect_zero_run(dev.inner.bytes(), 0, dev.inner.bytes().len());
}

pub fn assert_storage_not_empty(dev: &AlignedDev) {
    assert!(
        dev.inner.bytes().iter().any(|b| *b != 0),
        "storage is empty"
    );
}

/// Manually lays out a legacy v1 block: header, one data chunk for stream 1
/// and one for stream 2 (same payload), and an end chunk. No footer.
pub fn generate_v1_block(dev: &mut AlignedDev, block: u16, object_id: u16, data: &[u8]) {
    let mut offset = 0u32;
    dev.inner.write(block, offset, b"AFS1").unwrap();
    offset += 4;
    dev.inner.write_u16_at(block, offset, object_id).unwrap();
    offset += 2;
    dev.inner.write_u16_at(block, offset, 0).unwrap();
    offset += 2;

    for stream in [1u8, 2u8] {
        let tag = ((0xd0 | stream as u32) << 24) | data.len() as u32;
        dev.inner.write_u32_at(block, offset, tag).unwrap();
        offset += 4;
        dev.inner.write(block, offset, data).unwrap();
        offset += data.len() as u32;
    }

    dev.inner.write_u32_at(block, offset, 0xed00_0000).unwrap();
}
