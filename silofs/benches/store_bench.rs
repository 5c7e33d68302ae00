// SPDX-License-Identifier: MIT

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use silofs::prelude::*;
use siloio::prelude::*;

const GEOM: Geometry = Geometry {
    block_size: 256 * 1024,
    num_blocks: 64,
    sub_blocks_per_block: 8,
    min_read_write_size: 512,
};

fn bench_write(c: &mut Criterion) {
    let cfg = ObjectConfig { buffer_size: 4096 };
    let data = vec![0xA5u8; 64 * 1024];

    c.bench_function("write_1mib", |b| {
        b.iter(|| {
            let dev = MemBlockDev::new(GEOM.block_size, GEOM.num_blocks);
            let mut store = Store::mount(dev, GEOM).unwrap();
            let mut obj = store.create(&cfg);
            for _ in 0..16 {
                store.write(&mut obj, 0, black_box(&data)).unwrap();
            }
            store.close(&mut obj).unwrap();
            black_box(store.unmount());
        })
    });
}

fn bench_seek(c: &mut Criterion) {
    let cfg = ObjectConfig { buffer_size: 4096 };
    let data = vec![0x5Au8; 64 * 1024];

    // Build a multi-block object once, then seek into it repeatedly
    let dev = MemBlockDev::new(GEOM.block_size, GEOM.num_blocks);
    let mut store = Store::mount(dev, GEOM).unwrap();
    let mut obj = store.create(&cfg);
    for _ in 0..64 {
        store.write(&mut obj, 0, &data).unwrap();
    }
    store.close(&mut obj).unwrap();
    let id = obj.id();

    c.bench_function("seek_and_read", |b| {
        b.iter(|| {
            let mut obj = store.open(0, id, &cfg).unwrap();
            store.seek(&mut obj, black_box(3 * 1024 * 1024)).unwrap();
            let mut buf = [0u8; 64];
            store.read(&mut obj, &mut buf).unwrap();
            store.close(&mut obj).unwrap();
            black_box(buf);
        })
    });
}

criterion_group!(benches, bench_write, bench_seek);
criterion_main!(benches);
