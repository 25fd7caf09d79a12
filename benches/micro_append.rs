//! Micro benchmarks for append/prepend across the inline and segmented paths.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use segkv::primitives::blocks::{MemBlockStore, MemBlockStoreOptions};
use segkv::storage::{BufferedDataProvider, CasTime, Direction, Slice, SliceOptions, ValueHeader};

const CHUNK: usize = 512;
const APPENDS: usize = 64;

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut bytes);
    bytes
}

fn fresh_slice(initial: &[u8]) -> Slice {
    let blocks = Arc::new(
        MemBlockStore::new(MemBlockStoreOptions::default()).expect("block store"),
    );
    let slice = Slice::open(blocks, SliceOptions::default()).expect("slice");
    slice
        .set(
            b"bench",
            BufferedDataProvider::copy_from(initial),
            ValueHeader::default(),
            CasTime::default(),
        )
        .expect("seed value");
    slice
}

fn grow(slice: &Slice, chunk: &[u8], direction: Direction) {
    for _ in 0..APPENDS {
        let result = slice
            .append_or_prepend(
                b"bench",
                BufferedDataProvider::copy_from(chunk),
                direction,
                CasTime::default(),
            )
            .expect("append");
        black_box(result);
    }
}

fn micro_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/append");
    group.sample_size(30);
    let chunk = payload(CHUNK, 0x5EED);

    group.throughput(Throughput::Bytes((CHUNK * APPENDS) as u64));
    for direction in [Direction::Append, Direction::Prepend] {
        group.bench_function(format!("{direction:?}/small_start"), |b| {
            b.iter_batched(
                || fresh_slice(b"seed"),
                |slice| grow(&slice, &chunk, direction),
                BatchSize::SmallInput,
            );
        });
    }

    let tiny = payload(8, 0xA11CE);
    group.throughput(Throughput::Bytes(8 * 16));
    group.bench_function("inline_only", |b| {
        b.iter_batched(
            || fresh_slice(b""),
            |slice| {
                for _ in 0..16 {
                    black_box(
                        slice
                            .append_or_prepend(
                                b"bench",
                                BufferedDataProvider::copy_from(&tiny),
                                Direction::Append,
                                CasTime::default(),
                            )
                            .expect("append"),
                    );
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, micro_append);
criterion_main!(benches);
