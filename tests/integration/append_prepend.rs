#![allow(missing_docs)]

use std::io::Cursor;
use std::sync::Arc;
use std::thread;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use segkv::{
    primitives::blocks::{BlockStore, MemBlockStore, MemBlockStoreOptions},
    storage::{
        AppendPrependOper, AppendPrependResult, AutoBuffering, BufferGroup, BufferedDataProvider,
        CasTime, DataProvider, Direction, FillSource, ProviderFailed, ReaderDataProvider, Slice,
        SliceOptions, ValueDataProvider, ValueHeader,
    },
    types::{PageId, Result},
};

const MAX_INLINE: usize = 64;
const BLOCK: u32 = 4096;

fn open(max_value_size: u64) -> Result<(Arc<MemBlockStore>, Slice)> {
    let blocks = Arc::new(MemBlockStore::new(MemBlockStoreOptions {
        block_size: BLOCK,
        max_blocks: None,
    })?);
    let slice = Slice::open(
        blocks.clone(),
        SliceOptions {
            max_inline_size: MAX_INLINE,
            max_value_size,
            buffer_threshold: 16,
        },
    )?;
    Ok((blocks, slice))
}

fn put(slice: &Slice, key: &[u8], bytes: &[u8]) -> Result<()> {
    slice.set(
        key,
        BufferedDataProvider::copy_from(bytes),
        ValueHeader::default(),
        CasTime::default(),
    )?;
    Ok(())
}

fn grow(
    slice: &Slice,
    key: &[u8],
    bytes: &[u8],
    direction: Direction,
) -> Result<AppendPrependResult> {
    slice.append_or_prepend(
        key,
        BufferedDataProvider::copy_from(bytes),
        direction,
        CasTime::default(),
    )
}

fn random_bytes(rng: &mut ChaCha8Rng, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}

/// Writes `fail_after` bytes, then fails.
struct Failing {
    size: usize,
    fail_after: usize,
}

impl FillSource for Failing {
    fn size(&self) -> usize {
        self.size
    }

    fn fill(&mut self, dest: &mut BufferGroup<'_>) -> std::result::Result<(), ProviderFailed> {
        let mut written = 0;
        for span in dest.iter_mut() {
            for byte in span.iter_mut() {
                if written == self.fail_after {
                    return Err(ProviderFailed);
                }
                *byte = 0xEE;
                written += 1;
            }
        }
        Ok(())
    }
}

fn failing(size: usize, fail_after: usize) -> AutoBuffering<Failing> {
    AutoBuffering::new(Failing { size, fail_after })
}

fn segment_ids(slice: &Slice, key: &[u8]) -> Result<Vec<PageId>> {
    match slice.get(key)? {
        Some(ValueDataProvider::Large(provider)) => Ok(provider.source().buffer().segment_ids()),
        _ => panic!("expected a large value"),
    }
}

#[test]
fn scenario_a_small_append_stays_small() -> Result<()> {
    let (blocks, slice) = open(1 << 20)?;
    put(&slice, b"k", b"0123456789")?;
    assert_eq!(
        grow(&slice, b"k", b"abcde", Direction::Append)?,
        AppendPrependResult::Success
    );
    assert_eq!(slice.read(b"k")?, Some(b"0123456789abcde".to_vec()));
    assert_eq!(slice.is_large(b"k"), Some(false));
    assert_eq!(blocks.stats().allocated, 0);
    Ok(())
}

#[test]
fn scenario_b_small_append_becomes_large() -> Result<()> {
    let (_blocks, slice) = open(1 << 20)?;
    let old = vec![b'o'; 60];
    let new = vec![b'n'; 20];
    put(&slice, b"k", &old)?;
    assert_eq!(
        grow(&slice, b"k", &new, Direction::Append)?,
        AppendPrependResult::Success
    );
    assert_eq!(slice.is_large(b"k"), Some(true));
    let value = slice.read(b"k")?.unwrap();
    assert_eq!(value.len(), 80);
    assert_eq!(&value[..60], &old[..]);
    assert_eq!(&value[60..], &new[..]);
    Ok(())
}

#[test]
fn scenario_c_large_prepend_keeps_old_segments() -> Result<()> {
    let (_blocks, slice) = open(1 << 20)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
    let old = random_bytes(&mut rng, 10_000);
    let new = random_bytes(&mut rng, 100);
    put(&slice, b"k", &old)?;
    let before = segment_ids(&slice, b"k")?;
    assert_eq!(before.len(), 3);

    assert_eq!(
        grow(&slice, b"k", &new, Direction::Prepend)?,
        AppendPrependResult::Success
    );
    let after = segment_ids(&slice, b"k")?;
    assert_eq!(after.len(), 4);
    assert_eq!(&after[1..], &before[..], "existing segments are not rewritten");

    let value = slice.read(b"k")?.unwrap();
    assert_eq!(value.len(), 10_100);
    assert_eq!(&value[..100], &new[..]);
    assert_eq!(&value[100..], &old[..]);
    Ok(())
}

#[test]
fn scenario_d_failed_provider_frees_new_buffer() -> Result<()> {
    let (blocks, slice) = open(1 << 20)?;
    let old = vec![b'q'; 40];
    put(&slice, b"k", &old)?;
    let stats_before = blocks.stats();

    let mut oper = AppendPrependOper::new(failing(50, 17), Direction::Append);
    let result = slice.run_modify(b"k", &mut oper, CasTime::default())?;
    assert_eq!(result, AppendPrependResult::ProviderFailed);
    assert!(oper.into_provider().is_consumed());

    let stats_after = blocks.stats();
    assert!(stats_after.allocated > stats_before.allocated, "buffer was prepared");
    assert_eq!(stats_after.live_blocks(), stats_before.live_blocks());
    assert_eq!(slice.read(b"k")?, Some(old));
    assert_eq!(slice.is_large(b"k"), Some(false));
    Ok(())
}

#[test]
fn scenario_d_through_buffering_wrapper() -> Result<()> {
    let (blocks, slice) = open(1 << 20)?;
    put(&slice, b"k", &[b'q'; 40])?;
    let result =
        slice.append_or_prepend(b"k", failing(10, 3), Direction::Prepend, CasTime::default())?;
    assert_eq!(result, AppendPrependResult::ProviderFailed);
    assert_eq!(slice.read(b"k")?, Some(vec![b'q'; 40]));
    assert_eq!(blocks.stats().live_blocks(), 0);
    Ok(())
}

#[test]
fn scenario_e_too_large_allocates_nothing() -> Result<()> {
    let (blocks, slice) = open(1000)?;
    put(&slice, b"k", &[b'a'; 990])?;
    let stats_before = blocks.stats();
    let mut provider = BufferedDataProvider::copy_from(&[b'b'; 11]);
    let result = slice.append_or_prepend(
        b"k",
        &mut provider,
        Direction::Append,
        CasTime::default(),
    )?;
    assert_eq!(result, AppendPrependResult::TooLarge);
    assert!(provider.is_consumed());
    let stats_after = blocks.stats();
    assert_eq!(stats_after.allocated, stats_before.allocated);
    assert_eq!(stats_after.live_blocks(), stats_before.live_blocks());
    assert_eq!(slice.read(b"k")?, Some(vec![b'a'; 990]));
    Ok(())
}

#[test]
fn missing_key_is_not_found() -> Result<()> {
    let (_blocks, slice) = open(1 << 20)?;
    assert_eq!(
        grow(&slice, b"absent", b"x", Direction::Prepend)?,
        AppendPrependResult::NotFound
    );
    assert!(slice.is_empty());
    Ok(())
}

#[test]
fn large_undo_restores_shape_on_both_ends() -> Result<()> {
    let (blocks, slice) = open(1 << 20)?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let old = random_bytes(&mut rng, 9_000);
    put(&slice, b"k", &old)?;
    // shift the origin so the head segment is partially used
    grow(&slice, b"k", &random_bytes(&mut rng, 333), Direction::Prepend)?;
    let expected = slice.read(b"k")?.unwrap();
    let ids = segment_ids(&slice, b"k")?;
    let live = blocks.stats().live_blocks();

    for (direction, size) in [
        (Direction::Append, 5_000),
        (Direction::Prepend, 5_000),
        (Direction::Prepend, 100),
        (Direction::Append, 1),
    ] {
        let mut oper = AppendPrependOper::new(failing(size, size / 2), direction);
        let result = slice.run_modify(b"k", &mut oper, CasTime::default())?;
        assert_eq!(result, AppendPrependResult::ProviderFailed);
        assert_eq!(segment_ids(&slice, b"k")?, ids, "{direction:?} {size}");
        assert_eq!(blocks.stats().live_blocks(), live);
        assert_eq!(slice.read(b"k")?.as_deref(), Some(&expected[..]));
    }
    Ok(())
}

#[test]
fn seeded_random_mix_matches_model() -> Result<()> {
    const LIMIT: usize = 256 * 1024;
    let (blocks, slice) = open(LIMIT as u64)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5E6_4B1F);
    let mut model: Vec<u8> = Vec::new();
    put(&slice, b"k", &model)?;

    for step in 0..300 {
        let len = match rng.gen_range(0..10) {
            0 => 0,
            1..=6 => rng.gen_range(1..40),
            _ => rng.gen_range(40..3_000),
        };
        let direction = if rng.gen_bool(0.5) {
            Direction::Append
        } else {
            Direction::Prepend
        };
        let fits = model.len() + len <= LIMIT;
        if rng.gen_ratio(1, 8) && len > 0 {
            let result = slice.append_or_prepend(
                b"k",
                failing(len, rng.gen_range(0..len)),
                direction,
                CasTime::default(),
            )?;
            let expected = if fits {
                AppendPrependResult::ProviderFailed
            } else {
                AppendPrependResult::TooLarge
            };
            assert_eq!(result, expected, "step {step}");
            continue;
        }
        let bytes = random_bytes(&mut rng, len);
        let result = grow(&slice, b"k", &bytes, direction)?;
        if !fits {
            assert_eq!(result, AppendPrependResult::TooLarge);
            continue;
        }
        assert_eq!(result, AppendPrependResult::Success, "step {step}");
        match direction {
            Direction::Append => model.extend_from_slice(&bytes),
            Direction::Prepend => {
                let mut next = bytes.clone();
                next.extend_from_slice(&model);
                model = next;
            }
        }
        assert_eq!(slice.is_large(b"k"), Some(model.len() > MAX_INLINE));
    }
    assert_eq!(slice.read(b"k")?, Some(model.clone()));

    assert!(slice.delete(b"k")?);
    assert_eq!(blocks.stats().live_blocks(), 0);
    Ok(())
}

#[test]
fn concurrent_appends_to_one_key_interleave_whole_chunks() -> Result<()> {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;
    const CHUNK: usize = 24;

    let (_blocks, slice) = open(1 << 20)?;
    put(&slice, b"shared", b"")?;
    thread::scope(|scope| {
        for t in 0..THREADS {
            let slice = &slice;
            scope.spawn(move || {
                let chunk = [t as u8; CHUNK];
                for _ in 0..PER_THREAD {
                    let result = grow(slice, b"shared", &chunk, Direction::Append)
                        .expect("append");
                    assert_eq!(result, AppendPrependResult::Success);
                }
            });
        }
    });

    let value = slice.read(b"shared")?.unwrap();
    assert_eq!(value.len(), THREADS * PER_THREAD * CHUNK);
    let mut counts = [0usize; THREADS];
    for chunk in value.chunks(CHUNK) {
        assert!(chunk.iter().all(|&b| b == chunk[0]), "torn chunk");
        counts[chunk[0] as usize] += 1;
    }
    assert!(counts.iter().all(|&c| c == PER_THREAD));
    Ok(())
}

#[test]
fn concurrent_prepends_to_many_keys() -> Result<()> {
    const THREADS: usize = 6;
    let (blocks, slice) = open(1 << 20)?;
    for t in 0..THREADS {
        put(&slice, format!("key-{t}").as_bytes(), b"tail")?;
    }
    thread::scope(|scope| {
        for t in 0..THREADS {
            let slice = &slice;
            scope.spawn(move || {
                let key = format!("key-{t}");
                for i in 0..40u8 {
                    grow(slice, key.as_bytes(), &[i; 100], Direction::Prepend).expect("prepend");
                }
            });
        }
    });
    for t in 0..THREADS {
        let value = slice.read(format!("key-{t}").as_bytes())?.unwrap();
        assert_eq!(value.len(), 4 + 40 * 100);
        assert_eq!(&value[..100], &[39u8; 100][..]);
        assert!(value.ends_with(b"tail"));
    }
    let stats = slice.stats();
    assert_eq!(stats.large_values, THREADS as u64);
    assert_eq!(
        stats.blocks.live_blocks(),
        blocks.stats().live_blocks(),
        "slice reports the same block store"
    );
    Ok(())
}

#[test]
fn stored_values_feed_other_keys() -> Result<()> {
    let (blocks, slice) = open(1 << 20)?;
    let large: Vec<u8> = (0..6000u32).map(|i| (i % 253) as u8).collect();
    put(&slice, b"big", &large)?;
    put(&slice, b"little", b"xyz")?;
    put(&slice, b"target", b"--")?;

    let mut source = slice.get(b"big")?.unwrap();
    assert!(source.is_large());
    let result = slice.append_or_prepend(
        b"target",
        &mut source,
        Direction::Append,
        CasTime::default(),
    )?;
    assert_eq!(result, AppendPrependResult::Success);
    assert!(source.is_consumed());
    drop(source);

    let mut source = slice.get(b"little")?.unwrap();
    assert!(!source.is_large());
    let result = slice.append_or_prepend(
        b"target",
        &mut source,
        Direction::Prepend,
        CasTime::default(),
    )?;
    assert_eq!(result, AppendPrependResult::Success);
    drop(source);

    let source = slice.get(b"big")?.unwrap();
    let result = slice.append_or_prepend(
        b"target",
        source,
        Direction::Prepend,
        CasTime::default(),
    )?;
    assert_eq!(result, AppendPrependResult::Success);

    let mut expected = large.clone();
    expected.extend_from_slice(b"xyz--");
    expected.extend_from_slice(&large);
    assert_eq!(slice.read(b"target")?, Some(expected));
    assert_eq!(slice.read(b"big")?, Some(large));

    for key in [&b"big"[..], b"little", b"target"] {
        assert!(slice.delete(key)?);
    }
    assert_eq!(blocks.stats().live_blocks(), 0);
    Ok(())
}

#[test]
fn held_value_feeds_many_large_keys() -> Result<()> {
    const KEYS: usize = 300;
    let (_blocks, slice) = open(1 << 20)?;
    let source: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
    put(&slice, b"source", &source)?;
    for i in 0..KEYS {
        put(&slice, format!("dest-{i}").as_bytes(), &[i as u8; 200])?;
    }

    let held = slice.get(b"source")?.unwrap();
    for i in 0..KEYS {
        let mut feed = slice.get(b"source")?.unwrap();
        let direction = if i % 2 == 0 {
            Direction::Append
        } else {
            Direction::Prepend
        };
        let result = slice.append_or_prepend(
            format!("dest-{i}").as_bytes(),
            &mut feed,
            direction,
            CasTime::default(),
        )?;
        assert_eq!(result, AppendPrependResult::Success);
    }
    drop(held);

    for i in 0..KEYS {
        let value = slice.read(format!("dest-{i}").as_bytes())?.unwrap();
        assert_eq!(value.len(), 5200);
        if i % 2 == 0 {
            assert_eq!(&value[..200], &[i as u8; 200][..]);
            assert_eq!(&value[200..], &source[..]);
        } else {
            assert_eq!(&value[..5000], &source[..]);
            assert_eq!(&value[5000..], &[i as u8; 200][..]);
        }
    }
    Ok(())
}

#[test]
fn stored_value_over_the_limit_is_too_large() -> Result<()> {
    let (blocks, slice) = open(8000)?;
    put(&slice, b"big", &[b'b'; 5000])?;
    put(&slice, b"k", &[b'k'; 3001])?;
    let live = blocks.stats().live_blocks();

    let mut source = slice.get(b"big")?.unwrap();
    let result = slice.append_or_prepend(b"k", &mut source, Direction::Append, CasTime::default())?;
    assert_eq!(result, AppendPrependResult::TooLarge);
    assert!(source.is_consumed());
    drop(source);

    assert_eq!(slice.read(b"k")?, Some(vec![b'k'; 3001]));
    assert_eq!(blocks.stats().live_blocks(), live);
    assert_eq!(grow(&slice, b"big", b"ok", Direction::Append)?, AppendPrependResult::Success);
    Ok(())
}

#[test]
fn overflowing_declared_size_is_too_large() -> Result<()> {
    let (blocks, slice) = open(1000)?;
    put(&slice, b"k", b"0123456789")?;
    let stats_before = blocks.stats();
    for direction in [Direction::Append, Direction::Prepend] {
        let stream = ReaderDataProvider::from_reader(Cursor::new(vec![1u8; 3]), usize::MAX - 5);
        let result = slice.append_or_prepend(b"k", stream, direction, CasTime::default())?;
        assert_eq!(result, AppendPrependResult::TooLarge);
    }
    assert_eq!(slice.read(b"k")?, Some(b"0123456789".to_vec()));
    assert_eq!(blocks.stats().allocated, stats_before.allocated);
    Ok(())
}
