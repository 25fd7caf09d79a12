#![allow(missing_docs)]

use std::io::{Cursor, Write};
use std::sync::Arc;

use segkv::{
    admin::ControlRegistry,
    primitives::blocks::BlockStore,
    storage::{
        provider::collect, BufferedDataProvider, CasTime, DataProvider, Direction,
        EngineOptions, ReaderDataProvider, SetResult, ValueHeader,
    },
    types::Result,
};
use tempfile::NamedTempFile;

fn engine() -> EngineOptions {
    let mut opts = EngineOptions::default();
    opts.store.block_size = 512;
    opts.slice.max_inline_size = 48;
    opts.slice.max_value_size = 16 * 1024;
    opts.slice.buffer_threshold = 64;
    opts
}

#[test]
fn set_get_delete_across_representations() -> Result<()> {
    let slice = engine().open()?;
    let header = ValueHeader {
        flags: 0xABCD,
        exptime: 0,
        cas: None,
    };
    let cases: [(&[u8], usize); 4] = [
        (b"empty", 0),
        (b"small", 48),
        (b"large", 49),
        (b"huge", 15_000),
    ];
    for (key, len) in cases {
        let bytes: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let result = slice.set(
            key,
            BufferedDataProvider::copy_from(&bytes),
            header,
            CasTime::default(),
        )?;
        assert_eq!(result, SetResult::Stored);
        assert_eq!(slice.read(key)?, Some(bytes));
        assert_eq!(slice.is_large(key), Some(len > 48));
        assert_eq!(slice.header(key)?.map(|h| h.flags), Some(0xABCD));
    }
    assert_eq!(slice.len(), 4);
    for (key, _) in cases {
        assert!(slice.delete(key)?);
    }
    assert!(slice.is_empty());
    assert_eq!(slice.stats().blocks.live_blocks(), 0);
    Ok(())
}

#[test]
fn streamed_set_from_reader() -> Result<()> {
    let slice = engine().open()?;
    let data: Vec<u8> = (0..5_000u32).map(|i| (i % 97) as u8).collect();
    let provider = ReaderDataProvider::from_reader(Cursor::new(data.clone()), data.len());
    let result = slice.set(b"stream", provider, ValueHeader::default(), CasTime::default())?;
    assert_eq!(result, SetResult::Stored);

    let mut provider = slice.get(b"stream")?.unwrap();
    assert_eq!(provider.size(), data.len());
    assert_eq!(collect(&mut provider)?, data);
    assert!(provider.is_consumed());
    Ok(())
}

#[test]
fn short_reader_is_provider_failure() -> Result<()> {
    let slice = engine().open()?;
    slice.set(
        b"k",
        BufferedDataProvider::copy_from(b"original"),
        ValueHeader::default(),
        CasTime::default(),
    )?;
    let short = ReaderDataProvider::from_reader(Cursor::new(vec![1u8; 100]), 1_000);
    let result = slice.set(b"k", short, ValueHeader::default(), CasTime::default())?;
    assert_eq!(result, SetResult::ProviderFailed);
    assert_eq!(slice.read(b"k")?, Some(b"original".to_vec()));
    assert_eq!(slice.stats().blocks.live_blocks(), 0);
    Ok(())
}

#[test]
fn modify_restamps_cas_and_recency() -> Result<()> {
    let slice = engine().open()?;
    let header = ValueHeader {
        flags: 1,
        exptime: 77,
        cas: Some(0),
    };
    slice.set(
        b"k",
        BufferedDataProvider::copy_from(b"abc"),
        header,
        CasTime {
            cas: 10,
            timestamp: 100,
        },
    )?;
    slice.append_or_prepend(
        b"k",
        BufferedDataProvider::copy_from(&[b'd'; 60]),
        Direction::Append,
        CasTime {
            cas: 11,
            timestamp: 200,
        },
    )?;
    let stored = slice.header(b"k")?.unwrap();
    assert_eq!(stored.cas, Some(11));
    assert_eq!(stored.exptime, 77);
    assert_eq!(slice.recency(b"k"), Some(200));

    let before = slice.stats();
    let result = slice.append_or_prepend(
        b"missing",
        BufferedDataProvider::copy_from(b"x"),
        Direction::Prepend,
        CasTime {
            cas: 12,
            timestamp: 300,
        },
    )?;
    assert_eq!(result, segkv::AppendPrependResult::NotFound);
    let after = slice.stats();
    assert_eq!(after.kept, before.kept + 1);
    assert_eq!(slice.recency(b"k"), Some(200));
    Ok(())
}

#[test]
fn stats_control_registered_globally() -> Result<()> {
    let slice = Arc::new(engine().open()?);
    slice.set(
        b"a",
        BufferedDataProvider::copy_from(&[0u8; 1_000]),
        ValueHeader::default(),
        CasTime::default(),
    )?;
    let control = ControlRegistry::global()
        .register("slice-ops-stats", "report slice counters", slice.stats_control())
        .expect("register control");
    let report = ControlRegistry::global().exec(&["slice-ops-stats"]);
    assert!(report.contains("keys: 1\r\n"), "{report}");
    assert!(report.contains("large_values: 1\r\n"), "{report}");
    assert!(ControlRegistry::global()
        .help()
        .contains("slice-ops-stats: report slice counters\r\n"));
    drop(control);
    assert!(!ControlRegistry::global().contains("slice-ops-stats"));
    Ok(())
}

#[test]
fn config_file_drives_open() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    writeln!(
        file,
        "[store]\nblock_size = 256\nmax_blocks = 8\n\n[slice]\nmax_inline_size = 16\nmax_value_size = 1500\n"
    )?;
    let opts = EngineOptions::load(file.path()).expect("config parses");
    let slice = opts.open()?;
    assert_eq!(slice.limits().max_inline_size, 16);
    assert_eq!(slice.large_buffers().segment_size(), 256);

    // six segments plus the root, leaving one free block
    let fits = vec![3u8; 1_500];
    let result = slice.set(
        b"k",
        BufferedDataProvider::copy_from(&fits),
        ValueHeader::default(),
        CasTime::default(),
    )?;
    assert_eq!(result, SetResult::Stored);
    assert!(matches!(
        slice.set(
            b"other",
            BufferedDataProvider::copy_from(&fits[..100]),
            ValueHeader::default(),
            CasTime::default(),
        ),
        Err(segkv::KvError::NoSpace)
    ));
    assert_eq!(slice.read(b"other")?, None);
    assert_eq!(slice.large_buffers().block_store().stats().live_blocks(), 7);
    Ok(())
}
