//! Integration tests for the count pipeline
//!
//! These tests drive the shard counter, the converters and the full
//! threaded pipeline, and check that the different execution paths agree.

use proptest::prelude::*;
use stemcount_lib::counter::batch::StemUpdate;
use stemcount_lib::counter::convert::{convert_in_memory, convert_shard};
use stemcount_lib::counter::shard::ShardCounter;
use stemcount_lib::counter::spill::SliceStore;
use stemcount_lib::serialization::{self, RecordKind, TableView};
use stemcount_lib::{
    kmer, Chunk, CountConfiguration, CountPipeline, Orientation, PreFilter, RootTable, SampleKind,
};
use tempfile::TempDir;

const K: usize = 7;
const STEM_LEN: usize = K - 2;

/// Stems used by the generated updates; pairs are reverse complements
const STEM_POOL: [&[u8]; 8] = [
    b"ACGTT", b"AACGT", b"GGTAC", b"GTACC", b"ACGTA", b"TACGT", b"AATTA", b"CCCCC",
];

fn shard_config(use_cache: bool) -> CountConfiguration {
    CountConfiguration {
        use_cache,
        table_target_size: 64,
        cache_target_size: 64,
        ..CountConfiguration::new(K).unwrap()
    }
}

fn to_update(&(stem, first, last, tumor): &(usize, u8, u8, bool)) -> StemUpdate {
    StemUpdate {
        key: kmer::encode(STEM_POOL[stem]),
        first,
        last,
        kind: if tumor { SampleKind::Tumor } else { SampleKind::Normal },
    }
}

/// Apply updates on one shard and convert in memory
fn count_in_memory(updates: &[StemUpdate], use_cache: bool, filter: Option<&PreFilter>) -> RootTable {
    let mut counter = ShardCounter::new(0, &shard_config(use_cache), None, None);
    for update in updates {
        counter.apply(update);
    }
    counter.finish_ingestion();
    convert_in_memory(counter.into_parts().table, STEM_LEN, filter).0
}

/// Apply updates on one shard, spilling every few updates, and convert from slices
fn count_with_slices(updates: &[StemUpdate], filter: Option<PreFilter>) -> RootTable {
    let dir = TempDir::new().unwrap();
    let config = CountConfiguration {
        spill: true,
        table_target_size: 2,
        spill_fraction: 0.5,
        pre_filter: filter,
        ..shard_config(true)
    };
    let store = SliceStore::new(dir.path(), 1, 0, STEM_LEN).unwrap();
    let mut counter = ShardCounter::new(0, &config, None, Some(store));
    for (i, update) in updates.iter().enumerate() {
        counter.apply(update);
        if i % 3 == 2 {
            counter.maybe_spill().unwrap();
        }
    }
    counter.finish_ingestion();
    convert_shard(counter.into_parts(), &config).unwrap().0
}

fn updates_strategy() -> impl Strategy<Value = Vec<(usize, u8, u8, bool)>> {
    prop::collection::vec((0..STEM_POOL.len(), 0..4u8, 0..4u8, any::<bool>()), 1..150)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_arrival_order_does_not_matter(
        (ordered, shuffled) in updates_strategy()
            .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
    ) {
        let ordered: Vec<StemUpdate> = ordered.iter().map(to_update).collect();
        let shuffled: Vec<StemUpdate> = shuffled.iter().map(to_update).collect();
        prop_assert_eq!(
            count_in_memory(&ordered, true, None),
            count_in_memory(&shuffled, true, None)
        );
    }

    #[test]
    fn prop_cache_does_not_change_counts(raw in updates_strategy()) {
        let updates: Vec<StemUpdate> = raw.iter().map(to_update).collect();
        prop_assert_eq!(
            count_in_memory(&updates, true, None),
            count_in_memory(&updates, false, None)
        );
    }

    #[test]
    fn prop_slices_match_in_memory(raw in updates_strategy(), filtered in any::<bool>()) {
        let updates: Vec<StemUpdate> = raw.iter().map(to_update).collect();
        let filter = filtered.then_some(PreFilter {
            max_normal: 1,
            min_tumor: 2,
            max_tumor: 1,
            min_normal: 2,
        });
        prop_assert_eq!(
            count_with_slices(&updates, filter),
            count_in_memory(&updates, false, filter.as_ref())
        );
    }
}

#[test]
fn test_three_identical_stems_cache_on_and_off() {
    let update = to_update(&(2, 1, 3, true));
    let updates = [update, update, update];

    let cached = count_in_memory(&updates, true, None);
    let uncached = count_in_memory(&updates, false, None);
    assert_eq!(cached, uncached);
    assert_eq!(cached.get_stem(update.key).unwrap().get(1, 3, SampleKind::Tumor), 3);
}

#[test]
fn test_counter_saturates() {
    let update = to_update(&(0, 2, 2, false));
    let updates = vec![update; 70_000];
    let table = count_in_memory(&updates, true, None);
    assert_eq!(table.get_stem(update.key).unwrap().get(2, 2, SampleKind::Normal), u16::MAX);

    // summing slices saturates the same way
    let table = count_with_slices(&updates, None);
    assert_eq!(table.get_stem(update.key).unwrap().get(2, 2, SampleKind::Normal), u16::MAX);
}

#[test]
fn test_reverse_complement_reads_share_root() {
    let config = CountConfiguration {
        num_loaders: 2,
        num_shards: 4,
        ..CountConfiguration::new(30).unwrap()
    };
    let pipeline = CountPipeline::with_uniform_router(config, None).unwrap();
    let chunks = vec![
        Chunk::from_sequences("normal", &["A".repeat(30)], SampleKind::Normal),
        Chunk::from_sequences("tumor", &["T".repeat(30)], SampleKind::Tumor),
    ];
    let table = pipeline.run(&chunks).unwrap().table;

    assert_eq!(table.len(), 1);
    let root = kmer::encode("A".repeat(28).as_bytes());
    let value = table.get(root).unwrap();

    let forward = value.get(Orientation::Forward);
    assert_eq!(forward.get(0, 0, SampleKind::Normal), 1);
    assert_eq!(forward.total(), 1);

    let reverse = value.get(Orientation::Reverse);
    assert_eq!(reverse.get(3, 3, SampleKind::Tumor), 1);
    assert_eq!(reverse.total(), 1);
}

/// Deterministic pseudo-random reads over a small alphabet of motifs
fn synthetic_reads(seed: u64, num_reads: usize, len: usize) -> Vec<String> {
    let mut state = seed;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let motifs = ["ACGTTGCA", "GGATCC", "TTTTAAAA", "CAGTN", "ACGTTGCA"];
    (0..num_reads)
        .map(|_| {
            let mut read = String::with_capacity(len + 8);
            while read.len() < len {
                let r = next();
                if r % 3 == 0 {
                    read.push_str(motifs[(r >> 8) as usize % motifs.len()]);
                } else {
                    read.push(b"ACGT"[(r >> 16) as usize % 4] as char);
                }
            }
            read.truncate(len);
            read
        })
        .collect()
}

fn synthetic_chunks() -> Vec<Chunk> {
    let normal = synthetic_reads(0x9E37_79B9_7F4A_7C15, 60, 80);
    let mut tumor = synthetic_reads(0xD1B5_4A32_D192_ED03, 60, 80);
    // shared reads give the pre-filter something to keep and something to drop
    tumor.extend(normal.iter().take(20).cloned());
    vec![
        Chunk::from_sequences("normal.0", &normal[..30], SampleKind::Normal),
        Chunk::from_sequences("normal.1", &normal[30..], SampleKind::Normal),
        Chunk::from_sequences("tumor.0", &tumor, SampleKind::Tumor),
    ]
}

fn pipeline_config(tmp: &TempDir) -> CountConfiguration {
    CountConfiguration {
        num_loaders: 2,
        num_shards: 3,
        batch_size: 16,
        queue_capacity: 2,
        table_target_size: 64,
        cache_target_size: 64,
        converter_threads: 2,
        tmp_dirname: tmp.path().join("slices"),
        ..CountConfiguration::new(15).unwrap()
    }
}

#[test]
fn test_pipeline_paths_agree() {
    let tmp = TempDir::new().unwrap();
    let chunks = synthetic_chunks();
    let run = |config: CountConfiguration| {
        CountPipeline::with_uniform_router(config, None)
            .unwrap()
            .run(&chunks)
            .unwrap()
    };

    let base = run(pipeline_config(&tmp));
    assert!(base.table.len() > 100);

    let uncached = run(CountConfiguration {
        use_cache: false,
        ..pipeline_config(&tmp)
    });
    assert_eq!(uncached.table, base.table);

    let spilled = run(CountConfiguration {
        spill: true,
        spill_fraction: 0.25,
        ..pipeline_config(&tmp)
    });
    assert!(spilled.counter_stats.spills > 0);
    assert_eq!(spilled.table, base.table);
    // slices are removed after conversion
    assert_eq!(std::fs::read_dir(tmp.path().join("slices")).unwrap().count(), 0);

    let one_loader = run(CountConfiguration {
        num_loaders: 1,
        ..pipeline_config(&tmp)
    });
    assert_eq!(one_loader.table, base.table);
}

#[test]
fn test_pipeline_pre_filter_agrees_across_strategies() {
    let tmp = TempDir::new().unwrap();
    let chunks = synthetic_chunks();
    let filter = PreFilter {
        max_normal: 0,
        min_tumor: 2,
        max_tumor: 0,
        min_normal: 2,
    };
    let in_memory = CountPipeline::with_uniform_router(
        CountConfiguration {
            pre_filter: Some(filter),
            ..pipeline_config(&tmp)
        },
        None,
    )
    .unwrap()
    .run(&chunks)
    .unwrap();
    let spilled = CountPipeline::with_uniform_router(
        CountConfiguration {
            pre_filter: Some(filter),
            spill: true,
            spill_fraction: 0.25,
            ..pipeline_config(&tmp)
        },
        None,
    )
    .unwrap()
    .run(&chunks)
    .unwrap();

    assert_eq!(in_memory.table, spilled.table);
    assert!(in_memory.convert_stats.stems_kept < in_memory.convert_stats.stems_read);
}

#[test]
fn test_table_file_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let result = CountPipeline::with_uniform_router(pipeline_config(&tmp), None)
        .unwrap()
        .run(&synthetic_chunks())
        .unwrap();

    let path = tmp.path().join("counts.bin");
    let header = serialization::write_table(&path, &result.table).unwrap();
    assert_eq!(header.kind, RecordKind::Root);
    assert_eq!(header.stem_len, 13);
    assert_eq!(header.num_entries, result.table.len() as u64);

    let mmap = serialization::map_file(&path).unwrap();
    let view = TableView::parse(&mmap).unwrap();
    assert_eq!(view.header(), &header);
    assert_eq!(
        view.bucket_counts().unwrap().iter().map(|&c| u64::from(c)).sum::<u64>(),
        header.num_entries
    );

    let restored = serialization::read_table(&path).unwrap();
    assert_eq!(restored, result.table);
}
