use book_merge::merge::{merge_sources, MergeOutcome};
use book_merge::record::{
    decode_header, EntryLayout, FileHeader, FillRecord, RecordKind, TaggedTops, TopsRecord,
    WireRecord, HEADER_SIZE, TAGGED_TOPS_SIZE, TOPS_RECORD_SIZE,
};
use book_merge::verify::verify_file;
use proptest::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn header(feed_id: u64, count: u32) -> FileHeader {
    FileHeader { feed_id, date: 20240105, record_count: count, symbol_index: 77 }
}

fn tops(ts: u64, seq: u64) -> TopsRecord {
    TopsRecord { ts, seq_no: seq, ..Default::default() }
}

fn write_tops(path: &Path, h: FileHeader, records: &[TopsRecord]) {
    let mut w = BufWriter::new(File::create(path).unwrap());
    w.write_all(&h.to_bytes().unwrap()).unwrap();
    for r in records {
        w.write_all(&r.encode().unwrap()).unwrap();
    }
    w.flush().unwrap();
}

fn write_venue(dir: &Path, name: &str, feed_id: u64, timestamps: &[u64]) -> PathBuf {
    let path = dir.join(name);
    let records: Vec<TopsRecord> =
        timestamps.iter().enumerate().map(|(i, &ts)| tops(ts, i as u64)).collect();
    write_tops(&path, header(feed_id, records.len() as u32), &records);
    path
}

fn read_entries(path: &Path, entry_size: usize) -> (FileHeader, Vec<Vec<u8>>) {
    let bytes = fs::read(path).unwrap();
    let h = decode_header(&bytes).unwrap();
    let body = &bytes[HEADER_SIZE..];
    assert_eq!(body.len() % entry_size, 0, "data region is not whole entries");
    (h, body.chunks(entry_size).map(|c| c.to_vec()).collect())
}

#[test]
fn merges_in_timestamp_order_and_patches_header() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_venue(dir.path(), "A.bin", 11, &[100, 300, 500]);
    let b = write_venue(dir.path(), "B.bin", 22, &[200, 400]);
    let out = dir.path().join("merged.bin");

    let outcome = merge_sources(&[a, b], RecordKind::Tops, EntryLayout::Plain, &out).unwrap();
    let summary = outcome.summary().expect("records merged");
    assert_eq!(summary.records, 5);
    assert_eq!(summary.sources_used, 2);
    assert_eq!(summary.sources_skipped, 0);

    let (h, entries) = read_entries(&out, TOPS_RECORD_SIZE);
    assert_eq!(h, header(11, 5));
    let ts: Vec<u64> = entries.iter().map(|e| TopsRecord::decode(e).unwrap().ts).collect();
    assert_eq!(ts, vec![100, 200, 300, 400, 500]);
}

#[test]
fn tagged_output_carries_each_source_feed_id() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_venue(dir.path(), "A.bin", 11, &[100, 300]);
    let b = write_venue(dir.path(), "B.bin", 22, &[200]);
    let out = dir.path().join("merged.bin");

    merge_sources(&[a, b], RecordKind::Tops, EntryLayout::Tagged, &out).unwrap();
    let (h, entries) = read_entries(&out, TAGGED_TOPS_SIZE);
    assert_eq!(h.record_count, 3);
    let tagged: Vec<(u64, u64)> = entries
        .iter()
        .map(|e| {
            let t = TaggedTops::decode(e).unwrap();
            (t.source_id, t.record.ts)
        })
        .collect();
    assert_eq!(tagged, vec![(11, 100), (22, 200), (11, 300)]);

    let report = verify_file(&out, RecordKind::Tops, EntryLayout::Tagged).unwrap();
    assert!(report.passed());
}

#[test]
fn equal_timestamps_break_ties_on_record_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A.bin");
    let b = dir.path().join("B.bin");
    // Same timestamp, B's record sorts first by its sequence bytes.
    write_tops(&a, header(1, 1), &[tops(100, 9)]);
    write_tops(&b, header(2, 1), &[tops(100, 3)]);
    let out = dir.path().join("merged.bin");

    merge_sources(&[a, b], RecordKind::Tops, EntryLayout::Tagged, &out).unwrap();
    let (_, entries) = read_entries(&out, TAGGED_TOPS_SIZE);
    let order: Vec<u64> =
        entries.iter().map(|e| TaggedTops::decode(e).unwrap().source_id).collect();
    assert_eq!(order, vec![2, 1]);
}

#[test]
fn unusable_sources_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_venue(dir.path(), "good.bin", 5, &[10, 20]);
    let missing = dir.path().join("missing.bin");
    let empty = dir.path().join("empty.bin");
    File::create(&empty).unwrap();
    let short = dir.path().join("short.bin");
    fs::write(&short, [1u8; HEADER_SIZE - 1]).unwrap();
    let out = dir.path().join("merged.bin");

    let sources = [missing, empty, short, good];
    let outcome = merge_sources(&sources, RecordKind::Tops, EntryLayout::Plain, &out).unwrap();
    let summary = outcome.summary().unwrap();
    assert_eq!(summary.sources_used, 1);
    assert_eq!(summary.sources_skipped, 3);
    assert_eq!(summary.records, 2);
    // Header fields come from the first source with a valid header.
    assert_eq!(summary.header.feed_id, 5);
}

#[test]
fn truncated_source_contributes_only_complete_records() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("trunc.bin");
    let records: Vec<TopsRecord> = (1..=3).map(|i| tops(i * 10, i)).collect();
    // Header claims 5 records; only 3 complete ones plus a partial tail are on disk.
    write_tops(&src, header(3, 5), &records);
    let mut f = fs::OpenOptions::new().append(true).open(&src).unwrap();
    f.write_all(&tops(40, 4).encode().unwrap()[..50]).unwrap();
    drop(f);
    let other = write_venue(dir.path(), "other.bin", 4, &[15]);
    let out = dir.path().join("merged.bin");

    let sources = [src.clone(), other];
    let outcome = merge_sources(&sources, RecordKind::Tops, EntryLayout::Plain, &out).unwrap();
    let summary = outcome.summary().unwrap();
    assert_eq!(summary.records, 4);
    assert_eq!(summary.sources_cut_short, 1);
    assert!(verify_file(&out, RecordKind::Tops, EntryLayout::Plain).unwrap().passed());

    let source_report = verify_file(&src, RecordKind::Tops, EntryLayout::Plain).unwrap();
    assert_eq!(source_report.declared_count, 5);
    assert_eq!(source_report.actual_count, 3);
    assert_eq!(source_report.trailing_bytes, 50);
    assert!(!source_report.count_matches);
    assert!(!source_report.passed());
}

#[test]
fn no_records_means_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let header_only = write_venue(dir.path(), "h.bin", 1, &[]);
    let out = dir.path().join("merged.bin");
    // A stale zeroed placeholder from an aborted run is cleaned up.
    fs::write(&out, [0u8; HEADER_SIZE]).unwrap();

    let outcome = merge_sources(
        &[header_only, dir.path().join("missing.bin")],
        RecordKind::Tops,
        EntryLayout::Plain,
        &out,
    )
    .unwrap();
    assert_eq!(outcome, MergeOutcome::NothingToMerge);
    assert!(!out.exists());

    let outcome = merge_sources(&[], RecordKind::Fills, EntryLayout::Plain, &out).unwrap();
    assert_eq!(outcome, MergeOutcome::NothingToMerge);
    assert!(!out.exists());
}

#[test]
fn rerun_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_venue(dir.path(), "A.bin", 1, &[5, 5, 9, 12]);
    let b = write_venue(dir.path(), "B.bin", 2, &[5, 7, 12]);
    let c = write_venue(dir.path(), "C.bin", 3, &[1, 12, 30]);
    let sources = vec![a, b, c];
    let out = dir.path().join("merged.bin");

    merge_sources(&sources, RecordKind::Tops, EntryLayout::Tagged, &out).unwrap();
    let first = fs::read(&out).unwrap();
    let first_crc = verify_file(&out, RecordKind::Tops, EntryLayout::Tagged).unwrap().data_crc32;
    merge_sources(&sources, RecordKind::Tops, EntryLayout::Tagged, &out).unwrap();
    assert_eq!(fs::read(&out).unwrap(), first);
    let rerun = verify_file(&out, RecordKind::Tops, EntryLayout::Tagged).unwrap();
    assert_eq!(rerun.data_crc32, first_crc);
}

#[test]
fn fills_merge_as_opaque_records() {
    let dir = tempfile::tempdir().unwrap();
    let fill = |ts: u64, exec: u64| FillRecord {
        ts,
        execution_id: exec,
        trade_qty: 1,
        resting_side_is_bid: true,
        ..Default::default()
    };
    let venues = [("A.bin", 1u64, vec![fill(10, 1), fill(30, 2)]), ("B.bin", 2, vec![fill(20, 3)])];
    let mut paths = Vec::new();
    for (name, feed, fills) in venues {
        let path = dir.path().join(name);
        let mut w = BufWriter::new(File::create(&path).unwrap());
        w.write_all(&header(feed, fills.len() as u32).to_bytes().unwrap()).unwrap();
        for f in &fills {
            w.write_all(&f.encode().unwrap()).unwrap();
        }
        w.flush().unwrap();
        paths.push(path);
    }
    let out = dir.path().join("merged_fills.bin");
    merge_sources(&paths, RecordKind::Fills, EntryLayout::Plain, &out).unwrap();

    let (h, entries) = read_entries(&out, RecordKind::Fills.record_size());
    assert_eq!(h.record_count, 3);
    let execs: Vec<u64> =
        entries.iter().map(|e| FillRecord::decode(e).unwrap().execution_id).collect();
    assert_eq!(execs, vec![1, 3, 2]);
    assert!(verify_file(&out, RecordKind::Fills, EntryLayout::Plain).unwrap().passed());
}

#[test]
fn verifier_flags_out_of_order_and_count_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.bin");
    write_tops(&path, header(1, 2), &[tops(10, 0), tops(30, 1), tops(20, 2)]);

    let report = verify_file(&path, RecordKind::Tops, EntryLayout::Plain).unwrap();
    assert_eq!(report.actual_count, 3);
    assert!(!report.count_matches);
    assert!(!report.order_correct);
    assert_eq!(report.first_out_of_order, Some(2));
    assert!(!report.passed());
}

#[test]
fn verifier_accepts_empty_file_and_rejects_headerless() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.bin");
    write_tops(&empty, header(1, 0), &[]);
    let report = verify_file(&empty, RecordKind::Tops, EntryLayout::Plain).unwrap();
    assert!(report.passed());
    assert_eq!(report.actual_count, 0);

    let tiny = dir.path().join("tiny.bin");
    fs::write(&tiny, [0u8; 10]).unwrap();
    assert!(verify_file(&tiny, RecordKind::Tops, EntryLayout::Plain).is_err());
}

#[test]
fn verifier_does_not_modify_input() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_venue(dir.path(), "A.bin", 1, &[3, 1, 2]);
    let before = fs::read(&path).unwrap();
    verify_file(&path, RecordKind::Tops, EntryLayout::Plain).unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
}

fn sorted_sources() -> impl Strategy<Value = Vec<Vec<u64>>> {
    prop::collection::vec(prop::collection::vec(0u64..1_000, 0..40), 1..6).prop_map(|mut sources| {
        for s in &mut sources {
            s.sort_unstable();
        }
        sources
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merged_output_is_sorted_and_complete(sources in sorted_sources()) {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = sources
            .iter()
            .enumerate()
            .map(|(i, ts)| write_venue(dir.path(), &format!("v{i}.bin"), i as u64 + 1, ts))
            .collect();
        let out = dir.path().join("merged.bin");
        let expected: usize = sources.iter().map(Vec::len).sum();

        match merge_sources(&paths, RecordKind::Tops, EntryLayout::Tagged, &out).unwrap() {
            MergeOutcome::NothingToMerge => {
                prop_assert_eq!(expected, 0);
                prop_assert!(!out.exists());
            }
            MergeOutcome::Merged(summary) => {
                prop_assert_eq!(summary.records as usize, expected);
                let (h, entries) = read_entries(&out, TAGGED_TOPS_SIZE);
                prop_assert_eq!(h.record_count as usize, entries.len());
                let ts: Vec<u64> =
                    entries.iter().map(|e| TaggedTops::decode(e).unwrap().record.ts).collect();
                let mut all: Vec<u64> = sources.concat();
                all.sort_unstable();
                prop_assert_eq!(ts, all);
                let report = verify_file(&out, RecordKind::Tops, EntryLayout::Tagged).unwrap();
                prop_assert!(report.passed());
            }
        }
    }
}
