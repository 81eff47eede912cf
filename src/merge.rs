//! K-way timestamp merge of per-venue record files.
//!
//! Each source contributes one buffered "next record" to a binary min-heap,
//! so memory stays proportional to the number of venues regardless of file
//! sizes. Heap order is `(timestamp, raw record bytes, source index)`: ties on
//! timestamp fall back to byte order of the records, and the source index
//! makes the order total so reruns are byte-identical.
//!
//! The output header is written last. A merge that fails half way leaves a
//! zeroed placeholder header whose count cannot match the data region.
use anyhow::{Context, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::record::{
    leading_u64, read_header, Chunk, EntryLayout, FileHeader, RecordKind, RecordReader, HEADER_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub output: PathBuf,
    pub records: u32,
    pub sources_used: usize,
    pub sources_skipped: usize,
    /// Sources that ended in a partial record or a read error.
    pub sources_cut_short: usize,
    pub header: FileHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(MergeSummary),
    /// No source yielded a single record; no output was left behind.
    NothingToMerge,
}

impl MergeOutcome {
    pub fn summary(&self) -> Option<&MergeSummary> {
        match self {
            MergeOutcome::Merged(s) => Some(s),
            MergeOutcome::NothingToMerge => None,
        }
    }
}

struct Source {
    path: PathBuf,
    feed_id: u64,
    reader: RecordReader<BufReader<File>>,
    exhausted: bool,
    /// Ended in a partial record or a read error rather than a clean EOF.
    damaged: bool,
}

impl Source {
    /// Next record of this source, or `None` once it is drained or damaged.
    fn next_record(&mut self) -> Option<Vec<u8>> {
        if self.exhausted {
            return None;
        }
        match self.reader.next_chunk() {
            Ok(Chunk::Full(bytes)) => Some(bytes),
            Ok(Chunk::Eof) => {
                self.exhausted = true;
                None
            }
            Ok(Chunk::Partial(got)) => {
                warn!(
                    path = %self.path.display(),
                    got,
                    expected = self.reader.entry_size(),
                    "truncated trailing record, source stops here"
                );
                self.exhausted = true;
                self.damaged = true;
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "read failed, source stops here");
                self.exhausted = true;
                self.damaged = true;
                None
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    timestamp: u64,
    bytes: Vec<u8>,
    source: usize,
}

/// Merge `sources` (each sorted by timestamp) into `output`.
///
/// Missing, undersized and header-less sources are skipped with a warning.
/// With [`EntryLayout::Tagged`] every record is prefixed with the `feed_id`
/// from its own source header.
pub fn merge_sources(
    sources: &[PathBuf],
    kind: RecordKind,
    layout: EntryLayout,
    output: &Path,
) -> Result<MergeOutcome> {
    let mut open = Vec::with_capacity(sources.len());
    let mut first_header: Option<FileHeader> = None;
    let mut skipped = 0usize;

    for path in sources {
        match open_source(path, kind.record_size()) {
            Some((header, source)) => {
                first_header.get_or_insert(header);
                open.push(source);
            }
            None => skipped += 1,
        }
    }

    let mut heap = BinaryHeap::new();
    for (idx, src) in open.iter_mut().enumerate() {
        if let Some(bytes) = src.next_record() {
            heap.push(Reverse(pending(bytes, idx)));
        }
    }

    let header = match first_header {
        Some(h) if !heap.is_empty() => h,
        _ => {
            info!(kind = %kind, output = %output.display(), "nothing to merge");
            remove_placeholder(output)?;
            return Ok(MergeOutcome::NothingToMerge);
        }
    };

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("create merged output {:?}", output))?;
    let mut w = BufWriter::with_capacity(1 << 20, file);
    w.write_all(&[0u8; HEADER_SIZE])?;

    let mut written: u64 = 0;
    while let Some(Reverse(item)) = heap.pop() {
        let src = &mut open[item.source];
        if layout == EntryLayout::Tagged {
            w.write_all(&src.feed_id.to_le_bytes())?;
        }
        w.write_all(&item.bytes)?;
        written += 1;
        if let Some(bytes) = src.next_record() {
            heap.push(Reverse(pending(bytes, item.source)));
        }
    }

    let records = u32::try_from(written)
        .with_context(|| format!("{written} records do not fit the header count"))?;
    let header = FileHeader { record_count: records, ..header };

    let mut file = w.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes()?)?;
    file.flush()?;

    let cut_short = open.iter().filter(|s| s.damaged).count();
    let summary = MergeSummary {
        output: output.to_path_buf(),
        records,
        sources_used: open.len(),
        sources_skipped: skipped,
        sources_cut_short: cut_short,
        header,
    };
    info!(
        kind = %kind,
        output = %output.display(),
        records,
        sources = summary.sources_used,
        skipped,
        "merged"
    );
    Ok(MergeOutcome::Merged(summary))
}

fn pending(bytes: Vec<u8>, source: usize) -> Pending {
    let timestamp = leading_u64(&bytes).unwrap_or_default();
    Pending { timestamp, bytes, source }
}

/// Open one source and consume its header. `None` means "skip it".
fn open_source(path: &Path, record_size: usize) -> Option<(FileHeader, Source)> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "source missing, skipped");
            return None;
        }
    };
    if !meta.is_file() {
        warn!(path = %path.display(), "source is not a regular file, skipped");
        return None;
    }
    if meta.len() < HEADER_SIZE as u64 {
        warn!(path = %path.display(), size = meta.len(), "source smaller than header, skipped");
        return None;
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open source, skipped");
            return None;
        }
    };
    let mut rdr = BufReader::new(file);
    let header = match read_header(&mut rdr) {
        Ok(h) => h,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable header, skipped");
            return None;
        }
    };
    debug!(
        path = %path.display(),
        feed_id = header.feed_id,
        declared = header.record_count,
        "source opened"
    );
    let source = Source {
        path: path.to_path_buf(),
        feed_id: header.feed_id,
        reader: RecordReader::new(rdr, record_size),
        exhausted: false,
        damaged: false,
    };
    Some((header, source))
}

/// Remove a file at `path` that holds nothing but a zeroed header.
fn remove_placeholder(path: &Path) -> Result<()> {
    let Ok(meta) = fs::metadata(path) else { return Ok(()) };
    if meta.len() != HEADER_SIZE as u64 {
        return Ok(());
    }
    let bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
    if bytes.iter().all(|&b| b == 0) {
        fs::remove_file(path).with_context(|| format!("remove placeholder {:?}", path))?;
        info!(path = %path.display(), "removed empty placeholder");
    }
    Ok(())
}
