//! File-level snapshot pass: venue-tagged merged tops in, snapshot file out.
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::book::{Consolidator, Snapshot, SnapshotReader};
use crate::record::{
    read_header, Chunk, FileHeader, RecordReader, TaggedTops, WireRecord, HEADER_SIZE,
    TAGGED_TOPS_SIZE, TOPS_RECORD_SIZE,
};

/// `feed_id` written into snapshot file headers.
pub const SNAPSHOT_FEED_ID: u64 = 0;

#[derive(Debug, Error)]
pub enum ConsolidateError {
    #[error(
        "input holds untagged 88-byte records ({data_len} data bytes for {declared} declared), \
         expected 96-byte venue-tagged entries"
    )]
    UntaggedInput { declared: u32, data_len: u64 },

    #[error("header declares {declared} tagged entries but the data region holds {data_len} bytes")]
    CountMismatch { declared: u32, data_len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidateSummary {
    pub output: PathBuf,
    pub entries_read: u64,
    pub snapshots: u32,
    pub venues: usize,
    pub header: FileHeader,
}

/// Accept only `declared` whole tagged entries, optionally followed by one
/// partial tagged entry. Anything shaped like bare top-of-book records is
/// reported as untagged; any other disagreement is a count mismatch.
fn check_tagged(declared: u32, data_len: u64) -> Result<(), ConsolidateError> {
    let plain = TOPS_RECORD_SIZE as u64;
    let tagged = TAGGED_TOPS_SIZE as u64;
    let n = declared as u64;
    if data_len == n * tagged {
        return Ok(());
    }
    if data_len / plain == n || data_len % plain == 0 {
        return Err(ConsolidateError::UntaggedInput { declared, data_len });
    }
    if data_len / tagged == n {
        return Ok(());
    }
    Err(ConsolidateError::CountMismatch { declared, data_len })
}

/// Run the consolidator over `input` and write the snapshot file to `output`.
pub fn consolidate_file(input: &Path, output: &Path) -> Result<ConsolidateSummary> {
    let file = File::open(input).with_context(|| format!("open {:?}", input))?;
    let file_len = file.metadata().with_context(|| format!("stat {:?}", input))?.len();
    let mut rdr = BufReader::new(file);
    let in_header = read_header(&mut rdr).with_context(|| format!("read header of {:?}", input))?;

    let data_len = file_len.saturating_sub(HEADER_SIZE as u64);
    check_tagged(in_header.record_count, data_len)?;
    info!(
        path = %input.display(),
        date = in_header.date,
        symbol_index = in_header.symbol_index,
        declared = in_header.record_count,
        "consolidating"
    );

    let out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("create snapshot output {:?}", output))?;
    let mut w = BufWriter::with_capacity(1 << 20, out);
    w.write_all(&[0u8; HEADER_SIZE])?;

    let mut reader = RecordReader::new(rdr, TAGGED_TOPS_SIZE);
    let mut consolidator = Consolidator::new();
    let mut entries_read: u64 = 0;
    let mut snapshots: u64 = 0;
    loop {
        match reader.next_chunk().with_context(|| format!("read {:?}", input))? {
            Chunk::Full(bytes) => {
                let entry = TaggedTops::decode(&bytes)?;
                entries_read += 1;
                if let Some(snap) = consolidator.apply(&entry) {
                    snap.write_to(&mut w)?;
                    snapshots += 1;
                }
                if entries_read % 100_000 == 0 {
                    debug!(entries_read, snapshots, "progress");
                }
            }
            Chunk::Eof => break,
            Chunk::Partial(got) => {
                warn!(path = %input.display(), got, "incomplete final entry skipped");
                break;
            }
        }
    }

    let Ok(count) = u32::try_from(snapshots) else {
        bail!("{snapshots} snapshots do not fit the header count");
    };
    let header = FileHeader {
        feed_id: SNAPSHOT_FEED_ID,
        date: in_header.date,
        record_count: count,
        symbol_index: in_header.symbol_index,
    };
    let mut out = w.into_inner().map_err(|e| e.into_error())?;
    out.seek(SeekFrom::Start(0))?;
    out.write_all(&header.to_bytes()?)?;
    out.flush()?;

    let venues = consolidator.table().len();
    info!(
        output = %output.display(),
        entries_read,
        snapshots = count,
        venues,
        "snapshot file written"
    );
    Ok(ConsolidateSummary {
        output: output.to_path_buf(),
        entries_read,
        snapshots: count,
        venues,
        header,
    })
}

/// Read every snapshot of a snapshot file, checking the header count.
pub fn read_snapshot_file(path: &Path) -> Result<(FileHeader, Vec<Snapshot>)> {
    let bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
    let header = FileHeader::from_bytes(&bytes).with_context(|| format!("header of {:?}", path))?;
    let mut reader = SnapshotReader::new(&bytes[HEADER_SIZE..]);
    let mut out = Vec::with_capacity(header.record_count as usize);
    while let Some(snap) = reader.next_snapshot()? {
        out.push(snap);
    }
    if out.len() != header.record_count as usize {
        bail!("{:?}: header declares {} snapshots, found {}", path, header.record_count, out.len());
    }
    Ok((header, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_shaped_region_is_rejected() {
        let untagged =
            |d, len| matches!(check_tagged(d, len), Err(ConsolidateError::UntaggedInput { .. }));
        assert!(untagged(3, 3 * 88));
        assert!(untagged(0, 2 * 88));
        // Plain records followed by a partial record.
        assert!(untagged(3, 3 * 88 + 50));
        // Plain records whose header count disagrees with the data.
        assert!(untagged(5, 3 * 88));
    }

    #[test]
    fn tagged_region_is_accepted() {
        assert!(check_tagged(3, 3 * 96).is_ok());
        assert!(check_tagged(0, 0).is_ok());
        // 11 * 96 == 12 * 88: a region matching the tagged count wins.
        assert!(check_tagged(11, 11 * 96).is_ok());
        // One partial tagged entry after the declared ones.
        assert!(check_tagged(3, 3 * 96 + 70).is_ok());
        assert!(check_tagged(20, 20 * 96 + 40).is_ok());
    }

    #[test]
    fn tagged_count_disagreement_is_rejected() {
        let mismatch =
            |d, len| matches!(check_tagged(d, len), Err(ConsolidateError::CountMismatch { .. }));
        assert!(mismatch(5, 3 * 96 + 70));
        assert!(mismatch(20, 19 * 96 + 40));
    }
}
