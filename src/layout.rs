//! On-disk conventions of a trading-day directory.
//!
//! ```text
//! {date_root}/
//!   {venue}/books/{VENUE}.book_fills.{SYMBOL}.bin
//!   {venue}/books/{VENUE}.book_tops.{SYMBOL}.bin
//!   mergedbooks/merged_fills.{SYMBOL}.bin
//!   mergedbooks/merged_tops.{SYMBOL}.bin
//!   mergedbooks/processed_tops.{SYMBOL}.bin
//! ```
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::Date;
use tracing::warn;

use crate::record::RecordKind;

/// Output directory under the date root; never treated as a venue.
pub const MERGED_DIR: &str = "mergedbooks";
const BOOKS_DIR: &str = "books";

/// Venue directories under `date_root`, sorted by name.
pub fn find_venues(date_root: &Path) -> Result<Vec<String>> {
    let mut venues = Vec::new();
    let entries = fs::read_dir(date_root).with_context(|| format!("list {:?}", date_root))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("list {:?}", date_root))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!(path = %entry.path().display(), "non UTF-8 directory name ignored");
            continue;
        };
        if !name.eq_ignore_ascii_case(MERGED_DIR) {
            venues.push(name);
        }
    }
    venues.sort();
    Ok(venues)
}

/// Split `VENUE.book_tops.SYMBOL.bin` into its kind and upper-cased symbol.
pub fn parse_source_name(file_name: &str) -> Option<(RecordKind, String)> {
    let stem = file_name.strip_suffix(".bin")?;
    let mut parts = stem.splitn(3, '.');
    let venue = parts.next()?;
    let tag = parts.next()?;
    let symbol = parts.next()?;
    if venue.is_empty() || symbol.is_empty() || symbol.contains('.') {
        return None;
    }
    let kind = [RecordKind::Fills, RecordKind::Tops]
        .into_iter()
        .find(|k| k.source_tag().eq_ignore_ascii_case(tag))?;
    Some((kind, symbol.to_ascii_uppercase()))
}

/// Every symbol with at least one fills or tops file in any venue.
pub fn discover_symbols(date_root: &Path, venues: &[String]) -> Result<Vec<String>> {
    let mut symbols = BTreeSet::new();
    for venue in venues {
        let books = date_root.join(venue).join(BOOKS_DIR);
        if !books.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&books).with_context(|| format!("list {:?}", books))? {
            let entry = entry.with_context(|| format!("list {:?}", books))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some((_, symbol)) = entry.file_name().to_str().and_then(parse_source_name) {
                symbols.insert(symbol);
            }
        }
    }
    Ok(symbols.into_iter().collect())
}

pub fn source_path(date_root: &Path, venue: &str, kind: RecordKind, symbol: &str) -> PathBuf {
    date_root
        .join(venue)
        .join(BOOKS_DIR)
        .join(format!("{}.{}.{}.bin", venue.to_ascii_uppercase(), kind.source_tag(), symbol))
}

/// Source files of one symbol, one per venue, in venue order.
pub fn source_paths(
    date_root: &Path,
    venues: &[String],
    kind: RecordKind,
    symbol: &str,
) -> Vec<PathBuf> {
    venues.iter().map(|v| source_path(date_root, v, kind, symbol)).collect()
}

pub fn merged_dir(date_root: &Path) -> PathBuf {
    date_root.join(MERGED_DIR)
}

pub fn merged_path(out_dir: &Path, kind: RecordKind, symbol: &str) -> PathBuf {
    out_dir.join(format!("merged_{}.{}.bin", kind.merged_key(), symbol))
}

pub fn snapshot_path(out_dir: &Path, symbol: &str) -> PathBuf {
    out_dir.join(format!("processed_tops.{}.bin", symbol))
}

/// Header `date` value for a `YYYYMMDD` date directory, if it is one.
pub fn date_from_root(date_root: &Path) -> Option<u32> {
    let name = date_root.file_name()?.to_str()?;
    let date = Date::parse(name, format_description!("[year][month][day]")).ok()?;
    Some(date.year() as u32 * 10_000 + u8::from(date.month()) as u32 * 100 + date.day() as u32)
}
