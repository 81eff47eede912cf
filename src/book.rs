//! Cross-venue top-of-book ladder.
//!
//! This module holds the in-memory side of snapshot generation:
//! - [`QuoteTable`]: latest 3-level quote per venue, in arrival order
//! - [`Ladder`]: top distinct prices per side with the venues quoting them,
//!   recomputed from the whole table on every update
//! - [`Consolidator`]: change detection, emitting a [`Snapshot`] only when
//!   the ladder differs from the last one emitted
//! - the variable-length snapshot record codec ([`Snapshot::write_to`],
//!   [`SnapshotReader`])
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::record::{read_up_to, TaggedTops, TopLevel, BOOK_LEVELS};

/// Distinct prices kept per side.
pub const LADDER_DEPTH: usize = 3;

/// Fixed part of a snapshot record: timestamp plus two level counts.
pub const SNAPSHOT_HEAD_SIZE: usize = 10;
/// Fixed part of a level: price plus venue count.
pub const LEVEL_HEAD_SIZE: usize = 9;
/// One `(quantity, source_id)` pair.
pub const VENUE_ENTRY_SIZE: usize = 12;

/// One venue's contribution at a price. Orders by `(source_id, quantity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VenueQty {
    pub source_id: u64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: i64,
    /// Sorted, may repeat a venue quoting the same price on two levels.
    pub venues: Vec<VenueQty>,
}

impl PriceLevel {
    pub fn total_quantity(&self) -> u64 {
        self.venues.iter().map(|v| v.quantity as u64).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ladder {
    /// Best (highest) price first.
    pub bids: Vec<PriceLevel>,
    /// Best (lowest) price first.
    pub asks: Vec<PriceLevel>,
}

impl Ladder {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }
}

/// Latest quote per venue. Entries are overwritten, never removed.
#[derive(Debug, Default, Clone)]
pub struct QuoteTable {
    quotes: BTreeMap<u64, [TopLevel; BOOK_LEVELS]>,
}

impl QuoteTable {
    pub fn update(&mut self, source_id: u64, levels: [TopLevel; BOOK_LEVELS]) {
        self.quotes.insert(source_id, levels);
    }

    pub fn get(&self, source_id: u64) -> Option<&[TopLevel; BOOK_LEVELS]> {
        self.quotes.get(&source_id)
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Aggregate every live quote into at most `depth` prices per side.
    pub fn ladder(&self, depth: usize) -> Ladder {
        let mut bids: BTreeMap<i64, Vec<VenueQty>> = BTreeMap::new();
        let mut asks: BTreeMap<i64, Vec<VenueQty>> = BTreeMap::new();

        for (&source_id, levels) in &self.quotes {
            for lvl in levels {
                if let Some((price, quantity)) = lvl.bid() {
                    bids.entry(price).or_default().push(VenueQty { source_id, quantity });
                }
                if let Some((price, quantity)) = lvl.ask() {
                    asks.entry(price).or_default().push(VenueQty { source_id, quantity });
                }
            }
        }

        Ladder {
            bids: take_levels(bids.into_iter().rev(), depth),
            asks: take_levels(asks.into_iter(), depth),
        }
    }
}

fn take_levels(
    groups: impl Iterator<Item = (i64, Vec<VenueQty>)>,
    depth: usize,
) -> Vec<PriceLevel> {
    groups
        .take(depth)
        .map(|(price, mut venues)| {
            venues.sort_unstable();
            PriceLevel { price, venues }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp: u64,
    pub ladder: Ladder,
}

impl Snapshot {
    pub fn encoded_len(&self) -> usize {
        let levels = self.ladder.bids.iter().chain(&self.ladder.asks);
        SNAPSHOT_HEAD_SIZE
            + levels.map(|l| LEVEL_HEAD_SIZE + l.venues.len() * VENUE_ENTRY_SIZE).sum::<usize>()
    }

    /// Write the variable-length record. Counts are single bytes, so a side
    /// or level exceeding 255 entries is rejected before anything is written.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let levels = || self.ladder.bids.iter().chain(&self.ladder.asks);
        if let Some(l) = levels().find(|l| l.venues.len() > u8::MAX as usize) {
            bail!("{} venues at price {} exceed the per-level limit", l.venues.len(), l.price);
        }
        let n_bids = u8::try_from(self.ladder.bids.len());
        let n_asks = u8::try_from(self.ladder.asks.len());
        let (Ok(n_bids), Ok(n_asks)) = (n_bids, n_asks) else {
            bail!("too many levels in snapshot at {}", self.timestamp);
        };

        let mut out = Vec::with_capacity(self.encoded_len());
        bincode::serialize_into(&mut out, &(self.timestamp, n_bids, n_asks))?;
        for level in levels() {
            bincode::serialize_into(&mut out, &(level.price, level.venues.len() as u8))?;
            for v in &level.venues {
                bincode::serialize_into(&mut out, &(v.quantity, v.source_id))?;
            }
        }
        w.write_all(&out)?;
        Ok(())
    }
}

/// Sequential reader over the snapshot records of a snapshot file body.
pub struct SnapshotReader<R> {
    inner: R,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next snapshot, `Ok(None)` at a clean end, error on a truncated record.
    pub fn next_snapshot(&mut self) -> Result<Option<Snapshot>> {
        let mut head = [0u8; SNAPSHOT_HEAD_SIZE];
        match read_up_to(&mut self.inner, &mut head)? {
            0 => return Ok(None),
            SNAPSHOT_HEAD_SIZE => {}
            _ => bail!("snapshot record truncated"),
        }
        let (timestamp, n_bids, n_asks): (u64, u8, u8) = bincode::deserialize(&head)?;
        let bids = self.read_levels(n_bids as usize)?;
        let asks = self.read_levels(n_asks as usize)?;
        Ok(Some(Snapshot { timestamp, ladder: Ladder { bids, asks } }))
    }

    fn read_levels(&mut self, count: usize) -> Result<Vec<PriceLevel>> {
        let mut levels = Vec::with_capacity(count);
        for _ in 0..count {
            let (price, n): (i64, u8) =
                bincode::deserialize_from(&mut self.inner).map_err(truncated)?;
            let mut venues = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let (quantity, source_id): (u32, u64) =
                    bincode::deserialize_from(&mut self.inner).map_err(truncated)?;
                venues.push(VenueQty { source_id, quantity });
            }
            levels.push(PriceLevel { price, venues });
        }
        Ok(levels)
    }
}

fn truncated(e: bincode::Error) -> anyhow::Error {
    if let bincode::ErrorKind::Io(err) = &*e {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return anyhow::anyhow!("snapshot record truncated");
        }
    }
    e.into()
}

/// Change-only snapshot generator over a venue-tagged top-of-book stream.
#[derive(Debug, Default)]
pub struct Consolidator {
    table: QuoteTable,
    last_emitted: Option<Ladder>,
}

impl Consolidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one entry into the table. Returns a snapshot when the ladder
    /// changed since the last emission; empty ladders are never emitted.
    pub fn apply(&mut self, entry: &TaggedTops) -> Option<Snapshot> {
        self.table.update(entry.source_id, entry.record.levels);
        let ladder = self.table.ladder(LADDER_DEPTH);
        if ladder.is_empty() || self.last_emitted.as_ref() == Some(&ladder) {
            return None;
        }
        self.last_emitted = Some(ladder.clone());
        Some(Snapshot { timestamp: entry.record.ts, ladder })
    }

    pub fn table(&self) -> &QuoteTable {
        &self.table
    }

    pub fn last_emitted(&self) -> Option<&Ladder> {
        self.last_emitted.as_ref()
    }
}
