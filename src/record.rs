//! Fixed-size on-disk schema shared by every stage.
//!
//! Every file starts with a 24-byte [`FileHeader`] followed by fixed-size
//! entries. Records are little-endian with no padding. Record bodies are
//! encoded with `bincode`'s default fixed-int options, which lay struct fields
//! out back to back, so the Rust structs below *are* the wire layout.
//!
//! Merged files come in two shapes (see [`EntryLayout`]): plain records, or
//! records prefixed with the 8-byte `feed_id` of the venue they came from.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

pub const HEADER_SIZE: usize = 24;
pub const FILL_RECORD_SIZE: usize = 90;
pub const TOPS_RECORD_SIZE: usize = 88;
pub const VENUE_TAG_SIZE: usize = 8;
pub const TAGGED_TOPS_SIZE: usize = VENUE_TAG_SIZE + TOPS_RECORD_SIZE;
pub const BOOK_LEVELS: usize = 3;

/// One price unit is 1e-9 of the quoted currency.
pub const PRICE_SCALE: f64 = 1e9;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid header: need {expected} bytes, got {got}")]
    InvalidHeader { expected: usize, got: usize },

    #[error("truncated record: need {expected} bytes, got {got}")]
    TruncatedRecord { expected: usize, got: usize },

    #[error("malformed record: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Venue feed id for per-venue files; 0 for snapshot files.
    pub feed_id: u64,
    /// Trading date as `YYYYMMDD`.
    pub date: u32,
    /// Number of fixed-size entries following the header.
    pub record_count: u32,
    pub symbol_index: u64,
}

impl WireRecord for FileHeader {
    const SIZE: usize = HEADER_SIZE;
}

impl FileHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.encode()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::InvalidHeader { expected: HEADER_SIZE, got: bytes.len() });
        }
        Self::decode(bytes)
    }
}

pub fn decode_header(bytes: &[u8]) -> Result<FileHeader, CodecError> {
    FileHeader::from_bytes(bytes)
}

pub fn encode_header(header: &FileHeader) -> Result<Vec<u8>, CodecError> {
    header.to_bytes()
}

/// Read exactly one header from `r`.
pub fn read_header<R: Read>(r: &mut R) -> Result<FileHeader, CodecError> {
    let mut buf = [0u8; HEADER_SIZE];
    let got = read_up_to(r, &mut buf)?;
    FileHeader::from_bytes(&buf[..got])
}

/// A fixed-size record with an exact little-endian wire image.
pub trait WireRecord: Serialize + DeserializeOwned {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::SIZE {
            return Err(CodecError::TruncatedRecord { expected: Self::SIZE, got: bytes.len() });
        }
        Ok(bincode::deserialize(&bytes[..Self::SIZE])?)
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() != Self::SIZE {
            return Err(CodecError::TruncatedRecord { expected: Self::SIZE, got: bytes.len() });
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub ts: u64,
    pub seq_no: u64,
    pub resting_order_id: u64,
    pub was_hidden: bool,
    pub trade_price: i64,
    pub trade_qty: u32,
    pub execution_id: u64,
    pub resting_original_qty: u32,
    pub resting_remaining_qty: u32,
    pub resting_last_update_ts: u64,
    pub resting_side_is_bid: bool,
    pub resting_side_price: i64,
    pub resting_side_qty: u32,
    pub opposing_side_price: i64,
    pub opposing_side_qty: u32,
    pub resting_side_orders: u32,
}

impl WireRecord for FillRecord {
    const SIZE: usize = FILL_RECORD_SIZE;
}

/// One level of a venue's top-of-book. Zero price or qty means "no quote".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopLevel {
    pub bid_price: i64,
    pub ask_price: i64,
    pub bid_qty: u32,
    pub ask_qty: u32,
}

impl TopLevel {
    pub fn bid(&self) -> Option<(i64, u32)> {
        (self.bid_price != 0 && self.bid_qty != 0).then_some((self.bid_price, self.bid_qty))
    }

    pub fn ask(&self) -> Option<(i64, u32)> {
        (self.ask_price != 0 && self.ask_qty != 0).then_some((self.ask_price, self.ask_qty))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopsRecord {
    pub ts: u64,
    pub seq_no: u64,
    pub levels: [TopLevel; BOOK_LEVELS],
}

impl WireRecord for TopsRecord {
    const SIZE: usize = TOPS_RECORD_SIZE;
}

/// A top-of-book record prefixed with the feed id of its venue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedTops {
    pub source_id: u64,
    pub record: TopsRecord,
}

impl WireRecord for TaggedTops {
    const SIZE: usize = TAGGED_TOPS_SIZE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum RecordKind {
    Fills,
    Tops,
}

impl RecordKind {
    pub fn record_size(self) -> usize {
        match self {
            RecordKind::Fills => FILL_RECORD_SIZE,
            RecordKind::Tops => TOPS_RECORD_SIZE,
        }
    }

    /// Infix used in per-venue source file names.
    pub fn source_tag(self) -> &'static str {
        match self {
            RecordKind::Fills => "book_fills",
            RecordKind::Tops => "book_tops",
        }
    }

    /// Key used in merged output file names.
    pub fn merged_key(self) -> &'static str {
        match self {
            RecordKind::Fills => "fills",
            RecordKind::Tops => "tops",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.merged_key())
    }
}

/// Shape of the entries following the header of a merged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryLayout {
    /// Bare records, as produced per venue.
    Plain,
    /// Each record prefixed with its venue's `feed_id`.
    Tagged,
}

impl EntryLayout {
    pub fn from_tagged(tagged: bool) -> Self {
        if tagged { EntryLayout::Tagged } else { EntryLayout::Plain }
    }

    pub fn entry_size(self, kind: RecordKind) -> usize {
        self.tag_size() + kind.record_size()
    }

    pub fn tag_size(self) -> usize {
        match self {
            EntryLayout::Plain => 0,
            EntryLayout::Tagged => VENUE_TAG_SIZE,
        }
    }

    /// Byte offset of the leading record timestamp inside an entry.
    pub fn timestamp_offset(self) -> usize {
        self.tag_size()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Fill(FillRecord),
    Tops(TopsRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Fill(_) => RecordKind::Fills,
            Record::Tops(_) => RecordKind::Tops,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Record::Fill(r) => r.ts,
            Record::Tops(r) => r.ts,
        }
    }
}

pub fn decode_record(bytes: &[u8], kind: RecordKind) -> Result<Record, CodecError> {
    Ok(match kind {
        RecordKind::Fills => Record::Fill(FillRecord::decode(bytes)?),
        RecordKind::Tops => Record::Tops(TopsRecord::decode(bytes)?),
    })
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>, CodecError> {
    match record {
        Record::Fill(r) => r.encode(),
        Record::Tops(r) => r.encode(),
    }
}

/// Leading little-endian `u64` of `bytes`, if present.
pub fn leading_u64(bytes: &[u8]) -> Option<u64> {
    let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}

pub fn price_to_f64(price: i64) -> f64 {
    price as f64 / PRICE_SCALE
}

pub fn price_from_f64(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

/// Result of reading one fixed-size chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    Full(Vec<u8>),
    /// No bytes were left.
    Eof,
    /// Some bytes, but fewer than a whole record: a corrupt tail.
    Partial(usize),
}

/// Reads fixed-size entries from a byte stream.
pub struct RecordReader<R> {
    inner: R,
    size: usize,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, size: usize) -> Self {
        Self { inner, size }
    }

    pub fn entry_size(&self) -> usize {
        self.size
    }

    pub fn next_chunk(&mut self) -> io::Result<Chunk> {
        let mut buf = vec![0u8; self.size];
        let got = read_up_to(&mut self.inner, &mut buf)?;
        Ok(match got {
            0 => Chunk::Eof,
            n if n == self.size => Chunk::Full(buf),
            n => Chunk::Partial(n),
        })
    }
}

/// Fill `buf` as far as the stream allows; returns the number of bytes read.
pub(crate) fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
