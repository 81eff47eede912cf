//! Multi-venue book merge and snapshot library.
//!
//! This crate provides the core types and logic used by the `book_merge`
//! binary and the `inspect` tool:
//!
//! - `record`: fixed-size on-disk schema (header, fills, top-of-book,
//!   venue-tagged entries) and a chunked record reader
//! - `merge`: k-way timestamp merge of per-venue files with header patch-up
//! - `book`: cross-venue top-3 ladder, latest-quote table and change-only
//!   snapshot generation
//! - `consolidate`: file-level snapshot pass over venue-tagged merged tops
//! - `verify`: read-only header count and ordering checks
//! - `layout`: trading-day directory conventions
pub mod record;
pub mod merge;
pub mod book;
pub mod consolidate;
pub mod verify;
pub mod layout;
