use anyhow::{Context, Result};
use book_merge::book::PriceLevel;
use book_merge::consolidate::read_snapshot_file;
use book_merge::record::{
    decode_record, leading_u64, price_to_f64, read_header, Chunk, EntryLayout, FileHeader, Record,
    RecordKind, RecordReader,
};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(about = "Print the header and leading records of a merged or snapshot file")]
struct Args {
    /// Input file path to read
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Record kind of a merged file; omit to read a snapshot file
    #[arg(long, value_enum)]
    kind: Option<RecordKind>,

    /// Merged file entries carry venue tags
    #[arg(long, default_value_t = false)]
    tagged: bool,

    /// Number of records to print
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn fmt_ts(ts: u64) -> String {
    let fmt = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:9]"
    );
    OffsetDateTime::from_unix_timestamp_nanos(ts as i128)
        .ok()
        .and_then(|t| t.format(fmt).ok())
        .unwrap_or_else(|| ts.to_string())
}

fn print_header(h: &FileHeader) {
    println!(
        "Header: feed_id={} date={} records={} symbol_index={}",
        h.feed_id, h.date, h.record_count, h.symbol_index
    );
}

fn print_record(i: usize, tag: Option<u64>, record: &Record) {
    let venue = tag.map(|t| format!(" venue={t}")).unwrap_or_default();
    match record {
        Record::Fill(f) => println!(
            "{:>6} {}{} FILL px={:.4} qty={} exec={} resting={} {}",
            i,
            fmt_ts(f.ts),
            venue,
            price_to_f64(f.trade_price),
            f.trade_qty,
            f.execution_id,
            f.resting_order_id,
            if f.resting_side_is_bid { "bid" } else { "ask" }
        ),
        Record::Tops(t) => {
            let levels = t
                .levels
                .iter()
                .map(|l| {
                    format!(
                        "{:.4}x{} / {:.4}x{}",
                        price_to_f64(l.bid_price),
                        l.bid_qty,
                        price_to_f64(l.ask_price),
                        l.ask_qty
                    )
                })
                .collect::<Vec<_>>()
                .join(" | ");
            println!("{:>6} {}{} TOPS seq={} {}", i, fmt_ts(t.ts), venue, t.seq_no, levels);
        }
    }
}

fn fmt_level(l: &PriceLevel) -> String {
    let venues = l
        .venues
        .iter()
        .map(|v| format!("{}@{}", v.quantity, v.source_id))
        .collect::<Vec<_>>()
        .join(",");
    format!("{:.4} [{}]", price_to_f64(l.price), venues)
}

fn dump_merged(args: &Args, kind: RecordKind) -> Result<()> {
    let file = File::open(&args.input).with_context(|| format!("open {:?}", args.input))?;
    let mut rdr = BufReader::new(file);
    let header = read_header(&mut rdr).context("read header")?;
    print_header(&header);

    let layout = EntryLayout::from_tagged(args.tagged);
    let tag_size = layout.tag_size();
    let mut reader = RecordReader::new(rdr, layout.entry_size(kind));
    let mut shown = 0usize;
    while shown < args.limit {
        match reader.next_chunk()? {
            Chunk::Full(bytes) => {
                let tag = (tag_size > 0).then(|| leading_u64(&bytes)).flatten();
                let record = decode_record(&bytes[tag_size..], kind)?;
                print_record(shown, tag, &record);
                shown += 1;
            }
            Chunk::Eof => break,
            Chunk::Partial(got) => {
                eprintln!("incomplete trailing entry ({got} bytes)");
                break;
            }
        }
    }
    Ok(())
}

fn dump_snapshots(args: &Args) -> Result<()> {
    let (header, snapshots) = read_snapshot_file(&args.input)?;
    print_header(&header);
    for (i, snap) in snapshots.iter().take(args.limit).enumerate() {
        println!("{:>6} {}", i, fmt_ts(snap.timestamp));
        for (b, lvl) in snap.ladder.bids.iter().enumerate() {
            println!("         bid{} {}", b + 1, fmt_level(lvl));
        }
        for (a, lvl) in snap.ladder.asks.iter().enumerate() {
            println!("         ask{} {}", a + 1, fmt_level(lvl));
        }
    }
    eprintln!("Read {} snapshots.", snapshots.len());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.kind {
        Some(kind) => dump_merged(&args, kind),
        None => dump_snapshots(&args),
    }
}
