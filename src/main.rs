use anyhow::{Context, Result};
use book_merge::consolidate::consolidate_file;
use book_merge::layout;
use book_merge::merge::{merge_sources, MergeOutcome};
use book_merge::record::{EntryLayout, RecordKind};
use book_merge::verify::{sample_for_verification, verify_file, VerifyReport};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, unbounded};
use dotenvy::dotenv;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Merge per-venue book files and derive multi-venue top-of-book snapshots"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Merge per-venue files of one record kind into one timestamp-ordered file
    Merge {
        /// Record kind carried by every source
        #[arg(long, value_enum)]
        kind: RecordKind,

        /// Merged output file
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Prefix each record with the feed id of its source
        #[arg(long, default_value_t = false)]
        tagged: bool,

        /// Source files, one per venue
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Build the snapshot file from a venue-tagged merged tops file
    Consolidate {
        #[arg(long, short = 'i')]
        input: PathBuf,

        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Check header count and timestamp order of merged files
    Verify {
        #[arg(long, value_enum)]
        kind: RecordKind,

        /// Files were written with venue tags
        #[arg(long, default_value_t = false)]
        tagged: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Merge every symbol of a trading-day directory, then spot-check the outputs
    Batch(BatchArgs),
}

#[derive(Debug, Args)]
struct BatchArgs {
    /// Trading-day directory holding one sub-directory per venue
    #[arg(long, env = "BOOK_MERGE_ROOT")]
    root: PathBuf,

    /// Output directory (defaults to ROOT/mergedbooks)
    #[arg(long, env = "BOOK_MERGE_OUT")]
    out: Option<PathBuf>,

    /// Symbols processed in parallel; each symbol's pipeline stays sequential
    #[arg(long, env = "BOOK_MERGE_JOBS", default_value_t = 1)]
    jobs: usize,

    /// Fraction of merged files to verify (at least one)
    #[arg(long, env = "BOOK_MERGE_SAMPLE", default_value_t = 0.05)]
    sample_fraction: f64,

    /// Skip snapshot generation for merged tops
    #[arg(long, default_value_t = false)]
    no_consolidate: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn print_report(report: &VerifyReport) {
    println!(
        "{} {} declared={} actual={} count_ok={} order_ok={} crc32={:#010x}",
        if report.passed() { "PASS" } else { "FAIL" },
        report.path.display(),
        report.declared_count,
        report.actual_count,
        report.count_matches,
        report.order_correct,
        report.data_crc32,
    );
    if let Some(idx) = report.first_out_of_order {
        println!("  first out-of-order entry at index {idx}");
    }
    if report.trailing_bytes > 0 {
        println!("  {} trailing bytes of an incomplete entry", report.trailing_bytes);
    }
}

fn run_verify(files: &[PathBuf], kind: RecordKind, layout: EntryLayout) -> bool {
    let mut all_ok = true;
    for path in files {
        match verify_file(path, kind, layout) {
            Ok(report) => {
                print_report(&report);
                all_ok &= report.passed();
            }
            Err(e) => {
                println!("FAIL {} {e:#}", path.display());
                all_ok = false;
            }
        }
    }
    all_ok
}

#[derive(Debug)]
struct MergedFile {
    path: PathBuf,
    kind: RecordKind,
    layout: EntryLayout,
}

#[derive(Debug, Default)]
struct SymbolResult {
    symbol: String,
    merged: Vec<MergedFile>,
    snapshots: Option<u32>,
    failures: usize,
}

/// Fills are merged bare; tops carry venue tags so they can be consolidated.
const BATCH_PLAN: [(RecordKind, EntryLayout); 2] =
    [(RecordKind::Fills, EntryLayout::Plain), (RecordKind::Tops, EntryLayout::Tagged)];

fn process_symbol(
    root: &Path,
    venues: &[String],
    out_dir: &Path,
    symbol: &str,
    consolidate: bool,
) -> SymbolResult {
    let mut result = SymbolResult { symbol: symbol.to_string(), ..Default::default() };
    for (kind, entry_layout) in BATCH_PLAN {
        let sources = layout::source_paths(root, venues, kind, symbol);
        let output = layout::merged_path(out_dir, kind, symbol);
        match merge_sources(&sources, kind, entry_layout, &output) {
            Ok(MergeOutcome::Merged(_)) => {
                result.merged.push(MergedFile { path: output, kind, layout: entry_layout })
            }
            Ok(MergeOutcome::NothingToMerge) => {}
            Err(e) => {
                error!(symbol, kind = %kind, error = %format!("{e:#}"), "merge failed");
                result.failures += 1;
            }
        }
    }

    if consolidate {
        let tops =
            result.merged.iter().find(|m| m.kind == RecordKind::Tops).map(|m| m.path.clone());
        if let Some(tops) = tops {
            match consolidate_file(&tops, &layout::snapshot_path(out_dir, symbol)) {
                Ok(summary) => result.snapshots = Some(summary.snapshots),
                Err(e) => {
                    error!(symbol, error = %format!("{e:#}"), "snapshot generation failed");
                    result.failures += 1;
                }
            }
        }
    }
    result
}

fn run_batch(args: &BatchArgs) -> Result<bool> {
    let root = args.root.as_path();
    if !root.is_dir() {
        anyhow::bail!("date directory {:?} does not exist", root);
    }
    let out_dir = args.out.clone().unwrap_or_else(|| layout::merged_dir(root));
    fs::create_dir_all(&out_dir).with_context(|| format!("create {:?}", out_dir))?;

    match layout::date_from_root(root) {
        Some(date) => info!(date, root = %root.display(), "batch start"),
        None => warn!(root = %root.display(), "date directory name is not YYYYMMDD"),
    }

    let venues = layout::find_venues(root)?;
    if venues.is_empty() {
        info!("no venue directories found");
        return Ok(true);
    }
    info!(venues = %venues.join(", "), "venues found");
    let symbols = layout::discover_symbols(root, &venues)?;
    if symbols.is_empty() {
        info!("no symbols found");
        return Ok(true);
    }
    info!(count = symbols.len(), "symbols to process");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            warn!(error = %e, "cannot install Ctrl-C handler");
        }
    }

    let total = symbols.len();
    let (work_tx, work_rx) = bounded::<(usize, String)>(total);
    let (done_tx, done_rx) = unbounded::<SymbolResult>();
    for item in symbols.into_iter().enumerate() {
        work_tx.send(item).ok();
    }
    drop(work_tx);

    let consolidate = !args.no_consolidate;
    std::thread::scope(|s| {
        for _ in 0..args.jobs.max(1) {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let (stop, venues, out_dir) = (&stop, &venues, &out_dir);
            s.spawn(move || {
                for (i, symbol) in work_rx {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    info!("[{}/{}] processing {}", i + 1, total, symbol);
                    let result = process_symbol(root, venues, out_dir, &symbol, consolidate);
                    let _ = done_tx.send(result);
                }
            });
        }
    });
    drop(done_tx);

    let mut results: Vec<SymbolResult> = done_rx.into_iter().collect();
    results.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    if stop.load(Ordering::SeqCst) {
        warn!(done = results.len(), total, "interrupted, remaining symbols skipped");
    }

    let failures: usize = results.iter().map(|r| r.failures).sum();
    let snapshot_files = results.iter().filter(|r| r.snapshots.is_some()).count();
    let merged: Vec<&MergedFile> = results.iter().flat_map(|r| &r.merged).collect();
    println!(
        "Processed {} symbols: {} merged files, {} snapshot files, {} failures.",
        results.len(),
        merged.len(),
        snapshot_files,
        failures
    );
    if merged.is_empty() {
        return Ok(failures == 0);
    }

    let sample = sample_for_verification(&merged, args.sample_fraction, &mut rand::thread_rng());
    println!("Verifying {} of {} merged files.", sample.len(), merged.len());
    let mut sample_ok = true;
    for m in sample {
        sample_ok &= run_verify(std::slice::from_ref(&m.path), m.kind, m.layout);
    }
    if sample_ok {
        println!("All sampled files passed.");
    } else {
        println!("Some sampled files FAILED.");
    }
    Ok(sample_ok && failures == 0)
}

fn main() -> Result<ExitCode> {
    // Load environment variables from .env if present
    let _ = dotenv();
    init_tracing();
    let cli = Cli::parse();

    let ok = match cli.cmd {
        Cmd::Merge { kind, output, tagged, sources } => {
            match merge_sources(&sources, kind, EntryLayout::from_tagged(tagged), &output)? {
                MergeOutcome::Merged(s) => {
                    println!(
                        "Merged {} {} records from {} sources into {} ({} skipped, {} cut short).",
                        s.records,
                        kind,
                        s.sources_used,
                        s.output.display(),
                        s.sources_skipped,
                        s.sources_cut_short
                    );
                }
                MergeOutcome::NothingToMerge => println!("Nothing to merge; no output written."),
            }
            true
        }
        Cmd::Consolidate { input, output } => {
            let s = consolidate_file(&input, &output)?;
            println!(
                "Wrote {} snapshots from {} entries ({} venues) to {}.",
                s.snapshots,
                s.entries_read,
                s.venues,
                s.output.display()
            );
            true
        }
        Cmd::Verify { kind, tagged, files } => {
            run_verify(&files, kind, EntryLayout::from_tagged(tagged))
        }
        Cmd::Batch(args) => run_batch(&args)?,
    };
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
