//! Binary entry point for the Strata administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use strata::{
    admin::{checkpoint, defrag, stats, wal_dump, CheckpointReport, DefragReport, StatsReport, WalDumpReport},
    primitives::wal::Synchronous,
    types::GroupId,
    StorageConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Administrative CLI for Strata data directories",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "STRATA_CONFIG",
        help = "TOML file with storage settings"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "STRATA_PAGE_SIZE", help = "Override page size (bytes)")]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Override the default region size (pages)")]
    region_pages: Option<usize>,

    #[arg(long, global = true, help = "Override the checkpoint writer thread count")]
    checkpoint_threads: Option<usize>,

    #[arg(long, global = true, value_enum, help = "WAL synchronous mode override")]
    synchronous: Option<SynchronousArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print engine, region, WAL and file statistics")]
    Stats {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Force a checkpoint")]
    Checkpoint {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Defragment one cache group")]
    Defrag {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, help = "Group id to compact")]
        group: u32,
    },

    #[command(name = "wal-dump", about = "List WAL records")]
    WalDump {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, value_name = "PTR", help = "Start at this WAL pointer (byte offset of a frame)")]
        from: Option<u64>,

        #[arg(long, help = "Stop after this many records")]
        limit: Option<usize>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SynchronousArg {
    Full,
    Normal,
    Off,
}

impl From<SynchronousArg> for Synchronous {
    fn from(mode: SynchronousArg) -> Self {
        match mode {
            SynchronousArg::Full => Synchronous::Full,
            SynchronousArg::Normal => Synchronous::Normal,
            SynchronousArg::Off => Synchronous::Off,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli.open)?;

    match cli.command {
        Command::Stats { dir } => {
            let report = stats(&dir, &config)?;
            emit(cli.format, &report, || print_stats_text(&report))?;
        }
        Command::Checkpoint { dir } => {
            let report = checkpoint(&dir, &config)?;
            emit(cli.format, &report, || print_checkpoint_text(&report))?;
        }
        Command::Defrag { dir, group } => {
            let report = defrag(&dir, &config, GroupId(group))?;
            emit(cli.format, &report, || print_defrag_text(&report))?;
        }
        Command::WalDump { dir, from, limit } => {
            let report = wal_dump(&dir, from, limit)?;
            emit(cli.format, &report, || print_wal_text(&report))?;
            if report.error.is_some() {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn build_config(args: &OpenArgs) -> Result<StorageConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => StorageConfig::load(path)?,
        None => StorageConfig::default(),
    };
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(pages) = args.region_pages {
        config.region_pages = pages;
        config.checkpoint_buffer_pages = config.checkpoint_buffer_pages.min(pages);
    }
    if let Some(threads) = args.checkpoint_threads {
        config.checkpoint_threads = threads;
    }
    if let Some(mode) = args.synchronous {
        config.synchronous = mode.into();
    }
    config.validate()?;
    Ok(config)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_stats_text(report: &StatsReport) {
    let region = &report.engine.region;
    println!("Region {}:", region.region);
    println!(
        "  page_size={} capacity={} cached={} dirty={} hits={} misses={} evictions={} overflows={}",
        report.page_size,
        region.capacity,
        region.cached_pages,
        region.dirty_pages,
        region.hits,
        region.misses,
        region.evictions,
        region.overflows
    );
    if let Some(throttle) = &report.engine.throttle {
        println!(
            "  throttle: weight={:.3} parks={} parked_ns={} warnings={}",
            throttle.throttle_weight, throttle.parks, throttle.parked_ns, throttle.warnings
        );
    }
    println!();
    match &report.engine.last_checkpoint {
        Some(cp) => println!("Last checkpoint: id={} pages={} begin={}", cp.id, cp.pages, cp.begin),
        None => println!("Last checkpoint: none this session"),
    }
    let recovery = &report.engine.recovery;
    println!(
        "Recovery: restored={:?} pages={} replayed={} skipped={}",
        recovery.restored_checkpoint, recovery.pages_restored, recovery.records_replayed, recovery.records_skipped
    );
    println!();
    for group in &report.engine.groups {
        println!(
            "Group {} ({}){}: index_pages={} indexes={}",
            group.id,
            group.name,
            if group.frozen { " frozen" } else { "" },
            group.index_pages,
            group.indexes.len()
        );
        for part in &group.partitions {
            println!(
                "  part-{}: rows={} pages={} reusable={} counter={} gaps={}",
                part.partition, part.rows, part.pages, part.reusable_pages, part.update_counter, part.counter_gaps
            );
        }
    }
    println!();
    let fs = &report.filesystem;
    println!("Filesystem: wal_size={} wal_path={}", fs.wal_size_bytes, fs.wal_path);
    for group in &fs.groups {
        println!(
            "  {}: files={} size={}{}",
            group.dir,
            group.files,
            group.size_bytes,
            if group.defrag_pending { " defrag-pending" } else { "" }
        );
    }
}

fn print_checkpoint_text(report: &CheckpointReport) {
    println!(
        "Checkpoint {} ({}) wrote {} pages in {:.2} ms, begin pointer {}",
        report.id, report.reason, report.pages, report.duration_ms, report.begin
    );
}

fn print_defrag_text(report: &DefragReport) {
    if report.already_completed {
        println!("Group {} was already defragmented; finished the file swap", report.group);
        return;
    }
    println!(
        "Group {}: processed={:?} skipped={:?} rows={} index_entries={} pages {} -> {} in {} ms",
        report.group,
        report.partitions_processed,
        report.partitions_skipped,
        report.rows_copied,
        report.index_entries,
        report.old_pages,
        report.new_pages,
        report.duration_ms
    );
}

fn print_wal_text(report: &WalDumpReport) {
    for entry in &report.entries {
        println!("{:>12} {:<24} {}", entry.pointer, entry.kind, entry.detail);
    }
    println!("{} records", report.entries.len());
    if let Some(err) = &report.error {
        println!("stopped at a bad record: {err}");
    }
}
