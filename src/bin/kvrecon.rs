//! kvrecon CLI
//!
//! Usage:
//!   kvrecon join <LEFT> <RIGHT> <OUTPUT_DIR>          # matched / unmatched_left / unmatched_right
//!   kvrecon join-dir <LEFT_DIR> <RIGHT_DIR> <OUTPUT_DIR>  # every prefix pair, concurrently
//!   kvrecon sort <INPUT> <OUTPUT>                     # key desc, secondary asc
//!
//! Tuning flags can also come from `KVRECON_*` environment variables or a `.env` file.
//! Exit codes: 0 success, 1 usage error, 2 I/O or resource failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use kvrecon::config::{parse_bucket_order, parse_size, Config, DEFAULT_PROGRESS_INTERVAL};
use kvrecon::join::IndexLayout;
use kvrecon::pipeline::{self, BatchReport};
use kvrecon::sort_merge::Bucket;
use kvrecon::{logging, Aborted, ReconError, Stats};

#[derive(Parser)]
#[command(name = "kvrecon", version)]
#[command(about = "Bucketed external sort and key-based reconciliation for large text datasets")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG overrides this.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the final summary as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Tuning {
    /// Memory budget for one key band while sorting (e.g. 512M, 2G)
    #[arg(long, global = true, env = "KVRECON_BUCKET_BUDGET", value_parser = parse_size, default_value = "2G")]
    bucket_budget: u64,

    /// Memory budget for the join index
    #[arg(long, global = true, env = "KVRECON_INDEX_BUDGET", value_parser = parse_size, default_value = "4G")]
    index_budget: u64,

    /// Read/write buffer size per file
    #[arg(long, global = true, env = "KVRECON_BUFFER_SIZE", value_parser = parse_size, default_value = "8M")]
    buffer_size: u64,

    /// Worker threads (0 = one per CPU)
    #[arg(short = 'j', long, global = true, env = "KVRECON_THREADS", default_value_t = 0)]
    threads: usize,

    /// Lines between progress log events (0 = off)
    #[arg(long, global = true, env = "KVRECON_PROGRESS_INTERVAL", default_value_t = DEFAULT_PROGRESS_INTERVAL)]
    progress_interval: u64,
}

#[derive(Args)]
struct JoinOpts {
    /// Only filter the left side; skip the unmatched-right sweep
    #[arg(long)]
    left_only: bool,

    /// Field layout of the right-hand files: key-value or id-key
    #[arg(long, env = "KVRECON_RIGHT_LAYOUT", default_value = "key-value")]
    right_layout: IndexLayout,
}

#[derive(Subcommand)]
enum Commands {
    /// Split LEFT `id:key` records by whether RIGHT has their key
    Join {
        left: PathBuf,
        right: PathBuf,
        output_dir: PathBuf,
        #[command(flatten)]
        opts: JoinOpts,
    },
    /// Join every `<prefix>_*.txt` pair found in two directories
    JoinDir {
        left_dir: PathBuf,
        right_dir: PathBuf,
        output_dir: PathBuf,
        #[command(flatten)]
        opts: JoinOpts,
    },
    /// Sort `integer:secondary` records through fixed key bands
    Sort {
        input: PathBuf,
        output: PathBuf,
        /// Band merge order, comma-separated ids (1-9) or names
        #[arg(long, env = "KVRECON_BUCKET_ORDER", value_parser = parse_order)]
        bucket_order: Option<BucketOrder>,
    },
}

#[derive(Clone)]
struct BucketOrder(Vec<Bucket>);

fn parse_order(s: &str) -> std::result::Result<BucketOrder, String> {
    parse_bucket_order(s).map(BucketOrder)
}

impl Tuning {
    fn config(&self) -> Result<Config> {
        let buffer_size = usize::try_from(self.buffer_size)
            .map_err(|_| ReconError::usage("buffer size does not fit in memory"))?;
        Ok(Config {
            bucket_budget: self.bucket_budget,
            index_budget: self.index_budget,
            buffer_size,
            threads: self.threads,
            progress_interval: self.progress_interval,
            ..Config::default()
        })
    }
}

impl JoinOpts {
    fn apply(&self, config: &mut Config) {
        config.reverse_sweep = !self.left_only;
        config.index_layout = self.right_layout;
    }
}

fn main() -> ExitCode {
    if let Err(err) = load_env() {
        eprintln!("error: {:#}", err);
        return ExitCode::from(1);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version are not failures
            return ExitCode::from(if err.use_stderr() { 1 } else { 0 });
        }
    };

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<ReconError>()
                .map_or(2, ReconError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

fn load_env() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(err).context("failed to load .env"),
    }
}

fn run(cli: Cli) -> Result<u8> {
    logging::init_logging(cli.verbose).context("failed to initialise logging")?;
    let mut config = cli.tuning.config()?;

    match cli.command {
        Commands::Join {
            left,
            right,
            output_dir,
            opts,
        } => {
            opts.apply(&mut config);
            let result = pipeline::run_join(&left, &right, &output_dir, &config);
            finish(result, cli.json, print_join)
        }
        Commands::JoinDir {
            left_dir,
            right_dir,
            output_dir,
            opts,
        } => {
            opts.apply(&mut config);
            let report = pipeline::run_join_dir(&left_dir, &right_dir, &output_dir, &config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report.summary())?);
            } else {
                print_batch(&report);
            }
            Ok(report.exit_code() as u8)
        }
        Commands::Sort {
            input,
            output,
            bucket_order,
        } => {
            if let Some(BucketOrder(order)) = bucket_order {
                config.bucket_order = order;
            }
            let result = pipeline::run_sort(&input, &output, &config);
            finish(result, cli.json, print_sort)
        }
    }
}

fn finish(
    result: std::result::Result<Stats, Aborted>,
    json: bool,
    print: fn(&Stats),
) -> Result<u8> {
    let (stats, code) = match &result {
        Ok(stats) => (stats, 0),
        Err(aborted) => (&aborted.stats, aborted.exit_code() as u8),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
    } else {
        print(stats);
    }
    if let Err(aborted) = &result {
        eprintln!("error: {}", aborted.error);
    }
    Ok(code)
}

fn rule() {
    println!("{}", "═".repeat(50));
}

fn print_join(stats: &Stats) {
    print_join_titled(&format!("JOIN ({:?})", stats.stage), stats);
}

fn print_join_titled(title: &str, stats: &Stats) {
    rule();
    println!("{}", title);
    rule();
    println!("Right lines:      {}", stats.index_lines);
    println!("Index entries:    {}", stats.index_entries);
    println!("Right errors:     {}", stats.index_errored);
    println!("Left lines:       {}", stats.processed);
    println!("Matched:          {}", stats.matched);
    println!("Unmatched left:   {}", stats.unmatched_left);
    println!("Unmatched right:  {}", stats.unmatched_right);
    println!("Left errors:      {}", stats.errored);
}

fn print_sort(stats: &Stats) {
    rule();
    println!("SORT ({:?})", stats.stage);
    rule();
    println!("Lines:            {}", stats.processed);
    println!("Written:          {}", stats.written);
    println!("Errors:           {}", stats.errored);
    for (bucket, count) in stats.buckets.iter() {
        println!("  {:<20} {}", bucket.name(), count);
    }
}

fn print_batch(report: &BatchReport) {
    for pair in &report.pairs {
        match &pair.result {
            Ok(stats) => println!(
                "{}: matched {}, unmatched left {}, unmatched right {}, errors {}",
                pair.pair.prefix,
                stats.matched,
                stats.unmatched_left,
                stats.unmatched_right,
                stats.errored + stats.index_errored
            ),
            Err(aborted) => println!("{}: FAILED ({})", pair.pair.prefix, aborted.error),
        }
    }
    for path in &report.unpaired_left {
        println!("skipped (no right file): {}", path.display());
    }
    let failed = report.failures().count();
    print_join_titled(
        &format!("BATCH ({} pairs, {} failed)", report.pairs.len(), failed),
        &report.totals(),
    );
}
