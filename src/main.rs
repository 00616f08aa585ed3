//! etherblob CLI
//!
//! Scans a range of Ethereum blocks for files hidden in transaction inputs,
//! block extra data, recipient addresses and contract storage.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use etherblob::classifier::ContentClassifier;
use etherblob::config::{resolve_api_key, ProviderConfig, ScanConfig, ScanOptions, SourceModes};
use etherblob::feed::BlockRange;
use etherblob::identify::{BinwalkCarver, FileCommandIdentifier};
use etherblob::pipeline::{
    default_log_file, default_output_dir, transactions_file, RunReport, ScanPipeline,
};
use etherblob::provider::{EtherscanClient, LedgerProvider};
use etherblob::sink::{cleanup_after_failure, ArtifactSink, TransactionLog};

/// Exit code for every fatal condition.
const FATAL_EXIT: u8 = 127;

#[derive(Parser)]
#[command(name = "etherblob")]
#[command(version)]
#[command(about = "Search and extract blob files hidden in the Ethereum blockchain", long_about = None)]
struct Cli {
    /// First block id (or UNIX timestamp with --timestamps)
    start_block: u64,

    /// Last block id (or UNIX timestamp with --timestamps), inclusive
    end_block: u64,

    /// Treat the range bounds as UNIX timestamps
    #[arg(short, long)]
    timestamps: bool,

    /// Look for files in transaction input data (default)
    #[arg(long)]
    transactions: bool,

    /// Look for files in block extra data
    #[arg(long)]
    blocks: bool,

    /// Look for files split across recipient addresses
    #[arg(long)]
    addresses: bool,

    /// Look for files in contract storage
    #[arg(long)]
    contracts: bool,

    /// Carve files embedded anywhere in the payload
    #[arg(short = 'M', long)]
    embedded: bool,

    /// Extract payloads whose entropy looks like UTF-8 text (3.5-5.0)
    #[arg(short = 'U', long)]
    unicode: bool,

    /// Extract payloads whose entropy looks encrypted or compressed (7.0-8.0)
    #[arg(long)]
    encrypted: bool,

    /// Extract payloads whose entropy falls in [MIN, MAX]
    #[arg(short = 'E', long, num_args = 2, value_names = ["MIN", "MAX"])]
    custom_entropy: Option<Vec<f64>>,

    /// Extract printable ASCII strings
    #[arg(short = 'S', long)]
    strings: bool,

    /// Number of storage slots read per contract
    #[arg(short = 'C', long, allow_negative_numbers = true)]
    contract_position: Option<i64>,

    /// Etherscan API key
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// File holding the Etherscan API key
    #[arg(short = 'K', long, default_value = ".api-key")]
    api_key_path: PathBuf,

    /// Directory for extracted files (default: ext_START-END)
    #[arg(short = 'D', long)]
    output_dir: Option<PathBuf>,

    /// Run log file (default: etherblob_START-END.log)
    #[arg(short = 'o', long)]
    out_log: Option<PathBuf>,

    /// Save every inspected transaction to transactions_START-END.txt
    #[arg(short = 's', long)]
    save_transactions: bool,

    /// Detected types to skip (case-insensitive substrings, '*' for all)
    #[arg(short, long, num_args = 1..)]
    ignored_fmt: Option<Vec<String>>,

    /// Provider settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            start: self.start_block,
            end: self.end_block,
            timestamps: self.timestamps,
            modes: SourceModes {
                transactions: self.transactions,
                blocks: self.blocks,
                addresses: self.addresses,
                contracts: self.contracts,
            },
            embedded: self.embedded,
            strings: self.strings,
            unicode: self.unicode,
            encrypted: self.encrypted,
            custom_entropy: self
                .custom_entropy
                .as_deref()
                .and_then(|bounds| match bounds {
                    [min, max] => Some((*min, *max)),
                    _ => None,
                }),
            contract_position: self.contract_position,
            save_transactions: self.save_transactions,
            ignored_formats: self.ignored_fmt.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}

/// Paths created by the run, removed again if they stay empty after a
/// fatal error.
#[derive(Default)]
struct Outputs {
    log_file: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.scan_options().validate() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[!] Invalid options: {}", e);
            return ExitCode::from(FATAL_EXIT);
        }
    };

    let mut outputs = Outputs::default();
    let log_path = cli
        .out_log
        .clone()
        .unwrap_or_else(|| default_log_file(config.start, config.end));
    if let Err(e) = init_logging(&log_path, cli.verbose) {
        eprintln!("[!] {:#}", e);
        return ExitCode::from(FATAL_EXIT);
    }
    outputs.log_file = Some(log_path);

    match run(&cli, &config, &mut outputs).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            cleanup_after_failure(outputs.log_file.as_deref(), outputs.output_dir.as_deref());
            ExitCode::from(FATAL_EXIT)
        }
    }
}

/// Console output plus a plain-text mirror in the run log file.
fn init_logging(log_path: &Path, verbose: bool) -> Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let file = File::create(log_path)
        .with_context(|| format!("Failed to create log file {:?}", log_path))?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact();
    let mirror = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file));

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(log_level))
        .with(console)
        .with(mirror)
        .try_init()
        .context("Failed to set tracing subscriber")
}

async fn run(cli: &Cli, config: &ScanConfig, outputs: &mut Outputs) -> Result<RunReport> {
    info!("=== etherblob ===");

    let api_key = resolve_api_key(cli.api_key.as_deref(), &cli.api_key_path)?;
    let provider_config = match &cli.config {
        Some(path) => ProviderConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ProviderConfig::default(),
    };
    let provider: Arc<dyn LedgerProvider> = Arc::new(
        EtherscanClient::new(provider_config, api_key).context("Failed to build HTTP client")?,
    );

    let range = if config.timestamps {
        BlockRange::from_timestamps(provider.as_ref(), config.start, config.end)
            .await
            .context("Failed to resolve timestamps to blocks")?
    } else {
        BlockRange::new(config.start, config.end).context("Reversed block range")?
    };

    let dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(range));
    let sink = ArtifactSink::create(&dir)
        .with_context(|| format!("Failed to create output dir {:?}", dir))?;
    outputs.output_dir = Some(dir);

    let tx_log = if config.save_transactions {
        Some(TransactionLog::create(&transactions_file(range))?)
    } else {
        None
    };

    let classifier = ContentClassifier::new(
        config.detection.clone(),
        config.ignore.clone(),
        Box::new(FileCommandIdentifier::default()),
        Box::new(BinwalkCarver::default()),
    );

    let pipeline = ScanPipeline::new(config, range, provider, classifier, sink, tx_log);
    let report = pipeline.run().await?;

    info!("=== Scan Complete ===");
    info!(
        "{} files extracted to {:?}",
        report.counters.files_extracted,
        outputs.output_dir.as_deref().unwrap_or(Path::new("."))
    );
    Ok(report)
}
