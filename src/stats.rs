//! Run counters and periodic progress reporting.

use crate::config::SourceModes;
use crate::feed::BlockRange;
use crate::schemas::BlockId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Minimum wall-clock time between two progress lines.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Monotonic counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub blocks_processed: u64,
    pub transactions_processed: u64,
    pub files_extracted: u64,
    pub address_files_extracted: u64,
    /// Sender addresses currently accumulating data
    pub tracked_addresses: u64,
}

/// Progress line contents
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub blocks_done: u64,
    pub total_blocks: u64,
    /// Blocks per minute since the previous snapshot
    pub rate_per_minute: f64,
    pub files_found: u64,
    pub transactions: Option<u64>,
    pub tracked_addresses: Option<u64>,
}

pub struct StatsReporter {
    range: BlockRange,
    modes: SourceModes,
    counters: RunCounters,
    last_report: Instant,
    blocks_at_last_report: u64,
}

impl StatsReporter {
    pub fn new(range: BlockRange, modes: SourceModes) -> Self {
        Self {
            range,
            modes,
            counters: RunCounters::default(),
            last_report: Instant::now(),
            blocks_at_last_report: 0,
        }
    }

    pub fn counters_mut(&mut self) -> &mut RunCounters {
        &mut self.counters
    }

    /// Record one processed block; logs a snapshot at most once a minute.
    pub fn tick(&mut self, current: BlockId) -> Option<ProgressSnapshot> {
        self.counters.blocks_processed += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_report);
        if elapsed < REPORT_INTERVAL {
            return None;
        }

        let blocks_done = current.saturating_sub(self.range.start).saturating_add(1);
        let since_last = self.counters.blocks_processed - self.blocks_at_last_report;
        let snapshot = ProgressSnapshot {
            blocks_done,
            total_blocks: self.range.block_count(),
            rate_per_minute: since_last as f64 / (elapsed.as_secs_f64() / 60.0),
            files_found: self.counters.files_extracted,
            transactions: self
                .modes
                .counts_transactions()
                .then_some(self.counters.transactions_processed),
            tracked_addresses: self
                .modes
                .addresses
                .then_some(self.counters.tracked_addresses),
        };

        info!("{}", render(&snapshot));
        self.last_report = now;
        self.blocks_at_last_report = self.counters.blocks_processed;
        Some(snapshot)
    }

    /// Final summary lines.
    pub fn finish(&self) -> RunCounters {
        let c = &self.counters;
        info!(
            "Finished downloading/reviewing all {} blocks!",
            c.blocks_processed
        );
        info!("Total number of extracted files: {}", c.files_extracted);
        if self.modes.counts_transactions() {
            info!("Total number of transactions: {}", c.transactions_processed);
        }
        if self.modes.addresses {
            info!(
                "Total number of tracked addresses: {} ({} files extracted from them)",
                c.tracked_addresses, c.address_files_extracted
            );
        }
        *c
    }
}

fn render(s: &ProgressSnapshot) -> String {
    let mut line = format!(
        "Parsed {}/{} blocks ({:.1} blocks/min), {} files found",
        s.blocks_done, s.total_blocks, s.rate_per_minute, s.files_found
    );
    if let Some(tx) = s.transactions {
        line.push_str(&format!(", {} transactions", tx));
    }
    if let Some(tracked) = s.tracked_addresses {
        line.push_str(&format!(", {} tracked addresses", tracked));
    }
    line
}
