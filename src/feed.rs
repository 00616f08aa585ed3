//! Sequential block feed with capped exponential backoff.
//!
//! Blocks are fetched one at a time in increasing order. Transient provider
//! failures are retried forever on the same block id; a block is never
//! skipped. Fatal failures are returned to the caller.

use crate::provider::{LedgerProvider, ProviderError, RoundDirection};
use crate::schemas::{Block, BlockId};
use chrono::DateTime;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// First retry delay, restored after every success.
pub const BACKOFF_FLOOR_SECS: u64 = 2;
/// Retry delay never grows past this.
pub const BACKOFF_CAP_SECS: u64 = 1 << 8;
/// Pause between successful fetches.
pub const PACING: Duration = Duration::from_millis(200);

/// Inclusive block id range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: BlockId,
    pub end: BlockId,
}

impl BlockRange {
    pub fn new(start: BlockId, end: BlockId) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Saturates for the full `0..=u64::MAX` range.
    pub fn block_count(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// Map a timestamp range onto block ids: closest block before the start,
    /// closest block after the end. Any failure aborts the run.
    pub async fn from_timestamps(
        provider: &dyn LedgerProvider,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<Self, ProviderError> {
        info!("Parsing blocks as timestamps...");

        let start = provider
            .block_number_by_timestamp(start_ts, RoundDirection::Before)
            .await?;
        info!("Got starting block id '{}' for {}", start, render_timestamp(start_ts));

        let end = provider
            .block_number_by_timestamp(end_ts, RoundDirection::After)
            .await?;
        info!("Got ending block id '{}' for {}", end, render_timestamp(end_ts));

        Self::new(start, end).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "timestamps resolved to a reversed range {start}-{end}"
            ))
        })
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

fn render_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Backoff bookkeeping shared by every retried provider call
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u64,
    pub delay_secs: u64,
    pub cap_secs: u64,
    /// Total time spent sleeping on failures
    pub slept: Duration,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 0,
            delay_secs: BACKOFF_FLOOR_SECS,
            cap_secs: BACKOFF_CAP_SECS,
            slept: Duration::ZERO,
        }
    }
}

impl RetryState {
    /// Delay to wait now; doubles the next one up to the cap.
    pub fn on_failure(&mut self) -> Duration {
        self.attempt += 1;
        let wait = Duration::from_secs(self.delay_secs);
        self.delay_secs = (self.delay_secs * 2).min(self.cap_secs);
        self.slept += wait;
        wait
    }

    pub fn on_success(&mut self) {
        self.attempt = 0;
        self.delay_secs = BACKOFF_FLOOR_SECS;
    }
}

/// Run `op` until it succeeds or fails fatally, sleeping between transient
/// failures.
pub async fn retry_transient<T, F, Fut>(
    retry: &mut RetryState,
    what: impl fmt::Display,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    loop {
        match op().await {
            Ok(value) => {
                retry.on_success();
                return Ok(value);
            }
            Err(e) if e.is_transient() => {
                let wait = retry.on_failure();
                warn!("Problem found while querying {}: {}", what, e);
                info!("Sleeping for {} [s] and retrying...", wait.as_secs());
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Iterator over the blocks of a range
pub struct BlockFeed {
    provider: Arc<dyn LedgerProvider>,
    range: BlockRange,
    /// `None` once the last id representable has been yielded
    cursor: Option<BlockId>,
    retry: RetryState,
    pacing: Duration,
    fetched: bool,
}

impl BlockFeed {
    pub fn new(provider: Arc<dyn LedgerProvider>, range: BlockRange) -> Self {
        Self {
            provider,
            range,
            cursor: Some(range.start),
            retry: RetryState::default(),
            pacing: PACING,
            fetched: false,
        }
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    /// Next block in the range, `None` once the cursor passes the end.
    pub async fn next(&mut self) -> Result<Option<(BlockId, Block)>, ProviderError> {
        let Some(id) = self.cursor.filter(|id| *id <= self.range.end) else {
            return Ok(None);
        };

        // Keep clear of upstream anti-abuse thresholds.
        if self.fetched {
            tokio::time::sleep(self.pacing).await;
        }

        let provider = Arc::clone(&self.provider);
        let block = retry_transient(&mut self.retry, format!("block '{id}'"), || {
            provider.block_by_number(id)
        })
        .await?;

        self.fetched = true;
        self.cursor = id.checked_add(1);
        Ok(Some((id, block)))
    }
}
