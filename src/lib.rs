//! etherblob library
//!
//! Scans a range of Ethereum blocks and extracts files hidden in chain data:
//! transaction input fields, block extra data, recipient addresses and
//! contract storage slots.
//!
//! # Components
//!
//! 1. **Block feed** ([`feed`]): fetches blocks in order, retrying transient
//!    provider failures with capped exponential backoff
//! 2. **Byte extraction** ([`bytes`]): decodes provider hex fields
//! 3. **Classification** ([`classifier`]): embedded carving, header detection,
//!    printable strings and entropy windows, first match wins
//! 4. **Address accumulation** ([`accumulator`]): per-sender buffers carved at
//!    the end of the run
//! 5. **Contract storage** ([`contracts`]): one-time slot harvesting per
//!    contract
//! 6. **Run** ([`pipeline`]): ties the above together and persists results
//!    through [`sink`], reporting progress via [`stats`]
//!
//! # Output Files
//!
//! - `ext_{start}-{end}/file_{n}`: extracted files
//! - `transactions_{start}-{end}.txt`: optional transaction log
//! - `etherblob_{start}-{end}.log`: run log
//!
//! # Example
//!
//! ```no_run
//! use etherblob::config::ProviderConfig;
//! use etherblob::provider::{EtherscanClient, LedgerProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = EtherscanClient::new(ProviderConfig::default(), "API_KEY".into())?;
//!     let block = client.block_by_number(46_147).await?;
//!     println!("{} transactions", block.transactions.len());
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod bytes;
pub mod classifier;
pub mod config;
pub mod contracts;
pub mod feed;
pub mod identify;
pub mod pipeline;
pub mod provider;
pub mod schemas;
pub mod sink;
pub mod stats;

// Re-export commonly used types
pub use config::{ScanConfig, ScanOptions};
pub use pipeline::{RunReport, ScanError, ScanPipeline};
pub use schemas::{Block, CandidateBlob, Transaction};
