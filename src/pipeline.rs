//! Block-by-block extraction run.
//!
//! [`ScanPipeline`] pulls blocks from the [`BlockFeed`], turns the payload
//! sources enabled in [`SourceModes`] into candidate blobs, runs each blob
//! through the [`ContentClassifier`] and persists accepted files through the
//! [`ArtifactSink`]. Address buffers are resolved once, after the last block.

use crate::accumulator::AddressAccumulator;
use crate::bytes::to_bytes;
use crate::classifier::{ClassifyError, ContentClassifier, Method};
use crate::config::{ScanConfig, SourceModes};
use crate::contracts::ContractInspector;
use crate::feed::{BlockFeed, BlockRange};
use crate::provider::{LedgerProvider, ProviderError};
use crate::schemas::{BlobOrigin, Block, BlockId, CandidateBlob};
use crate::sink::{ArtifactSink, TransactionLog};
use crate::stats::{RunCounters, StatsReporter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One persisted file
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub sequence_id: u64,
    pub method: Method,
    pub label: String,
    pub origin: BlobOrigin,
    pub origin_id: String,
    pub path: PathBuf,
}

/// Outcome of a completed run
#[derive(Debug)]
pub struct RunReport {
    pub counters: RunCounters,
    pub extractions: Vec<Extraction>,
    /// Time spent in fetch backoff
    pub backoff_slept: Duration,
}

/// Default output directory for a range: `ext_{start}-{end}`.
pub fn default_output_dir(range: BlockRange) -> PathBuf {
    PathBuf::from(format!("ext_{range}"))
}

/// Transaction log path for a range: `transactions_{start}-{end}.txt`.
pub fn transactions_file(range: BlockRange) -> PathBuf {
    PathBuf::from(format!("transactions_{range}.txt"))
}

/// Default run log path: `etherblob_{start}-{end}.log`.
pub fn default_log_file(start: u64, end: u64) -> PathBuf {
    PathBuf::from(format!("etherblob_{start}-{end}.log"))
}

pub struct ScanPipeline {
    provider: Arc<dyn LedgerProvider>,
    modes: SourceModes,
    feed: BlockFeed,
    classifier: ContentClassifier,
    accumulator: Option<AddressAccumulator>,
    contracts: Option<ContractInspector>,
    sink: ArtifactSink,
    tx_log: Option<TransactionLog>,
    stats: StatsReporter,
    extractions: Vec<Extraction>,
}

impl ScanPipeline {
    pub fn new(
        config: &ScanConfig,
        range: BlockRange,
        provider: Arc<dyn LedgerProvider>,
        classifier: ContentClassifier,
        sink: ArtifactSink,
        tx_log: Option<TransactionLog>,
    ) -> Self {
        let modes = config.modes;
        Self {
            feed: BlockFeed::new(Arc::clone(&provider), range),
            provider,
            modes,
            classifier,
            accumulator: modes.addresses.then(AddressAccumulator::new),
            contracts: modes
                .contracts
                .then(|| ContractInspector::new(config.contract_positions)),
            sink,
            tx_log,
            stats: StatsReporter::new(range, modes),
            extractions: Vec::new(),
        }
    }

    /// Walk the whole range. Any error returned here is fatal.
    pub async fn run(mut self) -> Result<RunReport, ScanError> {
        info!("Downloading/reviewing blocks {}...", self.feed.range());

        while let Some((id, block)) = self.feed.next().await? {
            self.process_block(id, &block).await?;
            self.stats.tick(id);
        }

        if let Some(accumulator) = self.accumulator.take() {
            for found in accumulator.resolve(&self.classifier)? {
                for file in found.files {
                    let stored = self.sink.persist(&file.bytes, None)?;
                    info!(
                        "Found file ({}) from address '{}', saved to '{}'...",
                        file.detected_type,
                        found.address,
                        stored.path.display()
                    );
                    let counters = self.stats.counters_mut();
                    counters.files_extracted += 1;
                    counters.address_files_extracted += 1;
                    self.extractions.push(Extraction {
                        sequence_id: stored.sequence_id,
                        method: Method::Embedded,
                        label: file.detected_type,
                        origin: BlobOrigin::Transaction,
                        origin_id: found.address.to_string(),
                        path: stored.path,
                    });
                }
            }
        }

        Ok(RunReport {
            counters: self.stats.finish(),
            extractions: self.extractions,
            backoff_slept: self.feed.retry_state().slept,
        })
    }

    async fn process_block(&mut self, id: BlockId, block: &Block) -> Result<(), ScanError> {
        debug!(
            "Block {} carries {} transactions",
            id,
            block.transactions.len()
        );
        if let Some(reported) = block.id().filter(|reported| *reported != id) {
            warn!("Requested block '{}' but the provider returned '{}'", id, reported);
        }

        if self.modes.transactions {
            for tx in &block.transactions {
                if let Some(bytes) = decode(tx.input.as_deref(), "transaction", &tx.hash) {
                    self.extract(CandidateBlob::new(bytes, BlobOrigin::Transaction, &tx.hash))?;
                }
                if let Some(log) = &mut self.tx_log {
                    log.record(tx)?;
                }
                self.stats.counters_mut().transactions_processed += 1;
            }
            if let Some(log) = &mut self.tx_log {
                log.flush()?;
            }
        }

        if self.modes.blocks {
            let origin_id = id.to_string();
            if let Some(bytes) = decode(block.extra_data.as_deref(), "block", &origin_id) {
                self.extract(CandidateBlob::new(bytes, BlobOrigin::Block, origin_id))?;
            }
        }

        if let Some(accumulator) = &mut self.accumulator {
            for tx in &block.transactions {
                accumulator.observe(tx, id, &self.classifier);
            }
            let counters = self.stats.counters_mut();
            if !self.modes.transactions {
                counters.transactions_processed += block.transactions.len() as u64;
            }
            counters.tracked_addresses = accumulator.tracked_count() as u64;
        }

        if let Some(inspector) = &mut self.contracts {
            let mut blobs = Vec::new();
            for tx in &block.transactions {
                for address in inspector.claim(tx) {
                    if let Some(blob) = inspector.harvest(self.provider.as_ref(), address).await? {
                        blobs.push(blob);
                    }
                }
            }
            for blob in blobs {
                self.extract(blob)?;
            }
        }

        Ok(())
    }

    /// Classify one blob and persist it when accepted.
    fn extract(&mut self, blob: CandidateBlob) -> Result<(), ScanError> {
        let Some(found) = self.classifier.classify(&blob.bytes)? else {
            return Ok(());
        };

        let stored = self.sink.persist(&found.bytes, found.extension)?;
        info!(
            "Found interesting file ({}) {} '{}', extracted to '{}'...",
            found.label,
            blob.origin,
            blob.origin_id,
            stored.path.display()
        );
        self.stats.counters_mut().files_extracted += 1;
        self.extractions.push(Extraction {
            sequence_id: stored.sequence_id,
            method: found.method,
            label: found.label,
            origin: blob.origin,
            origin_id: blob.origin_id,
            path: stored.path,
        });
        Ok(())
    }
}

/// Payload bytes of a hex field; empty and undecodable fields yield nothing.
fn decode(field: Option<&str>, kind: &str, id: &str) -> Option<Vec<u8>> {
    match to_bytes(field) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.is_empty_input() => None,
        Err(e) => {
            warn!("Skipping payload of {} '{}': {}", kind, id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::{classifier, PNG_LABEL, PNG_MAGIC};
    use crate::config::{DetectionConfig, EntropyWindow, IgnoreList, ScanOptions};
    use crate::feed::testing::{empty_block, MockLedger};
    use crate::schemas::Transaction;
    use alloy_primitives::{hex, Address};

    fn tx(hash: &str, from: Address, to: Option<Address>, input: Option<String>) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            from,
            to,
            input,
            creates: None,
            extra: Default::default(),
        }
    }

    fn block_with(id: BlockId, transactions: Vec<Transaction>) -> Block {
        Block {
            transactions,
            ..empty_block(id)
        }
    }

    fn png_input() -> String {
        let mut payload = PNG_MAGIC.to_vec();
        payload.extend_from_slice(b"\x00\x00\x00\x0dIHDR");
        format!("0x{}", hex::encode(payload))
    }

    fn scan_config(options: ScanOptions) -> ScanConfig {
        options.validate().unwrap()
    }

    async fn run(
        ledger: MockLedger,
        options: ScanOptions,
        detection: DetectionConfig,
        ignore: IgnoreList,
    ) -> (RunReport, tempfile::TempDir) {
        let scratch = tempfile::tempdir().unwrap();
        let config = scan_config(options);
        let range = BlockRange::new(config.start, config.end).unwrap();
        let sink = ArtifactSink::create(scratch.path().join(default_output_dir(range))).unwrap();
        let pipeline = ScanPipeline::new(
            &config,
            range,
            Arc::new(ledger),
            classifier(detection, ignore),
            sink,
            None,
        );
        (pipeline.run().await.unwrap(), scratch)
    }

    #[tokio::test(start_paused = true)]
    async fn test_png_input_is_extracted() {
        let sender = Address::repeat_byte(0x01);
        let ledger = MockLedger::with_blocks([(
            100,
            block_with(100, vec![tx("0xabc", sender, Some(sender), Some(png_input()))]),
        )]);
        let options = ScanOptions {
            start: 100,
            end: 100,
            ..Default::default()
        };

        let (report, _scratch) =
            run(ledger, options, DetectionConfig::default(), IgnoreList::defaults()).await;

        assert_eq!(report.counters.files_extracted, 1);
        assert_eq!(report.counters.transactions_processed, 1);
        assert_eq!(report.counters.blocks_processed, 1);
        assert_eq!(report.extractions.len(), 1);
        let found = &report.extractions[0];
        assert_eq!(found.method, Method::Header);
        assert_eq!(found.label, PNG_LABEL);
        assert_eq!(found.origin_id, "0xabc");
        assert!(std::fs::read(&found.path).unwrap().starts_with(PNG_MAGIC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_fetches_visit_each_block_once() {
        let mut ledger = MockLedger::with_blocks((100..=102).map(|id| (id, empty_block(id))));
        ledger.failures_per_block = 2;
        let options = ScanOptions {
            start: 100,
            end: 102,
            ..Default::default()
        };

        let (report, _scratch) =
            run(ledger, options, DetectionConfig::default(), IgnoreList::defaults()).await;

        assert_eq!(report.counters.blocks_processed, 3);
        assert_eq!(report.backoff_slept, Duration::from_secs(3 * (2 + 4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_entropy_window_end_to_end() {
        // Leading zero byte would be dropped by decoding, so start at 1.
        let blob: Vec<u8> = (1u8..=216).collect();
        let input = format!("0x{}", hex::encode(&blob));
        let sender = Address::repeat_byte(0x02);
        let make_ledger = || {
            MockLedger::with_blocks([(
                7,
                block_with(7, vec![tx("0x77", sender, Some(sender), Some(input.clone()))]),
            )])
        };
        let options = ScanOptions {
            start: 7,
            end: 7,
            ..Default::default()
        };
        let window = |min, max| DetectionConfig {
            entropy: Some(EntropyWindow::custom(min, max)),
            ..Default::default()
        };

        let (report, _scratch) = run(
            make_ledger(),
            options.clone(),
            window(7.5, 8.0),
            IgnoreList::defaults(),
        )
        .await;
        assert_eq!(report.counters.files_extracted, 1);
        assert_eq!(report.extractions[0].label, "from custom entropy");

        let (report, _scratch) =
            run(make_ledger(), options, window(3.5, 5.0), IgnoreList::defaults()).await;
        assert_eq!(report.counters.files_extracted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_suppresses_every_source() {
        let sender = Address::repeat_byte(0x03);
        let mut block = block_with(5, vec![tx("0x55", sender, Some(sender), Some(png_input()))]);
        block.extra_data = Some(png_input());
        let ledger = MockLedger::with_blocks([(5, block)]);
        let options = ScanOptions {
            start: 5,
            end: 5,
            modes: SourceModes {
                transactions: true,
                blocks: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let detection = DetectionConfig {
            strings: true,
            ..Default::default()
        };

        let (report, scratch) =
            run(ledger, options, detection, IgnoreList::from_patterns(&["*"])).await;

        assert_eq!(report.counters.files_extracted, 0);
        assert_eq!(report.counters.transactions_processed, 1);
        let out = scratch.path().join("ext_5-5");
        assert_eq!(std::fs::read_dir(out).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_extra_data_and_empty_inputs() {
        let sender = Address::repeat_byte(0x04);
        let mut block = block_with(
            9,
            vec![
                tx("0x90", sender, Some(sender), Some("0x".into())),
                tx("0x91", sender, Some(sender), None),
            ],
        );
        block.extra_data = Some(png_input());
        let ledger = MockLedger::with_blocks([(9, block)]);
        let options = ScanOptions {
            start: 9,
            end: 9,
            modes: SourceModes {
                transactions: true,
                blocks: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let (report, _scratch) =
            run(ledger, options, DetectionConfig::default(), IgnoreList::defaults()).await;

        // Empty inputs are skipped but still counted.
        assert_eq!(report.counters.transactions_processed, 2);
        assert_eq!(report.extractions.len(), 1);
        assert_eq!(report.extractions[0].origin, BlobOrigin::Block);
        assert_eq!(report.extractions[0].origin_id, "9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_buffers_resolved_at_end() {
        let sender = Address::repeat_byte(0xaa);
        let mut raw = [0x11u8; 20];
        raw[..PNG_MAGIC.len()].copy_from_slice(PNG_MAGIC);
        let png_to = Address::from(raw);
        let plain_to = Address::repeat_byte(0x22);

        let ledger = MockLedger::with_blocks([
            (20, block_with(20, vec![tx("0x20", sender, Some(png_to), None)])),
            (21, block_with(21, vec![tx("0x21", sender, Some(plain_to), None)])),
        ]);
        let options = ScanOptions {
            start: 20,
            end: 21,
            modes: SourceModes {
                addresses: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let (report, _scratch) =
            run(ledger, options, DetectionConfig::default(), IgnoreList::defaults()).await;

        assert_eq!(report.counters.tracked_addresses, 1);
        assert_eq!(report.counters.transactions_processed, 2);
        assert_eq!(report.counters.address_files_extracted, 1);
        assert_eq!(report.counters.files_extracted, 1);
        let found = &report.extractions[0];
        assert_eq!(found.origin_id, sender.to_string());
        assert_eq!(std::fs::read(&found.path).unwrap().len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contract_storage_inspected_once() {
        let contract = Address::repeat_byte(0xcc);
        let sender = Address::repeat_byte(0x05);
        let mut ledger = MockLedger::with_blocks([(
            30,
            block_with(
                30,
                vec![
                    tx("0x30", sender, Some(contract), None),
                    tx("0x31", sender, Some(contract), None),
                ],
            ),
        )]);
        ledger.code.insert(contract, "0x6080".into());
        let mut word = PNG_MAGIC.to_vec();
        word.resize(32, 0x42);
        ledger
            .storage
            .insert((contract, 0), format!("0x{}", hex::encode(&word)));

        let options = ScanOptions {
            start: 30,
            end: 30,
            modes: SourceModes {
                contracts: true,
                ..Default::default()
            },
            contract_position: Some(2),
            ..Default::default()
        };
        let ledger = Arc::new(ledger);
        let config = scan_config(options);
        let scratch = tempfile::tempdir().unwrap();
        let range = BlockRange::new(30, 30).unwrap();
        let pipeline = ScanPipeline::new(
            &config,
            range,
            ledger.clone(),
            classifier(DetectionConfig::default(), IgnoreList::defaults()),
            ArtifactSink::create(scratch.path().join("out")).unwrap(),
            None,
        );

        let report = pipeline.run().await.unwrap();
        assert_eq!(ledger.code_calls.lock().unwrap().as_slice(), &[contract]);
        assert_eq!(report.counters.files_extracted, 1);
        assert_eq!(report.extractions[0].origin, BlobOrigin::ContractStorage);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transaction_log_written() {
        let sender = Address::repeat_byte(0x06);
        let ledger = MockLedger::with_blocks([(
            1,
            block_with(1, vec![tx("0x01", sender, None, Some("0x".into()))]),
        )]);
        let config = scan_config(ScanOptions {
            start: 1,
            end: 1,
            save_transactions: true,
            ..Default::default()
        });
        let scratch = tempfile::tempdir().unwrap();
        let range = BlockRange::new(1, 1).unwrap();
        let log_path = scratch.path().join(transactions_file(range));
        let pipeline = ScanPipeline::new(
            &config,
            range,
            Arc::new(ledger),
            classifier(DetectionConfig::default(), IgnoreList::defaults()),
            ArtifactSink::create(scratch.path().join(default_output_dir(range))).unwrap(),
            Some(TransactionLog::create(&log_path).unwrap()),
        );

        pipeline.run().await.unwrap();
        let text = std::fs::read_to_string(log_path).unwrap();
        assert!(text.starts_with("[*] Transaction 0x01\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_provider_error_stops_run() {
        let ledger = MockLedger::with_blocks([(1, empty_block(1))]);
        let config = scan_config(ScanOptions {
            start: 1,
            end: 2,
            ..Default::default()
        });
        let scratch = tempfile::tempdir().unwrap();
        let pipeline = ScanPipeline::new(
            &config,
            BlockRange::new(1, 2).unwrap(),
            Arc::new(ledger),
            classifier(DetectionConfig::default(), IgnoreList::defaults()),
            ArtifactSink::create(scratch.path().join("out")).unwrap(),
            None,
        );

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, ScanError::Provider(ProviderError::Rejected(_))));
    }

    #[test]
    fn test_output_names() {
        let range = BlockRange::new(3, 8).unwrap();
        assert_eq!(default_output_dir(range), PathBuf::from("ext_3-8"));
        assert_eq!(transactions_file(range), PathBuf::from("transactions_3-8.txt"));
        assert_eq!(default_log_file(3, 8), PathBuf::from("etherblob_3-8.log"));
    }
}
