//! Cross-transaction accumulation of data smuggled through recipient
//! addresses.
//!
//! The recipient field of each transaction is probed with header detection.
//! A hit marks the *sender* as tracked; from then on every transaction from
//! that sender appends its recipient bytes to the sender's buffer. Buffers are
//! carved once, at the end of the run.

use crate::bytes::trim_word;
use crate::classifier::{ClassifyError, ContentClassifier};
use crate::identify::CarvedFile;
use crate::schemas::{BlockId, Transaction};
use alloy_primitives::Address;
use std::collections::HashMap;
use tracing::info;

/// Buffer grown for one sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAddress {
    pub address: Address,
    pub accumulated: Vec<u8>,
    pub first_seen_block: BlockId,
}

#[derive(Debug, Default)]
pub struct AddressAccumulator {
    tracked: HashMap<Address, TrackedAddress>,
}

/// Files carved from one sender's buffer
#[derive(Debug)]
pub struct AddressFiles {
    pub address: Address,
    pub files: Vec<CarvedFile>,
}

impl AddressAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Inspect one transaction's recipient field.
    pub fn observe(&mut self, tx: &Transaction, block: BlockId, classifier: &ContentClassifier) {
        // Contract creations carry no recipient.
        let Some(to) = tx.to else {
            return;
        };

        // The zero address decodes to nothing.
        let Ok(data) = trim_word(to.as_slice()) else {
            return;
        };

        if let Some(label) = classifier.probe_header(&data) {
            if !self.tracked.contains_key(&tx.from) {
                info!(
                    "Found file header ({}) in transaction '{}' coming from address '{}'...",
                    label, tx.hash, tx.from
                );
                self.tracked.insert(
                    tx.from,
                    TrackedAddress {
                        address: tx.from,
                        accumulated: Vec::new(),
                        first_seen_block: block,
                    },
                );
            }
        }

        if let Some(entry) = self.tracked.get_mut(&tx.from) {
            entry.accumulated.extend_from_slice(&data);
            info!(
                "Adding more data to possible file from address '{}'...",
                tx.from
            );
        }
    }

    /// Carve every buffer once. Consumes the accumulator.
    pub fn resolve(self, classifier: &ContentClassifier) -> Result<Vec<AddressFiles>, ClassifyError> {
        let mut entries: Vec<TrackedAddress> = self.tracked.into_values().collect();
        entries.sort_by(|a, b| {
            a.first_seen_block
                .cmp(&b.first_seen_block)
                .then_with(|| a.address.cmp(&b.address))
        });

        info!("Starting extraction for {} tracked addresses...", entries.len());

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let files = classifier.carve_all(&entry.accumulated)?;
            results.push(AddressFiles {
                address: entry.address,
                files,
            });
        }
        Ok(results)
    }
}
