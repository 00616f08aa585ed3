//! Contract storage harvesting.
//!
//! Every contract touched by a transaction (as recipient or as the created
//! contract) is inspected once: the first `positions` storage slots are read
//! and their non-zero words concatenated into one blob.

use crate::bytes::to_bytes;
use crate::feed::{retry_transient, RetryState};
use crate::provider::{LedgerProvider, ProviderError};
use crate::schemas::{BlobOrigin, CandidateBlob, Transaction};
use alloy_primitives::Address;
use std::collections::HashSet;
use tracing::debug;

/// Seen-contract bookkeeping plus slot reading
pub struct ContractInspector {
    positions: u32,
    visited: HashSet<Address>,
    retry: RetryState,
}

impl ContractInspector {
    pub fn new(positions: u32) -> Self {
        Self {
            positions,
            visited: HashSet::new(),
            retry: RetryState::default(),
        }
    }

    /// Addresses of `tx` that have not been inspected yet, marked visited.
    pub fn claim(&mut self, tx: &Transaction) -> Vec<Address> {
        [tx.to, tx.creates]
            .into_iter()
            .flatten()
            .filter(|address| self.visited.insert(*address))
            .collect()
    }

    /// Storage blob of `address`, or `None` when it is not a contract or
    /// every inspected slot is zero.
    pub async fn harvest(
        &mut self,
        provider: &dyn LedgerProvider,
        address: Address,
    ) -> Result<Option<CandidateBlob>, ProviderError> {
        let code = retry_transient(&mut self.retry, format!("code of '{address}'"), || {
            provider.code_at(address)
        })
        .await?;

        if to_bytes(Some(code.as_str())).is_err() {
            debug!("{} holds no code, skipping", address);
            return Ok(None);
        }

        let mut blob = Vec::new();
        for slot in 0..self.positions {
            let word = retry_transient(
                &mut self.retry,
                format!("slot {slot} of '{address}'"),
                || provider.storage_at(address, slot),
            )
            .await?;

            // Zero words carry nothing.
            if let Ok(data) = to_bytes(Some(word.as_str())) {
                blob.extend_from_slice(&data);
            }
        }

        if blob.is_empty() {
            return Ok(None);
        }
        Ok(Some(CandidateBlob::new(
            blob,
            BlobOrigin::ContractStorage,
            address.to_string(),
        )))
    }
}
