//! Ledger data schemas.
//!
//! Wire types mirror the provider's JSON (hex strings, camelCase keys); the
//! remaining types are the units passed between scan components.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type BlockId = u64;

// ============================================================================
// Wire types
// ============================================================================

/// Block with full transaction objects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Hex-encoded block number
    pub number: Option<String>,

    /// Free-form miner data (hex)
    #[serde(default)]
    pub extra_data: Option<String>,

    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Numeric block id, when the provider reported one.
    pub fn id(&self) -> Option<BlockId> {
        let number = self.number.as_deref()?;
        u64::from_str_radix(number.trim_start_matches("0x"), 16).ok()
    }
}

/// Transaction as returned inside a block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,

    pub from: Address,

    /// Empty when the transaction creates a contract
    #[serde(default)]
    pub to: Option<Address>,

    /// Call data (hex)
    #[serde(default)]
    pub input: Option<String>,

    /// Address of the created contract, when reported
    #[serde(default)]
    pub creates: Option<Address>,

    /// Every other field, kept for the transaction log
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Transaction {
    /// `(key, value)` pairs for every field except the hash.
    pub fn fields(&self) -> Vec<(String, String)> {
        let optional = |a: &Option<Address>| a.map(|a| a.to_string()).unwrap_or_else(|| "None".into());

        let mut fields = vec![
            ("from".to_string(), self.from.to_string()),
            ("to".to_string(), optional(&self.to)),
            (
                "input".to_string(),
                self.input.clone().unwrap_or_else(|| "None".into()),
            ),
        ];
        if self.creates.is_some() {
            fields.push(("creates".to_string(), optional(&self.creates)));
        }
        for (key, value) in &self.extra {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            fields.push((key.clone(), rendered));
        }
        fields
    }
}

// ============================================================================
// Scan units
// ============================================================================

/// Where a blob was harvested from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobOrigin {
    Transaction,
    Block,
    ContractStorage,
}

impl fmt::Display for BlobOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobOrigin::Transaction => write!(f, "inside transaction"),
            BlobOrigin::Block => write!(f, "on block"),
            BlobOrigin::ContractStorage => write!(f, "in storage of contract"),
        }
    }
}

/// The unit fed to the classifier
#[derive(Debug, Clone)]
pub struct CandidateBlob {
    pub bytes: Vec<u8>,
    pub origin: BlobOrigin,
    pub origin_id: String,
}

impl CandidateBlob {
    pub fn new(bytes: Vec<u8>, origin: BlobOrigin, origin_id: impl Into<String>) -> Self {
        Self {
            bytes,
            origin,
            origin_id: origin_id.into(),
        }
    }
}
