//! Output artifacts: numbered extracted files and the transaction log.

use crate::schemas::Transaction;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes extracted files as `file_{n}` under the run's output directory.
///
/// The sequence number only advances once a file is on disk, so ids are
/// strictly increasing and never reused.
pub struct ArtifactSink {
    dir: PathBuf,
    next_id: u64,
}

/// A file that was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub sequence_id: u64,
    pub path: PathBuf,
}

impl ArtifactSink {
    /// Create the output directory; it must not exist yet.
    pub fn create(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        info!("Creating dir for files at {:?}...", dir);
        std::fs::create_dir(&dir)?;
        Ok(Self { dir, next_id: 0 })
    }

    pub fn persist(
        &mut self,
        bytes: &[u8],
        extension: Option<&str>,
    ) -> std::io::Result<StoredArtifact> {
        let name = match extension {
            Some(ext) => format!("file_{}.{}", self.next_id, ext),
            None => format!("file_{}", self.next_id),
        };
        let path = self.dir.join(name);
        std::fs::write(&path, bytes)?;

        let stored = StoredArtifact {
            sequence_id: self.next_id,
            path,
        };
        self.next_id += 1;
        Ok(stored)
    }
}

/// Human-readable record of every inspected transaction
pub struct TransactionLog {
    writer: BufWriter<File>,
}

impl TransactionLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        info!("Saving transactions to {:?}", path);
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn record(&mut self, tx: &Transaction) -> std::io::Result<()> {
        writeln!(self.writer, "[*] Transaction {}", tx.hash)?;
        for (key, value) in tx.fields() {
            writeln!(self.writer, "\t[-] {}: {}", key, value)?;
        }
        writeln!(self.writer)
    }

    /// Flush once per block so nothing is buffered across blocks.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Best-effort cleanup after a fatal error: drop a log file that never got
/// a line and an output directory that never got a file.
pub fn cleanup_after_failure(log_file: Option<&Path>, output_dir: Option<&Path>) {
    if let Some(log) = log_file {
        if std::fs::metadata(log).map(|m| m.len() == 0).unwrap_or(false) {
            let _ = std::fs::remove_file(log);
        }
    }
    if let Some(dir) = output_dir {
        let empty = std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            let _ = std::fs::remove_dir(dir);
        }
    }
}
