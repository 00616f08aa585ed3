//! File-type identification and signature carving collaborators.
//!
//! The classifier never inspects magic bytes itself. It asks a
//! [`FileIdentifier`] for a label describing the leading bytes and a
//! [`SignatureCarver`] for files embedded anywhere in the blob. The default
//! implementations shell out to `file` (libmagic) and `binwalk`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Label returned when nothing is recognized.
pub const UNKNOWN_LABEL: &str = "data";

/// Best-effort type identification from leading bytes.
pub trait FileIdentifier: Send + Sync {
    /// Never fails; returns [`UNKNOWN_LABEL`] when the format is unknown.
    fn identify(&self, bytes: &[u8]) -> String;
}

/// A file carved out of a larger buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarvedFile {
    pub offset: u64,
    pub detected_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum CarveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("carver exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Signature scanner able to find and extract files at any offset.
pub trait SignatureCarver: Send + Sync {
    fn scan(&self, bytes: &[u8]) -> Result<Vec<CarvedFile>, CarveError>;
}

/// Identifier backed by the `file` command reading from stdin.
#[derive(Debug)]
pub struct FileCommandIdentifier {
    program: PathBuf,
    /// Set once a failed invocation has been reported.
    warned: AtomicBool,
}

impl Default for FileCommandIdentifier {
    fn default() -> Self {
        Self::with_program("file")
    }
}

impl FileCommandIdentifier {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            warned: AtomicBool::new(false),
        }
    }

    fn run(&self, bytes: &[u8]) -> std::io::Result<String> {
        let mut child = Command::new(&self.program)
            .args(["-b", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // `file` may stop reading after the header; a broken pipe is fine.
            let _ = stdin.write_all(bytes);
        }

        let output = child.wait_with_output()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl FileIdentifier for FileCommandIdentifier {
    fn identify(&self, bytes: &[u8]) -> String {
        match self.run(bytes) {
            Ok(label) if !label.is_empty() => label,
            Ok(_) => UNKNOWN_LABEL.to_string(),
            Err(e) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Could not run {:?} ({}), every payload will be labelled '{}'",
                        self.program, e, UNKNOWN_LABEL
                    );
                } else {
                    debug!("file identification failed: {}", e);
                }
                UNKNOWN_LABEL.to_string()
            }
        }
    }
}

/// Carver backed by `binwalk` working inside a scratch directory.
///
/// The blob is written to a temporary directory, binwalk extracts into a
/// subdirectory of it, and the whole tree is removed when the guard drops,
/// whether the scan succeeded or not.
#[derive(Debug, Clone)]
pub struct BinwalkCarver {
    program: PathBuf,
    extra_args: Vec<String>,
    /// Parent of the per-scan scratch directories; system temp dir if unset.
    scratch_root: Option<PathBuf>,
}

impl Default for BinwalkCarver {
    fn default() -> Self {
        Self::new("binwalk", Vec::new())
    }
}

impl BinwalkCarver {
    pub fn new(program: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
            scratch_root: None,
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }
}

impl SignatureCarver for BinwalkCarver {
    fn scan(&self, bytes: &[u8]) -> Result<Vec<CarvedFile>, CarveError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("etherblob-");
        let scratch = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let blob_path = scratch.path().join("blob.bin");
        let out_dir = scratch.path().join("carved");
        std::fs::write(&blob_path, bytes)?;

        let output = Command::new(&self.program)
            .arg("--signature")
            .arg("--extract")
            .arg("--dd=.*")
            .arg("--directory")
            .arg(&out_dir)
            .args(&self.extra_args)
            .arg(&blob_path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(CarveError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let listing = parse_scan_listing(&String::from_utf8_lossy(&output.stdout));
        let carved = collect_carved(&out_dir, &listing)?;
        debug!(
            "binwalk reported {} signatures, carved {} files",
            listing.len(),
            carved.len()
        );

        Ok(carved)
    }
}

/// Parse the `DECIMAL HEXADECIMAL DESCRIPTION` table binwalk prints.
pub fn parse_scan_listing(stdout: &str) -> BTreeMap<u64, String> {
    let mut found = BTreeMap::new();

    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(decimal), Some(hexadecimal)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(offset) = decimal.parse::<u64>() else {
            continue;
        };
        if !hexadecimal.starts_with("0x") {
            continue;
        }
        let description = parts.collect::<Vec<_>>().join(" ");
        found.entry(offset).or_insert(description);
    }

    found
}

/// Pair carved outputs (named by hex offset) with the reported signatures.
fn collect_carved(
    out_dir: &Path,
    listing: &BTreeMap<u64, String>,
) -> Result<Vec<CarvedFile>, CarveError> {
    let mut by_offset: BTreeMap<u64, PathBuf> = BTreeMap::new();
    if !out_dir.exists() {
        return Ok(Vec::new());
    }

    for extraction in std::fs::read_dir(out_dir)? {
        let extraction = extraction?.path();
        if !extraction.is_dir() {
            continue;
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&extraction)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        for path in entries {
            if let Some(offset) = offset_from_name(&path) {
                by_offset.entry(offset).or_insert(path);
            }
        }
    }

    let mut carved = Vec::new();
    for (offset, description) in listing {
        if let Some(path) = by_offset.get(offset) {
            carved.push(CarvedFile {
                offset: *offset,
                detected_type: description.clone(),
                bytes: std::fs::read(path)?,
            });
        }
    }
    Ok(carved)
}

fn offset_from_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next()?;
    u64::from_str_radix(stem, 16).ok()
}
