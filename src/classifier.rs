//! Content classification cascade.
//!
//! A blob is run through the enabled methods in fixed priority order
//! (embedded carving, header detection, printable strings, entropy window)
//! and the first method that accepts it wins. At most one classification is
//! produced per blob; persisting it is left to the caller.

use crate::config::{DetectionConfig, IgnoreList};
use crate::identify::{CarveError, CarvedFile, FileIdentifier, SignatureCarver};
use std::fmt;
use thiserror::Error;

/// Shortest printable run kept by the string scanner.
pub const MIN_STRING_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("embedded file carving failed: {0}")]
    Carve(#[from] CarveError),
}

/// Detection method that produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Embedded,
    Header,
    Strings,
    Entropy,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Embedded => write!(f, "embedded"),
            Method::Header => write!(f, "header"),
            Method::Strings => write!(f, "strings"),
            Method::Entropy => write!(f, "entropy"),
        }
    }
}

/// Accepted blob, ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub method: Method,
    pub label: String,
    pub bytes: Vec<u8>,
    /// Suggested file extension for the artifact
    pub extension: Option<&'static str>,
}

pub struct ContentClassifier {
    detection: DetectionConfig,
    ignore: IgnoreList,
    identifier: Box<dyn FileIdentifier>,
    carver: Box<dyn SignatureCarver>,
}

impl ContentClassifier {
    pub fn new(
        detection: DetectionConfig,
        ignore: IgnoreList,
        identifier: Box<dyn FileIdentifier>,
        carver: Box<dyn SignatureCarver>,
    ) -> Self {
        Self {
            detection,
            ignore,
            identifier,
            carver,
        }
    }

    /// Run the cascade over one blob.
    pub fn classify(&self, bytes: &[u8]) -> Result<Option<Classification>, ClassifyError> {
        if bytes.is_empty() || self.ignore.ignores_everything() {
            return Ok(None);
        }

        if self.detection.embedded {
            if let Some(carved) = self.carve_all(bytes)?.into_iter().next() {
                return Ok(Some(Classification {
                    method: Method::Embedded,
                    label: carved.detected_type,
                    bytes: carved.bytes,
                    extension: None,
                }));
            }
        }

        if self.detection.header() {
            if let Some(label) = self.probe_header(bytes) {
                return Ok(Some(Classification {
                    method: Method::Header,
                    label,
                    bytes: bytes.to_vec(),
                    extension: None,
                }));
            }
        }

        if self.detection.strings {
            let strings = printable_strings(bytes, MIN_STRING_LEN);
            if !strings.is_empty() {
                let mut text = strings.join("\n");
                text.push('\n');
                return Ok(Some(Classification {
                    method: Method::Strings,
                    label: "ASCII strings".to_string(),
                    bytes: text.into_bytes(),
                    extension: Some("txt"),
                }));
            }
        }

        if let Some(window) = &self.detection.entropy {
            if window.contains(shannon_entropy(bytes)) {
                return Ok(Some(Classification {
                    method: Method::Entropy,
                    label: window.label.clone(),
                    bytes: bytes.to_vec(),
                    extension: None,
                }));
            }
        }

        Ok(None)
    }

    /// Header/magic detection alone; returns the label when not ignored.
    pub fn probe_header(&self, bytes: &[u8]) -> Option<String> {
        if bytes.is_empty() || self.ignore.ignores_everything() {
            return None;
        }
        let label = self.identifier.identify(bytes);
        (!self.ignore.is_ignored(&label)).then_some(label)
    }

    /// Every carved file whose detected type is not ignored, in offset order.
    pub fn carve_all(&self, bytes: &[u8]) -> Result<Vec<CarvedFile>, ClassifyError> {
        if bytes.is_empty() || self.ignore.ignores_everything() {
            return Ok(Vec::new());
        }
        let mut carved = self.carver.scan(bytes)?;
        carved.retain(|c| !self.ignore.is_ignored(&c.detected_type));
        carved.sort_by_key(|c| c.offset);
        Ok(carved)
    }
}

/// Shannon entropy in bits per byte (0.0 to 8.0).
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }

    let mut counts = [0usize; 256];
    for b in bytes {
        counts[*b as usize] += 1;
    }

    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Runs of printable ASCII (0x20..=0x7E) at least `min_len` long.
pub fn printable_strings(bytes: &[u8], min_len: usize) -> Vec<String> {
    let mut found = Vec::new();
    let mut current = String::new();

    for b in bytes {
        if (0x20..=0x7e).contains(b) {
            current.push(*b as char);
        } else {
            if current.len() >= min_len {
                found.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() >= min_len {
        found.push(current);
    }

    found
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::EntropyWindow;

    fn png_blob() -> Vec<u8> {
        let mut blob = PNG_MAGIC.to_vec();
        blob.extend((0u8..=255).cycle().take(512));
        blob
    }

    /// 216 distinct byte values once each: log2(216) ~= 7.75 bits.
    fn high_entropy_blob() -> Vec<u8> {
        (0u8..216).collect()
    }

    #[test]
    fn test_header_detection_is_default() {
        let classifier = classifier(DetectionConfig::default(), IgnoreList::defaults());
        let result = classifier.classify(&png_blob()).unwrap().unwrap();
        assert_eq!(result.method, Method::Header);
        assert_eq!(result.label, PNG_LABEL);
        assert_eq!(result.bytes, png_blob());
    }

    #[test]
    fn test_header_wins_over_entropy() {
        let detection = DetectionConfig {
            entropy: Some(EntropyWindow::custom(0.0, 8.0)),
            ..Default::default()
        };
        let classifier = classifier(detection, IgnoreList::defaults());
        let result = classifier.classify(&png_blob()).unwrap().unwrap();
        assert_eq!(result.method, Method::Header);
    }

    #[test]
    fn test_header_wins_over_encrypted_preset() {
        let detection = DetectionConfig {
            entropy: Some(EntropyWindow::encrypted()),
            ..Default::default()
        };
        let classifier = classifier(detection, IgnoreList::defaults());
        let blob = png_blob();
        assert!(EntropyWindow::encrypted().contains(shannon_entropy(&blob)));

        let result = classifier.classify(&blob).unwrap().unwrap();
        assert_eq!(result.method, Method::Header);
        assert_eq!(result.label, PNG_LABEL);
    }

    #[test]
    fn test_entropy_presets() {
        // 16 distinct letters once each: exactly 4 bits.
        let text_like: Vec<u8> = (b'a'..=b'p').collect();
        let unicode = classifier(
            DetectionConfig {
                entropy: Some(EntropyWindow::unicode()),
                ..Default::default()
            },
            IgnoreList::defaults(),
        );
        let encrypted = classifier(
            DetectionConfig {
                entropy: Some(EntropyWindow::encrypted()),
                ..Default::default()
            },
            IgnoreList::defaults(),
        );

        let result = unicode.classify(&text_like).unwrap().unwrap();
        assert_eq!(result.method, Method::Entropy);
        assert_eq!(result.label, "possible UTF-8 text");
        assert!(unicode.classify(&high_entropy_blob()).unwrap().is_none());

        let result = encrypted.classify(&high_entropy_blob()).unwrap().unwrap();
        assert_eq!(result.label, "possible encrypted/compressed data");
        assert!(encrypted.classify(&text_like).unwrap().is_none());
    }

    #[test]
    fn test_embedded_finds_file_past_offset_zero() {
        let detection = DetectionConfig {
            embedded: true,
            ..Default::default()
        };
        let classifier = classifier(detection, IgnoreList::defaults());
        let mut blob = b"garbage-prefix".to_vec();
        blob.extend(png_blob());

        let result = classifier.classify(&blob).unwrap().unwrap();
        assert_eq!(result.method, Method::Embedded);
        assert!(result.bytes.starts_with(PNG_MAGIC));
    }

    #[test]
    fn test_data_label_never_extracted() {
        let classifier = classifier(
            DetectionConfig::default(),
            IgnoreList::from_patterns::<&str>(&[]),
        );
        assert!(classifier.classify(b"\x00\x01\x02\x03").unwrap().is_none());
    }

    #[test]
    fn test_wildcard_disables_everything() {
        let detection = DetectionConfig {
            embedded: false,
            strings: true,
            entropy: Some(EntropyWindow::custom(0.0, 8.0)),
        };
        let classifier = classifier(detection, IgnoreList::from_patterns(&["*"]));
        assert!(classifier.classify(&png_blob()).unwrap().is_none());
        assert!(classifier.classify(b"just some printable text").unwrap().is_none());
    }

    #[test]
    fn test_ignored_header_falls_through_to_strings() {
        let detection = DetectionConfig {
            strings: true,
            ..Default::default()
        };
        let classifier = classifier(detection, IgnoreList::from_patterns(&["gif"]));
        let mut blob = b"GIF89a".to_vec();
        blob.extend(b"\x00\x01hello world, hidden message\x02short\x00");

        let result = classifier.classify(&blob).unwrap().unwrap();
        assert_eq!(result.method, Method::Strings);
        assert_eq!(result.bytes, b"hello world, hidden message\n".to_vec());
        assert_eq!(result.extension, Some("txt"));
    }

    #[test]
    fn test_custom_entropy_window() {
        let detection = DetectionConfig {
            entropy: Some(EntropyWindow::custom(7.5, 8.0)),
            ..Default::default()
        };
        let classifier = classifier(detection, IgnoreList::defaults());
        let result = classifier.classify(&high_entropy_blob()).unwrap().unwrap();
        assert_eq!(result.method, Method::Entropy);
        assert_eq!(result.label, "from custom entropy");

        let detection = DetectionConfig {
            entropy: Some(EntropyWindow::custom(3.5, 5.0)),
            ..Default::default()
        };
        let classifier = super::testing::classifier(detection, IgnoreList::defaults());
        assert!(classifier.classify(&high_entropy_blob()).unwrap().is_none());
    }

    #[test]
    fn test_classification_is_repeatable() {
        let classifier = classifier(DetectionConfig::default(), IgnoreList::defaults());
        let first = classifier.classify(&png_blob()).unwrap().unwrap();
        let second = classifier.classify(&png_blob()).unwrap().unwrap();
        assert_eq!(first.method, second.method);
        assert_eq!(first.label, second.label);
    }

    #[test]
    fn test_carver_only_runs_in_embedded_mode() {
        let carver = FakeCarver::default();
        let calls = carver.calls.clone();
        let header_only = ContentClassifier::new(
            DetectionConfig::default(),
            IgnoreList::defaults(),
            Box::new(FakeIdentifier),
            Box::new(carver),
        );
        header_only.classify(&png_blob()).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        header_only.carve_all(&png_blob()).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shannon_entropy() {
        assert_eq!(shannon_entropy(b""), 0.0);
        assert_eq!(shannon_entropy(b"aaaa"), 0.0);
        assert!((shannon_entropy(b"abab") - 1.0).abs() < 1e-9);
        let all: Vec<u8> = (0u8..=255).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
        let e = shannon_entropy(&high_entropy_blob());
        assert!(e > 7.7 && e < 7.8);
    }

    #[test]
    fn test_printable_strings_min_length() {
        let strings = printable_strings(b"short\x00exactly8\x01tail-end-run", MIN_STRING_LEN);
        assert_eq!(strings, vec!["exactly8".to_string(), "tail-end-run".to_string()]);
    }
}
