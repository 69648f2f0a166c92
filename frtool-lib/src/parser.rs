//! Line-oriented parser for the flashing tool's output.
//!
//! The tool's combined stdout/stderr is unstructured text; each line maps to
//! at most one [`ProgressEvent`]. The recognizable line shapes live in a
//! [`Dialect`] so front-ends can adjust them without touching the parser —
//! the exact strings a given tool build prints are not a stable contract.
//!
//! Exit-status mapping (`Completed(true/false)`) is synthesized by the job
//! runner, which owns the process; this parser only ever sees lines.

use crate::catalog::ChipInfo;
use crate::error::ErrorKind;
use crate::progress::ProgressEvent;
use crate::util;

/// The output vocabulary of one flashing tool.
///
/// Defaults match flashrom, e.g.
/// `Found Winbond flash chip "W25Q128.V" (16384 kB, SPI) on ch341a_spi.`
#[derive(Debug, Clone)]
pub struct Dialect {
    /// Text introducing a chip identification line, up to the vendor.
    pub chip_prefix: String,
    /// Text between the vendor and the (possibly quoted) part string.
    pub chip_infix: String,
    /// Substring signatures mapped to specific error kinds; first match wins.
    pub error_signatures: Vec<(String, ErrorKind)>,
    /// Substrings that mark a line as a failure even when unclassified.
    pub generic_error_markers: Vec<String>,
}

impl Default for Dialect {
    fn default() -> Self {
        let sig = |s: &str, k: ErrorKind| (s.to_string(), k);
        Self {
            chip_prefix: "Found ".to_string(),
            chip_infix: " flash chip ".to_string(),
            error_signatures: vec![
                sig("Permission denied", ErrorKind::AccessDenied),
                sig("Access denied", ErrorKind::AccessDenied),
                sig("insufficient permissions", ErrorKind::AccessDenied),
                sig("No EEPROM/flash device found", ErrorKind::ChipNotFound),
                sig("no flash chip found", ErrorKind::ChipNotFound),
                sig("VERIFY FAILED", ErrorKind::VerificationMismatch),
                sig("Verification failed", ErrorKind::VerificationMismatch),
            ],
            generic_error_markers: vec![
                "Error:".to_string(),
                "ERROR".to_string(),
                "FAILED".to_string(),
                "Aborting".to_string(),
            ],
        }
    }
}

/// Stateless classifier turning one output line into zero or one event.
#[derive(Debug, Clone, Default)]
pub struct OutputParser {
    dialect: Dialect,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Classifies one line. Blank lines yield nothing; anything malformed
    /// degrades to `Message` with the raw text — this never fails.
    pub fn parse_line(&self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim_end_matches(['\r', '\n']).trim();
        if line.is_empty() {
            return None;
        }

        if let Some(chip) = self.parse_chip(line) {
            return Some(ProgressEvent::ChipDetected(chip));
        }

        for (signature, kind) in &self.dialect.error_signatures {
            if line.contains(signature.as_str()) {
                return Some(ProgressEvent::Failed {
                    kind: *kind,
                    detail: line.to_string(),
                });
            }
        }
        if self
            .dialect
            .generic_error_markers
            .iter()
            .any(|m| line.contains(m.as_str()))
        {
            return Some(ProgressEvent::Failed {
                kind: ErrorKind::Unknown,
                detail: line.to_string(),
            });
        }

        if let Some(percent) = parse_percent(line) {
            return Some(ProgressEvent::Percent(percent));
        }

        Some(ProgressEvent::Message(line.to_string()))
    }

    fn parse_chip(&self, line: &str) -> Option<ChipInfo> {
        let start = line.find(self.dialect.chip_prefix.as_str())?;
        let rest = &line[start + self.dialect.chip_prefix.len()..];
        let infix_at = rest.find(self.dialect.chip_infix.as_str())?;

        let vendor = rest[..infix_at].trim();
        if vendor.is_empty() {
            return None;
        }

        let tail = rest[infix_at + self.dialect.chip_infix.len()..].trim_start();
        let (part, tail) = if let Some(quoted) = tail.strip_prefix('"') {
            let end = quoted.find('"')?;
            (quoted[..end].trim(), &quoted[end + 1..])
        } else {
            let end = tail.find([' ', '(']).unwrap_or(tail.len());
            (tail[..end].trim(), &tail[end..])
        };
        if part.is_empty() {
            return None;
        }

        Some(ChipInfo {
            vendor: vendor.to_string(),
            part: part.to_string(),
            capacity: parse_capacity(tail)?,
            name: None,
        })
    }
}

/// Capacity from the parenthesized part of a chip line: `(16384 kB, SPI)`.
fn parse_capacity(tail: &str) -> Option<u64> {
    let open = tail.find('(')?;
    let close = tail[open..].find(')')? + open;
    let first = tail[open + 1..close].split(',').next()?.trim();

    let mut words = first.split_whitespace();
    let value: u64 = words.next()?.parse().ok()?;
    let multiplier = util::unit_multiplier(words.next().unwrap_or("B"))?;
    value.checked_mul(multiplier)
}

/// A percentage marker anywhere in the line, e.g. `12%` or `Erasing... 40%`.
fn parse_percent(line: &str) -> Option<u8> {
    let percent_at = line.rfind('%')?;
    let before = &line[..percent_at];
    let digits_start = before
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let digits = &before[digits_start..];
    if digits.is_empty() {
        return None;
    }
    let value: u32 = digits.parse().ok()?;
    (value <= 100).then_some(value as u8)
}
