//! Known-chip bookkeeping derived from probe output.

use crate::progress::ProgressEvent;

/// Identity and declared capacity of a probed flash chip.
///
/// Immutable once created; a re-probe produces a fresh value rather than
/// mutating an old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    /// Vendor string as reported by the tool, e.g. `Winbond`.
    pub vendor: String,
    /// Part string, e.g. `W25Q128.V`.
    pub part: String,
    /// Declared capacity in bytes.
    pub capacity: u64,
    /// Optional human-readable name, when the tool reports one.
    pub name: Option<String>,
}

impl ChipInfo {
    /// The `vendor part` string used for catalog lookups and for chip
    /// selection flags passed back to the tool.
    pub fn identifier(&self) -> String {
        format!("{} {}", self.vendor, self.part)
    }
}

/// Snapshot of the chips found by one probe operation.
///
/// Read-mostly and immutable after construction; every probe builds a new
/// snapshot instead of mutating the previous one, so stale references held
/// by a front-end stay internally consistent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipCatalog {
    chips: Vec<ChipInfo>,
}

impl ChipCatalog {
    /// Collects every `ChipDetected` event of a finished job, in detection
    /// order.
    pub fn from_events(events: &[ProgressEvent]) -> Self {
        let chips = events
            .iter()
            .filter_map(|ev| match ev {
                ProgressEvent::ChipDetected(chip) => Some(chip.clone()),
                _ => None,
            })
            .collect();
        Self { chips }
    }

    pub fn chips(&self) -> &[ChipInfo] {
        &self.chips
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    /// More than one candidate chip matched the probe; front-ends should ask
    /// the user to pick one before flashing.
    pub fn is_ambiguous(&self) -> bool {
        self.chips.len() > 1
    }

    pub fn get(&self, identifier: &str) -> Option<&ChipInfo> {
        self.chips
            .iter()
            .find(|c| c.identifier().eq_ignore_ascii_case(identifier))
    }

    pub fn capacity_of(&self, identifier: &str) -> Option<u64> {
        self.get(identifier).map(|c| c.capacity)
    }

    /// The single detected chip, if the probe was unambiguous.
    pub fn sole_chip(&self) -> Option<&ChipInfo> {
        match self.chips.as_slice() {
            [chip] => Some(chip),
            _ => None,
        }
    }
}
