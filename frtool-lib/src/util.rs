use crate::{Error, Result};

/// Parses a chip-capacity string such as `16777216`, `0x1000000`, `16384K`
/// or `16M` into a byte count. Unit suffixes are binary, matching how chip
/// capacities are declared.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();

    let (num_str, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let unsigned: u64 = if let Some(hex) = num_str.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = num_str.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else if let Some(oct) = num_str.strip_prefix("0o") {
        u64::from_str_radix(oct, 8)
    } else {
        num_str.parse()
    }
    .map_err(|e| Error::invalid_argument(format!("invalid size '{}': {}", s, e)))?;

    unsigned
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid_argument(format!("size '{}' overflows", s)))
}

/// Multiplier for a capacity unit as printed by the tool (`kB`, `KB`, `MB`...).
/// Binary units throughout; flashrom's `kB` is 1024 bytes.
pub(crate) fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "b" => Some(1),
        "kb" | "kib" => Some(1024),
        "mb" | "mib" => Some(1024 * 1024),
        "gb" | "gib" => Some(1024 * 1024 * 1024),
        _ => None,
    }
}
