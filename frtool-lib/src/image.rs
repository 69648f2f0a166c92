//! ROM image transformation: padding to a chip capacity before a write,
//! truncating back to a logical size after a read.
//!
//! All transforms are pure and allocate a fresh buffer; the caller's bytes
//! are never mutated in place. Erased NOR flash reads as 0xFF, hence the
//! default fill byte.

use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Fill byte appended when padding an image up to chip capacity.
pub const FILL_BYTE: u8 = 0xFF;

/// Pads `image` with `fill` bytes up to exactly `target_size`.
///
/// Returns the image unchanged (copied) when it already has the target size,
/// and fails with [`Error::ImageTooLarge`] when it would have to shrink.
pub fn pad(image: &[u8], target_size: u64, fill: u8) -> Result<Vec<u8>> {
    if target_size == 0 {
        return Err(Error::invalid_argument("target size must be positive"));
    }
    let len = image.len() as u64;
    if len > target_size {
        return Err(Error::ImageTooLarge {
            image: len,
            capacity: target_size,
        });
    }
    let mut out = Vec::with_capacity(target_size as usize);
    out.extend_from_slice(image);
    out.resize(target_size as usize, fill);
    Ok(out)
}

/// Truncates `image` to its first `logical_size` bytes.
///
/// Only ever removes a trailing run; the content is not inspected and no
/// boundary is guessed.
pub fn unpad(image: &[u8], logical_size: u64) -> Result<Vec<u8>> {
    if logical_size == 0 {
        return Err(Error::invalid_argument("logical size must be positive"));
    }
    if logical_size > image.len() as u64 {
        return Err(Error::invalid_argument(format!(
            "logical size {} exceeds image length {}",
            logical_size,
            image.len()
        )));
    }
    Ok(image[..logical_size as usize].to_vec())
}

/// Returns the length of `image` with the trailing run of [`FILL_BYTE`]
/// stripped. An all-fill image trims to zero.
///
/// This is the heuristic counterpart to [`unpad`]: it finds the boundary by
/// content. Callers that know the logical size should prefer `unpad`.
pub fn trim_padding(image: &[u8]) -> usize {
    let mut end = image.len();
    while end > 0 && image[end - 1] == FILL_BYTE {
        end -= 1;
    }
    end
}

/// A ROM image on disk. The length is known from the moment the file is
/// opened; the content buffer is loaded lazily and can be released once the
/// operation that owns the image is done with it.
#[derive(Debug)]
pub struct ImageFile {
    path: PathBuf,
    len: u64,
    data: Option<Vec<u8>>,
}

impl ImageFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = fs::metadata(&path)?.len();
        Ok(Self {
            path,
            len,
            data: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the content into memory on first use.
    pub fn load(&mut self) -> Result<&[u8]> {
        if self.data.is_none() {
            let data = fs::read(&self.path)?;
            self.len = data.len() as u64;
            self.data = Some(data);
        }
        Ok(self.data.as_deref().unwrap_or_default())
    }

    /// Drops the content buffer; the file can be re-loaded later.
    pub fn release(&mut self) {
        self.data = None;
    }
}
