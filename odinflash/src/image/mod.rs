//! Firmware image sources.
//!
//! An [`ImageStream`] couples a name and a declared length with a bounded
//! reader; the bulk engine trusts the length for chunk planning and the
//! reader is clamped so it can never hand over more bytes than declared,
//! wherever they come from (a file, a tar entry, a decompressor).

pub mod tar;

use std::fs::File;
use std::io::{self, BufReader, Read, Take};
use std::path::Path;

use crate::error::Result;

/// Filename suffixes treated as flashable images inside an archive.
pub const IMAGE_SUFFIXES: &[&str] = &[".img", ".bin"];

/// Filename suffix of a partition table inside an archive.
pub const PIT_SUFFIX: &str = ".pit";

/// A named, bounded stream of image bytes.
pub struct ImageStream<R: Read> {
    name: String,
    size: u64,
    reader: Take<R>,
}

impl<R: Read> ImageStream<R> {
    /// Wrap a reader as an image of exactly `size` bytes.
    pub fn new(name: impl Into<String>, size: u64, reader: R) -> Self {
        Self {
            name: name.into(),
            size,
            reader: reader.take(size),
        }
    }

    /// The image name used for logging and failure reporting.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared length of the stream.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl ImageStream<BufReader<File>> {
    /// Open a file on disk as an image stream.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, size, BufReader::new(file)))
    }
}

impl<R: Read> Read for ImageStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Case-insensitive suffix match on an entry name.
pub fn has_suffix_ignore_case(name: &str, suffix: &str) -> bool {
    let name = name.as_bytes();
    let suffix = suffix.as_bytes();
    name.len() >= suffix.len() && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

/// Whether an archive entry name looks like a flashable image.
pub fn is_flashable_image(name: &str) -> bool {
    IMAGE_SUFFIXES
        .iter()
        .any(|suffix| has_suffix_ignore_case(name, suffix))
}

/// Whether an archive entry name looks like a partition table.
pub fn is_pit_name(name: &str) -> bool {
    has_suffix_ignore_case(name, PIT_SUFFIX)
}
