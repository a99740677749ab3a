//! The filenames table stored after the covmap header.
//!
//! ```text
//! <num-filenames: uleb>
//! <uncompressed-len: uleb>
//! <compressed-len-or-zero: uleb>
//! <zlib(filenames) | filenames>
//!
//! filenames ::= (<len: uleb> <bytes>)*
//! ```
//!
//! The hash that function records use to point at this table is taken over
//! the encoded bytes above, after compression, because that is what the
//! reader hashes when it loads the section.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use crate::error::CoverageError;
use crate::hash::name_hash;
use crate::leb128::write_uleb128;

/// Ordered list of source file paths referenced by one module's mappings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilenameTable {
    files: Vec<String>,
}

/// The serialized table and its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFilenames {
    pub blob: Vec<u8>,
    /// Low 64 bits of the MD5 of `blob`.
    pub hash: u64,
}

impl FilenameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding exactly one file.
    pub fn single(path: impl Into<String>) -> Self {
        Self {
            files: vec![path.into()],
        }
    }

    /// Append `path`, returning its index. Paths already present are not
    /// duplicated.
    pub fn insert(&mut self, path: impl Into<String>) -> u32 {
        let path = path.into();
        if let Some(index) = self.files.iter().position(|f| *f == path) {
            return index as u32;
        }
        self.files.push(path);
        (self.files.len() - 1) as u32
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Length-prefixed concatenation of every path, before compression.
    fn raw_filenames(&self) -> Vec<u8> {
        let mut raw = Vec::new();
        for file in &self.files {
            write_uleb128(&mut raw, file.len() as u64);
            raw.extend_from_slice(file.as_bytes());
        }
        raw
    }

    /// Serialize the table, zlib-compressing the filenames when `compress`
    /// is set.
    pub fn encode(&self, compress: bool) -> Result<EncodedFilenames, CoverageError> {
        let raw = self.raw_filenames();

        let compressed = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&raw)?;
            Some(encoder.finish()?)
        } else {
            None
        };

        let mut blob = Vec::new();
        write_uleb128(&mut blob, self.files.len() as u64);
        write_uleb128(&mut blob, raw.len() as u64);
        match compressed {
            Some(compressed) => {
                write_uleb128(&mut blob, compressed.len() as u64);
                blob.extend_from_slice(&compressed);
            }
            None => {
                write_uleb128(&mut blob, 0);
                blob.extend_from_slice(&raw);
            }
        }

        let hash = name_hash(&blob);
        trace!(
            files = self.files.len(),
            raw_len = raw.len(),
            blob_len = blob.len(),
            hash = format_args!("{:#018x}", hash),
            "encoded filenames table"
        );
        Ok(EncodedFilenames { blob, hash })
    }
}
