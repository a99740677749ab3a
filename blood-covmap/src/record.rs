//! Coverage section records.
//!
//! Two record kinds end up in the object file:
//!
//! - one [`CoverageModuleHeader`] per module in the covmap section, followed
//!   directly by the encoded filenames table;
//! - one [`CoverageFunctionRecord`] per surviving instrumented function in
//!   the covfun section.
//!
//! Both layouts are little-endian regardless of the host.

use crate::error::{CoverageError, MappingError};
use crate::hash::FunctionIdentity;
use crate::host::ConstData;

/// Version field of the covmap header (LLVM's `CovMapVersion::Version6`).
pub const COVERAGE_MAPPING_VERSION: u32 = 6;

/// Size of the covmap header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of the fixed part of a covfun record in bytes.
pub const FUNCTION_RECORD_HEADER_SIZE: usize = 28;

/// `{u32 0, u32 filenames_length, u32 0, u32 version}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageModuleHeader {
    pub filenames_length: u32,
    pub version: u32,
}

impl CoverageModuleHeader {
    /// Header for a filenames blob of `filenames_length` bytes.
    pub fn new(filenames_length: u32) -> Self {
        Self {
            filenames_length,
            version: COVERAGE_MAPPING_VERSION,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[4..8].copy_from_slice(&self.filenames_length.to_le_bytes());
        out[12..16].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    /// Parse the header at the start of a covmap section.
    pub fn parse(bytes: &[u8]) -> Result<Self, MappingError> {
        if bytes.len() < HEADER_SIZE {
            return Err(MappingError::Malformed {
                offset: bytes.len(),
                reason: "covmap header is truncated",
            });
        }
        Ok(Self {
            filenames_length: read_u32(bytes, 4),
            version: read_u32(bytes, 12),
        })
    }

    /// The header and the filenames blob as one constant aggregate.
    pub fn to_const(&self, filenames: &[u8]) -> ConstData {
        ConstData::Struct(vec![
            ConstData::Struct(vec![
                ConstData::U32(0),
                ConstData::U32(self.filenames_length),
                ConstData::U32(0),
                ConstData::U32(self.version),
            ]),
            ConstData::Bytes(filenames.to_vec()),
        ])
    }
}

/// One function's entry in the covfun section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageFunctionRecord {
    pub name_hash: u64,
    pub function_hash: u64,
    pub filenames_hash: u64,
    mapping: Vec<u8>,
}

impl CoverageFunctionRecord {
    /// Build the record for `identity` pointing at the filenames table with
    /// hash `filenames_hash`.
    pub fn new(identity: &FunctionIdentity, filenames_hash: u64, mapping: Vec<u8>) -> Result<Self, CoverageError> {
        if u32::try_from(mapping.len()).is_err() {
            return Err(CoverageError::MappingTooLarge {
                function: identity.name.clone(),
                len: mapping.len(),
            });
        }
        Ok(Self {
            name_hash: identity.name_hash(),
            function_hash: identity.structural_hash,
            filenames_hash,
            mapping,
        })
    }

    pub fn mapping(&self) -> &[u8] {
        &self.mapping
    }

    /// Always equal to `self.mapping().len()`.
    pub fn mapping_length(&self) -> u32 {
        self.mapping.len() as u32
    }

    /// `{u64 name_hash, u32 mapping_length, u64 function_hash, u64 filenames_hash, [u8] mapping}`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FUNCTION_RECORD_HEADER_SIZE + self.mapping.len());
        out.extend_from_slice(&self.name_hash.to_le_bytes());
        out.extend_from_slice(&self.mapping_length().to_le_bytes());
        out.extend_from_slice(&self.function_hash.to_le_bytes());
        out.extend_from_slice(&self.filenames_hash.to_le_bytes());
        out.extend_from_slice(&self.mapping);
        out
    }

    /// Parse a record, checking that the declared mapping length matches the
    /// bytes that follow.
    pub fn parse(bytes: &[u8]) -> Result<Self, MappingError> {
        if bytes.len() < FUNCTION_RECORD_HEADER_SIZE {
            return Err(MappingError::Malformed {
                offset: bytes.len(),
                reason: "covfun record is truncated",
            });
        }
        let mapping_length = read_u32(bytes, 8) as usize;
        let mapping = &bytes[FUNCTION_RECORD_HEADER_SIZE..];
        if mapping.len() != mapping_length {
            return Err(MappingError::Malformed {
                offset: 8,
                reason: "mapping length does not match the record size",
            });
        }
        Ok(Self {
            name_hash: read_u64(bytes, 0),
            function_hash: read_u64(bytes, 12),
            filenames_hash: read_u64(bytes, 20),
            mapping: mapping.to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
