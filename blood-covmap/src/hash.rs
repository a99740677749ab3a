//! # Identity Hashing
//!
//! Two hashes identify an instrumented function inside the emitted module,
//! and they must never be mixed up:
//!
//! | Hash            | Algorithm                   | Used for                                  |
//! |-----------------|-----------------------------|-------------------------------------------|
//! | function hash   | DJB2 (seed 5381, ×33, wrap) | `llvm.instrprof.increment` + covfun record |
//! | name hash       | MD5, low 64 bits            | covfun record key                          |
//! | filenames hash  | MD5, low 64 bits            | covmap ↔ covfun cross reference            |
//!
//! Both values end up in object files and are compared by `llvm-cov`, so the
//! output for a given byte string is fixed forever. The low 64 bits of an MD5
//! digest are the first eight digest bytes read as a little-endian integer,
//! which is what LLVM's `MD5Result::low()` returns.

use std::fmt;

/// Seed of the DJB2 rolling hash.
pub const FUNCTION_HASH_SEED: u64 = 5381;

/// Stable structural hash of a function, derived from its name.
///
/// The same value is passed to the increment intrinsic and written into the
/// function's coverage record; if the two disagree the reader silently drops
/// the function's counters.
pub fn function_hash(name: &[u8]) -> u64 {
    name.iter().fold(FUNCTION_HASH_SEED, |hash, &byte| {
        hash.wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(u64::from(byte))
    })
}

/// Low 64 bits of the MD5 digest of `bytes`.
pub fn name_hash(bytes: &[u8]) -> u64 {
    Md5Digest::compute(bytes).low()
}

/// A 128-bit MD5 digest.
///
/// Only used as an opaque, stable identifier; never for anything security
/// related.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    /// Hash `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The first eight digest bytes as a little-endian `u64`.
    pub fn low(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(low)
    }

    /// The last eight digest bytes as a little-endian `u64`.
    pub fn high(&self) -> u64 {
        let mut high = [0u8; 8];
        high.copy_from_slice(&self.0[8..]);
        u64::from_le_bytes(high)
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({})", self)
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Identity of one instrumented function.
///
/// Computed once when the function is instrumented and again, from the
/// counter array's name, when its coverage record is built. Both computations
/// go through [`FunctionIdentity::new`], which is what keeps them in sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionIdentity {
    /// Symbol name of the function.
    pub name: String,
    /// [`function_hash`] of `name`.
    pub structural_hash: u64,
}

impl FunctionIdentity {
    /// Build the identity of the function called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let structural_hash = function_hash(name.as_bytes());
        Self {
            name,
            structural_hash,
        }
    }

    /// The record key of this function ([`name_hash`] of its name).
    pub fn name_hash(&self) -> u64 {
        name_hash(self.name.as_bytes())
    }
}

// ============================================================================
// Tests
// ============================================================================
