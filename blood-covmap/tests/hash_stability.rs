//! Hash stability tests.
//!
//! These values end up in object files and are compared by `llvm-cov`
//! across compilers, so they are pinned here:
//! 1. Function hashes (DJB2) of known names
//! 2. Name hashes (MD5 low 64 bits) of known names
//! 3. The filenames hash tracks the table contents and nothing else

use blood_covmap::hash::{function_hash, name_hash, FunctionIdentity, Md5Digest};
use blood_covmap::mapping::FilenameTable;

// ============================================================================
// Function hash
// ============================================================================

#[test]
fn test_function_hash_known_values() {
    assert_eq!(function_hash(b""), 5381);
    assert_eq!(function_hash(b"a"), 5381 * 33 + 97);
    assert_eq!(function_hash(b"foo"), 193_491_849);
}

#[test]
fn test_function_hash_wraps_on_long_names() {
    let name = "very_long_function_name_that_overflows_a_u64_many_times_over".repeat(4);
    let expected = name
        .bytes()
        .fold(5381u64, |h, b| h.wrapping_mul(33).wrapping_add(u64::from(b)));
    assert_eq!(function_hash(name.as_bytes()), expected);
}

#[test]
fn test_function_hash_is_byte_based() {
    // multi-byte characters hash as their UTF-8 bytes
    let name = "ünïcode";
    let expected = name
        .as_bytes()
        .iter()
        .fold(5381u64, |h, &b| h.wrapping_mul(33).wrapping_add(u64::from(b)));
    assert_eq!(function_hash(name.as_bytes()), expected);
}

// ============================================================================
// Name hash
// ============================================================================

#[test]
fn test_name_hash_known_values() {
    // md5("foo") = acbd18db4cc2f85cedef654fccc4a4d8
    assert_eq!(name_hash(b"foo"), 0x5cf8_c24c_db18_bdac);
    // md5("") = d41d8cd98f00b204e9800998ecf8427e
    assert_eq!(name_hash(b""), 0x04b2_008f_d98c_1dd4);
}

#[test]
fn test_md5_digest_display() {
    assert_eq!(
        Md5Digest::compute(b"foo").to_string(),
        "acbd18db4cc2f85cedef654fccc4a4d8"
    );
    assert_eq!(Md5Digest::compute(b"foo").high(), 0xd8a4_c4cc_4f65_efed);
}

#[test]
fn test_identity_uses_both_hashes() {
    let identity = FunctionIdentity::new("foo");
    assert_eq!(identity.structural_hash, 193_491_849);
    assert_eq!(identity.name_hash(), 0x5cf8_c24c_db18_bdac);
    assert_ne!(identity.structural_hash, identity.name_hash());
}

// ============================================================================
// Filenames hash
// ============================================================================

#[test]
fn test_filenames_hash_is_stable() {
    let first = FilenameTable::single("src/main.blood").encode(true).unwrap();
    let second = FilenameTable::single("src/main.blood").encode(true).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.hash, name_hash(&first.blob));
}

#[test]
fn test_filenames_hash_changes_with_path() {
    let a = FilenameTable::single("a.c").encode(true).unwrap();
    let b = FilenameTable::single("b.c").encode(true).unwrap();
    assert_ne!(a.hash, b.hash);
}

#[test]
fn test_filenames_hash_covers_encoding() {
    // same path, different encoding: the hash is over the blob
    let compressed = FilenameTable::single("test.c").encode(true).unwrap();
    let raw = FilenameTable::single("test.c").encode(false).unwrap();
    assert_ne!(compressed.blob, raw.blob);
    assert_ne!(compressed.hash, raw.hash);
}

#[test]
fn test_uncompressed_filenames_layout() {
    let raw = FilenameTable::single("test.c").encode(false).unwrap();
    let mut expected = vec![1, 7, 0, 6];
    expected.extend_from_slice(b"test.c");
    assert_eq!(raw.blob, expected);
}
