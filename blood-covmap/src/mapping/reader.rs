//! Decoder for the filenames table and per-function mapping data.
//!
//! Reads back exactly what [`super::writer`] and [`super::filenames`]
//! produce, the same way `llvm-cov` does, so emitted sections can be checked
//! without an LLVM toolchain.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::MappingError;
use crate::leb128::read_uleb128;
use crate::mapping::writer::GAP_REGION_BIT;
use crate::mapping::{
    Counter, CounterExpression, CounterMappingRegion, ExprKind, RegionKind, COUNTER_TAG_AND_EXPANSION_BITS,
    COUNTER_TAG_BITS,
};

/// A decoded mapping-data blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMapping {
    pub virtual_file_mapping: Vec<u32>,
    pub expressions: Vec<CounterExpression>,
    pub regions: Vec<CounterMappingRegion>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn error(&self, reason: &'static str) -> MappingError {
        MappingError::Malformed {
            offset: self.pos,
            reason,
        }
    }

    fn uleb(&mut self) -> Result<u64, MappingError> {
        let (value, len) =
            read_uleb128(&self.bytes[self.pos..]).ok_or_else(|| self.error("truncated LEB128 value"))?;
        self.pos += len;
        Ok(value)
    }

    fn uleb_u32(&mut self) -> Result<u32, MappingError> {
        let value = self.uleb()?;
        u32::try_from(value).map_err(|_| self.error("value does not fit in 32 bits"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MappingError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| self.error("length runs past the end of the data"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Decode a filenames table.
pub fn read_filenames(blob: &[u8]) -> Result<Vec<String>, MappingError> {
    let mut cursor = Cursor::new(blob);
    let count = cursor.uleb()?;
    let uncompressed_len = cursor.uleb()?;
    let compressed_len = cursor.uleb()?;

    let raw = if compressed_len == 0 {
        let len = usize::try_from(uncompressed_len).map_err(|_| cursor.error("filenames length too large"))?;
        cursor.take(len)?.to_vec()
    } else {
        let len = usize::try_from(compressed_len).map_err(|_| cursor.error("filenames length too large"))?;
        let compressed = cursor.take(len)?;
        // declared size is untrusted: read at most one byte past it
        let mut raw = Vec::new();
        let decoded = ZlibDecoder::new(compressed)
            .take(uncompressed_len.saturating_add(1))
            .read_to_end(&mut raw);
        if decoded.is_err() || raw.len() as u64 != uncompressed_len {
            return Err(cursor.error("filenames failed to decompress"));
        }
        raw
    };
    if !cursor.at_end() {
        return Err(cursor.error("trailing bytes after filenames table"));
    }

    let mut names = Cursor::new(&raw);
    let mut files = Vec::new();
    while !names.at_end() {
        let len = names.uleb()? as usize;
        let bytes = names.take(len)?;
        let name = std::str::from_utf8(bytes).map_err(|_| names.error("filename is not UTF-8"))?;
        files.push(name.to_string());
    }
    if files.len() as u64 != count {
        return Err(MappingError::Malformed {
            offset: 0,
            reason: "filename count does not match the table",
        });
    }
    Ok(files)
}

/// Decode one function's mapping data.
pub fn decode_mapping(bytes: &[u8]) -> Result<DecodedMapping, MappingError> {
    let mut cursor = Cursor::new(bytes);

    let file_count = cursor.uleb()? as usize;
    let mut virtual_file_mapping = Vec::with_capacity(file_count.min(bytes.len()));
    for _ in 0..file_count {
        virtual_file_mapping.push(cursor.uleb_u32()?);
    }

    let expression_count = cursor.uleb()? as usize;
    if expression_count > bytes.len() {
        return Err(cursor.error("expression count exceeds the data"));
    }
    // Expression kinds are only known once something refers to them.
    let mut expressions = vec![CounterExpression::subtract(Counter::Zero, Counter::Zero); expression_count];
    for i in 0..expression_count {
        let lhs = read_counter(&mut cursor, &mut expressions)?;
        let rhs = read_counter(&mut cursor, &mut expressions)?;
        expressions[i].lhs = lhs;
        expressions[i].rhs = rhs;
    }

    let mut regions = Vec::new();
    for file_id in 0..file_count as u32 {
        let region_count = cursor.uleb()?;
        let mut prev_line_start = 0u32;
        for _ in 0..region_count {
            let mut kind = read_region_kind(&mut cursor, &mut expressions)?;
            let line_delta = cursor.uleb_u32()?;
            let column_start = cursor.uleb_u32()?;
            let line_count = cursor.uleb_u32()?;
            let mut column_end = cursor.uleb_u32()?;
            if column_end & GAP_REGION_BIT != 0 {
                column_end &= !GAP_REGION_BIT;
                if let RegionKind::Code(count) = kind {
                    kind = RegionKind::Gap(count);
                }
            }
            let line_start = prev_line_start
                .checked_add(line_delta)
                .ok_or_else(|| cursor.error("line number overflows"))?;
            let line_end = line_start
                .checked_add(line_count)
                .ok_or_else(|| cursor.error("line number overflows"))?;
            regions.push(CounterMappingRegion {
                kind,
                file_id,
                line_start,
                column_start,
                line_end,
                column_end,
            });
            prev_line_start = line_start;
        }
    }
    if !cursor.at_end() {
        return Err(cursor.error("trailing bytes after mapping regions"));
    }

    Ok(DecodedMapping {
        virtual_file_mapping,
        expressions,
        regions,
    })
}

fn decode_counter(
    cursor: &Cursor<'_>,
    value: u64,
    expressions: &mut [CounterExpression],
) -> Result<Counter, MappingError> {
    let tag = value & ((1 << COUNTER_TAG_BITS) - 1);
    let id = u32::try_from(value >> COUNTER_TAG_BITS).map_err(|_| cursor.error("counter id too large"))?;
    match tag {
        0 => Ok(Counter::Zero),
        1 => Ok(Counter::Counter(id)),
        _ => {
            let expr = expressions
                .get_mut(id as usize)
                .ok_or_else(|| cursor.error("counter refers to a missing expression"))?;
            expr.kind = if tag == 3 { ExprKind::Add } else { ExprKind::Subtract };
            Ok(Counter::Expression(id))
        }
    }
}

fn read_counter(cursor: &mut Cursor<'_>, expressions: &mut [CounterExpression]) -> Result<Counter, MappingError> {
    let value = cursor.uleb()?;
    decode_counter(cursor, value, expressions)
}

fn read_region_kind(
    cursor: &mut Cursor<'_>,
    expressions: &mut [CounterExpression],
) -> Result<RegionKind, MappingError> {
    let header = cursor.uleb()?;
    if header & ((1 << COUNTER_TAG_BITS) - 1) != 0 {
        return Ok(RegionKind::Code(decode_counter(cursor, header, expressions)?));
    }
    if header & (1 << COUNTER_TAG_BITS) != 0 {
        let expanded_file_id = u32::try_from(header >> COUNTER_TAG_AND_EXPANSION_BITS)
            .map_err(|_| cursor.error("expanded file id too large"))?;
        return Ok(RegionKind::Expansion { expanded_file_id });
    }
    match header >> COUNTER_TAG_AND_EXPANSION_BITS {
        0 => Ok(RegionKind::Code(Counter::Zero)),
        2 => Ok(RegionKind::Skipped),
        4 => {
            let true_count = read_counter(cursor, expressions)?;
            let false_count = read_counter(cursor, expressions)?;
            Ok(RegionKind::Branch {
                true_count,
                false_count,
            })
        }
        _ => Err(cursor.error("unsupported region kind")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{placeholder_region, FilenameTable, MappingWriter};

    #[test]
    fn test_decode_placeholder() {
        let decoded = decode_mapping(&[1, 0, 0, 1, 1, 1, 1, 0, 10]).unwrap();
        assert_eq!(decoded.virtual_file_mapping, vec![0]);
        assert!(decoded.expressions.is_empty());
        assert_eq!(decoded.regions, vec![placeholder_region()]);
    }

    #[test]
    fn test_decode_rejects_truncated_data() {
        let bytes = MappingWriter::new(&[0], &[], &[placeholder_region()])
            .encode()
            .unwrap();
        for len in 0..bytes.len() {
            assert!(decode_mapping(&bytes[..len]).is_err(), "prefix of {} bytes", len);
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        assert!(matches!(
            decode_mapping(&[0, 0, 7]),
            Err(MappingError::Malformed { offset: 2, .. })
        ));
    }

    #[test]
    fn test_read_multiple_filenames() {
        let mut table = FilenameTable::new();
        table.insert("a.blood");
        table.insert("lib/b.blood");
        for compress in [false, true] {
            let encoded = table.encode(compress).unwrap();
            assert_eq!(read_filenames(&encoded.blob).unwrap(), vec!["a.blood", "lib/b.blood"]);
        }
    }

    #[test]
    fn test_read_filenames_count_mismatch() {
        // claims two files but holds one
        let blob = [&[2u8, 4, 0, 3][..], b"a.c"].concat();
        assert!(read_filenames(&blob).is_err());
    }

    #[test]
    fn test_read_filenames_rejects_oversized_claim() {
        // one file, 2^62 bytes uncompressed, one byte of "zlib" data
        let mut blob = vec![1u8];
        crate::leb128::write_uleb128(&mut blob, 1 << 62);
        blob.extend_from_slice(&[1, 0x78]);
        assert!(matches!(read_filenames(&blob), Err(MappingError::Malformed { .. })));

        let mut raw = vec![1u8];
        crate::leb128::write_uleb128(&mut raw, 1 << 62);
        raw.extend_from_slice(&[0, 3]);
        raw.extend_from_slice(b"a.c");
        assert!(read_filenames(&raw).is_err());
    }

    #[test]
    fn test_read_filenames_rejects_short_claim() {
        let mut encoded = FilenameTable::single("src/main.blood").encode(true).unwrap().blob;
        // raw length is a single ULEB byte for a short table; understate it
        encoded[1] -= 1;
        assert!(read_filenames(&encoded).is_err());
    }
}
