//! Mapping-data encoder.
//!
//! Produces the per-function blob embedded in a covfun record:
//!
//! ```text
//! <num-virtual-files: uleb> <filename-index: uleb>*
//! <num-expressions: uleb> (<lhs: counter> <rhs: counter>)*
//! for each virtual file:
//!     <num-regions: uleb>
//!     (<header> <line-delta> <column-start> <line-count> <column-end>)*
//! ```
//!
//! Expressions that no region reaches are dropped and the survivors
//! renumbered, so the output depends only on what the regions use.

use tracing::trace;

use crate::error::MappingError;
use crate::leb128::write_uleb128;
use crate::mapping::{
    Counter, CounterExpression, CounterMappingRegion, ExprKind, RegionKind, COUNTER_TAG_AND_EXPANSION_BITS,
    COUNTER_TAG_BITS,
};

/// Marks a region's end column as belonging to a gap region.
pub const GAP_REGION_BIT: u32 = 1 << 31;

/// Encodes one function's regions.
#[derive(Debug, Clone)]
pub struct MappingWriter<'a> {
    virtual_file_mapping: &'a [u32],
    expressions: &'a [CounterExpression],
    regions: &'a [CounterMappingRegion],
}

impl<'a> MappingWriter<'a> {
    /// `virtual_file_mapping[i]` is the filenames-table index of the file that
    /// regions with `file_id == i` refer to.
    pub fn new(
        virtual_file_mapping: &'a [u32],
        expressions: &'a [CounterExpression],
        regions: &'a [CounterMappingRegion],
    ) -> Self {
        Self {
            virtual_file_mapping,
            expressions,
            regions,
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, MappingError> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    /// Append the encoded mapping to `out`.
    ///
    /// On error nothing is appended.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), MappingError> {
        let file_count = self.virtual_file_mapping.len();
        for region in self.regions {
            validate_region(region, file_count)?;
        }

        let minimizer = ExpressionMinimizer::new(self.expressions, self.regions)?;

        let mut regions: Vec<&CounterMappingRegion> = self.regions.iter().collect();
        regions.sort_by_key(|r| (r.file_id, r.line_start, r.column_start));

        let mut buf = Vec::new();

        write_uleb128(&mut buf, file_count as u64);
        for &file_index in self.virtual_file_mapping {
            write_uleb128(&mut buf, u64::from(file_index));
        }

        let used = minimizer.used();
        write_uleb128(&mut buf, used.len() as u64);
        for expr in used {
            write_counter(&mut buf, used, minimizer.adjust(expr.lhs));
            write_counter(&mut buf, used, minimizer.adjust(expr.rhs));
        }

        let mut rest = regions.as_slice();
        for file_id in 0..file_count as u32 {
            let split = rest.iter().take_while(|r| r.file_id == file_id).count();
            let (in_file, tail) = rest.split_at(split);
            rest = tail;

            write_uleb128(&mut buf, in_file.len() as u64);
            let mut prev_line_start = 0;
            for region in in_file {
                write_region_header(&mut buf, used, &minimizer, region.kind);
                write_uleb128(&mut buf, u64::from(region.line_start - prev_line_start));
                write_uleb128(&mut buf, u64::from(region.column_start));
                write_uleb128(&mut buf, u64::from(region.line_end - region.line_start));
                let column_end = match region.kind {
                    RegionKind::Gap(_) => region.column_end | GAP_REGION_BIT,
                    _ => region.column_end,
                };
                write_uleb128(&mut buf, u64::from(column_end));
                prev_line_start = region.line_start;
            }
        }

        trace!(
            files = file_count,
            expressions = used.len(),
            regions = regions.len(),
            bytes = buf.len(),
            "encoded coverage mapping"
        );
        out.extend_from_slice(&buf);
        Ok(())
    }
}

fn validate_region(region: &CounterMappingRegion, file_count: usize) -> Result<(), MappingError> {
    if region.file_id as usize >= file_count {
        return Err(MappingError::FileIdOutOfRange {
            file_id: region.file_id,
            count: file_count,
        });
    }
    if let RegionKind::Expansion { expanded_file_id } = region.kind {
        if expanded_file_id as usize >= file_count {
            return Err(MappingError::ExpansionOutOfRange {
                file_id: expanded_file_id,
                count: file_count,
            });
        }
    }

    let span_error = |reason| MappingError::InvalidSpan {
        line_start: region.line_start,
        column_start: region.column_start,
        line_end: region.line_end,
        column_end: region.column_end,
        reason,
    };
    if [region.line_start, region.column_start, region.line_end, region.column_end].contains(&0) {
        return Err(span_error("coordinates are 1-based"));
    }
    if region.column_end & GAP_REGION_BIT != 0 {
        return Err(span_error("end column overlaps the gap-region marker bit"));
    }
    if (region.line_start, region.column_start) > (region.line_end, region.column_end) {
        return Err(span_error("region ends before it starts"));
    }
    Ok(())
}

fn encode_counter(expressions: &[CounterExpression], counter: Counter) -> u64 {
    let tag = match counter {
        Counter::Expression(id) => match expressions.get(id as usize).map(|e| e.kind) {
            Some(ExprKind::Add) => counter.tag() + 1,
            _ => counter.tag(),
        },
        _ => counter.tag(),
    };
    tag | (u64::from(counter.id()) << COUNTER_TAG_BITS)
}

fn write_counter(out: &mut Vec<u8>, expressions: &[CounterExpression], counter: Counter) {
    write_uleb128(out, encode_counter(expressions, counter));
}

fn write_region_header(
    out: &mut Vec<u8>,
    expressions: &[CounterExpression],
    minimizer: &ExpressionMinimizer<'_>,
    kind: RegionKind,
) {
    match kind {
        RegionKind::Code(count) | RegionKind::Gap(count) => {
            write_counter(out, expressions, minimizer.adjust(count));
        }
        RegionKind::Expansion { expanded_file_id } => {
            let header = (1u64 << COUNTER_TAG_BITS)
                | (u64::from(expanded_file_id) << COUNTER_TAG_AND_EXPANSION_BITS);
            write_uleb128(out, header);
        }
        RegionKind::Skipped => {
            write_uleb128(out, kind.ordinal() << COUNTER_TAG_AND_EXPANSION_BITS);
        }
        RegionKind::Branch {
            true_count,
            false_count,
        } => {
            write_uleb128(out, kind.ordinal() << COUNTER_TAG_AND_EXPANSION_BITS);
            write_counter(out, expressions, minimizer.adjust(true_count));
            write_counter(out, expressions, minimizer.adjust(false_count));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unused,
    Reachable,
    Assigned(u32),
}

/// Drops expressions no region reaches and renumbers the rest in the order
/// the regions first reach them.
#[derive(Debug)]
struct ExpressionMinimizer<'a> {
    expressions: &'a [CounterExpression],
    slots: Vec<Slot>,
    used: Vec<CounterExpression>,
}

impl<'a> ExpressionMinimizer<'a> {
    fn new(
        expressions: &'a [CounterExpression],
        regions: &[CounterMappingRegion],
    ) -> Result<Self, MappingError> {
        let mut minimizer = Self {
            expressions,
            slots: vec![Slot::Unused; expressions.len()],
            used: Vec::new(),
        };
        for region in regions {
            for counter in region.kind.counters() {
                minimizer.mark(counter)?;
            }
        }
        for region in regions {
            for counter in region.kind.counters() {
                minimizer.gather(counter);
            }
        }
        Ok(minimizer)
    }

    fn mark(&mut self, counter: Counter) -> Result<(), MappingError> {
        let mut pending = vec![counter];
        while let Some(counter) = pending.pop() {
            let Counter::Expression(id) = counter else {
                continue;
            };
            let expr = *self
                .expressions
                .get(id as usize)
                .ok_or(MappingError::UnknownExpression {
                    id,
                    count: self.expressions.len(),
                })?;
            if self.slots[id as usize] == Slot::Unused {
                self.slots[id as usize] = Slot::Reachable;
                pending.push(expr.rhs);
                pending.push(expr.lhs);
            }
        }
        Ok(())
    }

    /// Assign ids in pre-order, lhs before rhs.
    fn gather(&mut self, counter: Counter) {
        let mut pending = vec![counter];
        while let Some(counter) = pending.pop() {
            let Counter::Expression(id) = counter else {
                continue;
            };
            if self.slots[id as usize] != Slot::Reachable {
                continue;
            }
            let expr = self.expressions[id as usize];
            self.slots[id as usize] = Slot::Assigned(self.used.len() as u32);
            self.used.push(expr);
            pending.push(expr.rhs);
            pending.push(expr.lhs);
        }
    }

    fn used(&self) -> &[CounterExpression] {
        &self.used
    }

    fn adjust(&self, counter: Counter) -> Counter {
        match counter {
            Counter::Expression(id) => match self.slots.get(id as usize) {
                Some(Slot::Assigned(new_id)) => Counter::Expression(*new_id),
                _ => counter,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::placeholder_region;
    use crate::mapping::reader::{decode_mapping, DecodedMapping};

    fn encode(
        files: &[u32],
        expressions: &[CounterExpression],
        regions: &[CounterMappingRegion],
    ) -> Vec<u8> {
        MappingWriter::new(files, expressions, regions).encode().unwrap()
    }

    #[test]
    fn test_placeholder_region_bytes() {
        let bytes = encode(&[0], &[], &[placeholder_region()]);
        assert_eq!(bytes, vec![1, 0, 0, 1, 1, 1, 1, 0, 10]);
    }

    #[test]
    fn test_zero_regions_is_well_formed() {
        assert_eq!(encode(&[], &[], &[]), vec![0, 0]);
        assert_eq!(encode(&[0], &[], &[]), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_line_deltas_are_per_file() {
        let regions = [
            CounterMappingRegion::code(Counter::Counter(0), 0, 3, 1, 5, 2),
            CounterMappingRegion::code(Counter::Counter(1), 0, 7, 4, 7, 9),
            CounterMappingRegion::code(Counter::Counter(2), 1, 2, 1, 2, 3),
        ];
        let bytes = encode(&[0, 1], &[], &regions);
        assert_eq!(
            bytes,
            vec![
                2, 0, 1, // virtual files
                0, // expressions
                2, // file 0
                1, 3, 1, 2, 2, //
                5, 4, 4, 0, 9, //
                1, // file 1
                9, 2, 1, 0, 3,
            ]
        );
    }

    #[test]
    fn test_regions_are_sorted_before_encoding() {
        let a = CounterMappingRegion::code(Counter::Counter(0), 0, 3, 1, 3, 2);
        let b = CounterMappingRegion::code(Counter::Counter(1), 0, 1, 1, 1, 2);
        assert_eq!(encode(&[0], &[], &[a, b]), encode(&[0], &[], &[b, a]));
    }

    #[test]
    fn test_expression_tags() {
        let expressions = [
            CounterExpression::subtract(Counter::Counter(0), Counter::Counter(1)),
            CounterExpression::add(Counter::Counter(0), Counter::Zero),
        ];
        let regions = [
            CounterMappingRegion::code(Counter::Expression(0), 0, 1, 1, 1, 5),
            CounterMappingRegion::code(Counter::Expression(1), 0, 2, 1, 2, 5),
        ];
        let bytes = encode(&[0], &expressions, &regions);
        // subtract: tag 2, add: tag 3
        assert_eq!(&bytes[2..7], &[2, 1, 5, 1, 0]);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[13], 3 | (1 << 2));
    }

    #[test]
    fn test_unused_expressions_are_dropped() {
        let expressions = [
            CounterExpression::add(Counter::Counter(0), Counter::Counter(1)),
            CounterExpression::subtract(Counter::Counter(2), Counter::Counter(3)),
        ];
        let regions = [CounterMappingRegion::code(Counter::Expression(1), 0, 1, 1, 1, 5)];
        let bytes = encode(&[0], &expressions, &regions);
        let DecodedMapping { expressions, regions, .. } = decode_mapping(&bytes).unwrap();
        assert_eq!(
            expressions,
            vec![CounterExpression::subtract(Counter::Counter(2), Counter::Counter(3))]
        );
        assert_eq!(regions[0].kind, RegionKind::Code(Counter::Expression(0)));
    }

    #[test]
    fn test_shared_expressions_are_emitted_once() {
        let expressions = [
            CounterExpression::add(Counter::Counter(0), Counter::Counter(1)),
            CounterExpression::subtract(Counter::Expression(0), Counter::Counter(2)),
        ];
        let regions = [
            CounterMappingRegion::code(Counter::Expression(1), 0, 1, 1, 1, 5),
            CounterMappingRegion::code(Counter::Expression(0), 0, 2, 1, 2, 5),
            CounterMappingRegion::code(Counter::Expression(1), 0, 3, 1, 3, 5),
        ];
        let decoded = decode_mapping(&encode(&[0], &expressions, &regions)).unwrap();
        assert_eq!(decoded.expressions.len(), 2);
        assert_eq!(
            decoded.expressions[0],
            CounterExpression::subtract(Counter::Expression(1), Counter::Counter(2))
        );
    }

    #[test]
    fn test_expressions_numbered_lhs_first() {
        let expressions = [
            CounterExpression::add(Counter::Expression(2), Counter::Expression(1)),
            CounterExpression::subtract(Counter::Counter(2), Counter::Counter(3)),
            CounterExpression::add(Counter::Counter(0), Counter::Counter(1)),
        ];
        let regions = [CounterMappingRegion::code(Counter::Expression(0), 0, 1, 1, 1, 5)];
        let decoded = decode_mapping(&encode(&[0], &expressions, &regions)).unwrap();
        assert_eq!(
            decoded.expressions,
            vec![
                CounterExpression::add(Counter::Expression(1), Counter::Expression(2)),
                CounterExpression::add(Counter::Counter(0), Counter::Counter(1)),
                CounterExpression::subtract(Counter::Counter(2), Counter::Counter(3)),
            ]
        );
    }

    #[test]
    fn test_deep_expression_chain() {
        const DEPTH: u32 = 100_000;
        let mut expressions = vec![CounterExpression::add(Counter::Counter(0), Counter::Counter(0))];
        for i in 1..DEPTH {
            expressions.push(CounterExpression::add(Counter::Expression(i - 1), Counter::Counter(0)));
        }
        let regions = [CounterMappingRegion::code(Counter::Expression(DEPTH - 1), 0, 1, 1, 1, 5)];

        let decoded = decode_mapping(&encode(&[0], &expressions, &regions)).unwrap();
        assert_eq!(decoded.expressions.len(), DEPTH as usize);
        assert_eq!(
            decoded.expressions[0],
            CounterExpression::add(Counter::Expression(1), Counter::Counter(0))
        );
        assert_eq!(
            decoded.expressions[DEPTH as usize - 1],
            CounterExpression::add(Counter::Counter(0), Counter::Counter(0))
        );
        assert_eq!(decoded.regions[0].kind, RegionKind::Code(Counter::Expression(0)));
    }

    #[test]
    fn test_special_region_headers() {
        let regions = [
            CounterMappingRegion::with_kind(RegionKind::Expansion { expanded_file_id: 1 }, 0, (1, 1), (1, 4)),
            CounterMappingRegion::with_kind(RegionKind::Skipped, 0, (2, 1), (4, 1)),
            CounterMappingRegion::with_kind(RegionKind::Gap(Counter::Counter(0)), 0, (5, 1), (5, 2)),
            CounterMappingRegion::with_kind(
                RegionKind::Branch {
                    true_count: Counter::Counter(1),
                    false_count: Counter::Zero,
                },
                0,
                (6, 1),
                (6, 8),
            ),
            CounterMappingRegion::code(Counter::Counter(0), 1, 1, 1, 1, 1),
        ];
        let decoded = decode_mapping(&encode(&[0, 0], &[], &regions)).unwrap();
        let kinds: Vec<_> = decoded.regions.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, regions.iter().map(|r| r.kind).collect::<Vec<_>>());
        // gap marker is stripped again on decode
        assert_eq!(decoded.regions[2].column_end, 2);
    }

    #[test]
    fn test_rejects_bad_regions() {
        let out_of_range = CounterMappingRegion::code(Counter::Counter(0), 1, 1, 1, 1, 1);
        assert!(matches!(
            MappingWriter::new(&[0], &[], &[out_of_range]).encode(),
            Err(MappingError::FileIdOutOfRange { file_id: 1, count: 1 })
        ));

        let zero_column = CounterMappingRegion::code(Counter::Counter(0), 0, 1, 0, 1, 1);
        assert!(matches!(
            MappingWriter::new(&[0], &[], &[zero_column]).encode(),
            Err(MappingError::InvalidSpan { .. })
        ));

        let backwards = CounterMappingRegion::code(Counter::Counter(0), 0, 4, 1, 2, 1);
        assert!(matches!(
            MappingWriter::new(&[0], &[], &[backwards]).encode(),
            Err(MappingError::InvalidSpan { .. })
        ));

        let dangling = CounterMappingRegion::code(Counter::Expression(3), 0, 1, 1, 1, 2);
        assert!(matches!(
            MappingWriter::new(&[0], &[], &[dangling]).encode(),
            Err(MappingError::UnknownExpression { id: 3, count: 0 })
        ));
    }

    #[test]
    fn test_write_appends_nothing_on_error() {
        let mut out = vec![0xaa];
        let bad = CounterMappingRegion::code(Counter::Counter(0), 2, 1, 1, 1, 1);
        assert!(MappingWriter::new(&[0], &[], &[bad]).write(&mut out).is_err());
        assert_eq!(out, vec![0xaa]);
    }
}
