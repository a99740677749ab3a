//! Coverage mapping model.
//!
//! A function's coverage mapping is a list of source regions, each attributed
//! to a *counter*: either a physical counter incremented at runtime, the
//! constant zero, or an expression (`lhs + rhs` / `lhs - rhs`) over other
//! counters. The types here mirror what `llvm-cov` reads back; the encoding
//! lives in [`writer`], the filenames table in [`filenames`], and [`reader`]
//! decodes both for verification.

pub mod filenames;
pub mod reader;
pub mod writer;

pub use filenames::FilenameTable;
pub use writer::MappingWriter;

/// Number of low bits holding a counter's tag.
pub const COUNTER_TAG_BITS: u32 = 2;
/// Tag bits plus the expansion-region marker bit.
pub const COUNTER_TAG_AND_EXPANSION_BITS: u32 = COUNTER_TAG_BITS + 1;

/// A reference to a count: the constant zero, a physical counter, or an
/// expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Counter {
    #[default]
    Zero,
    /// Physical counter with the given index into the function's counter array.
    Counter(u32),
    /// Index into the function's expression list.
    Expression(u32),
}

impl Counter {
    /// Tag value written into the low bits of an encoded counter.
    pub(crate) fn tag(self) -> u64 {
        match self {
            Counter::Zero => 0,
            Counter::Counter(_) => 1,
            Counter::Expression(_) => 2,
        }
    }

    /// Counter or expression id (zero for [`Counter::Zero`]).
    pub fn id(self) -> u32 {
        match self {
            Counter::Zero => 0,
            Counter::Counter(id) | Counter::Expression(id) => id,
        }
    }

    pub fn is_zero(self) -> bool {
        matches!(self, Counter::Zero)
    }
}

/// Operator of a counter expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprKind {
    Subtract,
    Add,
}

/// `lhs <op> rhs` over two counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterExpression {
    pub kind: ExprKind,
    pub lhs: Counter,
    pub rhs: Counter,
}

impl CounterExpression {
    pub fn add(lhs: Counter, rhs: Counter) -> Self {
        Self {
            kind: ExprKind::Add,
            lhs,
            rhs,
        }
    }

    pub fn subtract(lhs: Counter, rhs: Counter) -> Self {
        Self {
            kind: ExprKind::Subtract,
            lhs,
            rhs,
        }
    }
}

/// What a region means to the coverage reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Ordinary code, executed `count` times.
    Code(Counter),
    /// The region's text comes from another virtual file (a macro expansion).
    Expansion { expanded_file_id: u32 },
    /// Code that is never compiled (e.g. a disabled `#if`).
    Skipped,
    /// Whitespace between statements that inherits `count`.
    Gap(Counter),
    /// A branch condition taken `true_count` / `false_count` times.
    Branch {
        true_count: Counter,
        false_count: Counter,
    },
}

impl RegionKind {
    /// Discriminant used by the on-disk pseudo-counter of non-code regions.
    pub(crate) fn ordinal(self) -> u64 {
        match self {
            RegionKind::Code(_) => 0,
            RegionKind::Expansion { .. } => 1,
            RegionKind::Skipped => 2,
            RegionKind::Gap(_) => 3,
            RegionKind::Branch { .. } => 4,
        }
    }

    /// Every counter the region references.
    pub fn counters(self) -> impl Iterator<Item = Counter> {
        let (first, second) = match self {
            RegionKind::Code(count) | RegionKind::Gap(count) => (Some(count), None),
            RegionKind::Branch {
                true_count,
                false_count,
            } => (Some(true_count), Some(false_count)),
            RegionKind::Expansion { .. } | RegionKind::Skipped => (None, None),
        };
        first.into_iter().chain(second)
    }
}

/// One source span attributed to one counter.
///
/// Lines and columns are 1-based; the end position is inclusive of the last
/// column as `llvm-cov` displays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterMappingRegion {
    pub kind: RegionKind,
    /// Index into the function's virtual file mapping.
    pub file_id: u32,
    pub line_start: u32,
    pub column_start: u32,
    pub line_end: u32,
    pub column_end: u32,
}

impl CounterMappingRegion {
    /// A code region counted by `count`.
    pub fn code(
        count: Counter,
        file_id: u32,
        line_start: u32,
        column_start: u32,
        line_end: u32,
        column_end: u32,
    ) -> Self {
        Self {
            kind: RegionKind::Code(count),
            file_id,
            line_start,
            column_start,
            line_end,
            column_end,
        }
    }

    /// A region with an explicit kind.
    pub fn with_kind(
        kind: RegionKind,
        file_id: u32,
        (line_start, column_start): (u32, u32),
        (line_end, column_end): (u32, u32),
    ) -> Self {
        Self {
            kind,
            file_id,
            line_start,
            column_start,
            line_end,
            column_end,
        }
    }
}

/// The synthetic span every instrumented function is currently attributed
/// to: line 1, columns 1 through 10.
///
/// Real per-statement spans need source positions threaded through
/// instrumentation, which the front end does not provide yet.
pub const PLACEHOLDER_SPAN: (u32, u32, u32, u32) = (1, 1, 1, 10);

/// The single region used for a function whose body is counted by counter 0.
pub fn placeholder_region() -> CounterMappingRegion {
    let (line_start, column_start, line_end, column_end) = PLACEHOLDER_SPAN;
    CounterMappingRegion::code(
        Counter::Counter(0),
        0,
        line_start,
        column_start,
        line_end,
        column_end,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_ids_and_tags() {
        assert_eq!(Counter::Zero.tag(), 0);
        assert_eq!(Counter::Counter(4).tag(), 1);
        assert_eq!(Counter::Expression(2).tag(), 2);
        assert_eq!(Counter::Counter(4).id(), 4);
        assert!(Counter::default().is_zero());
    }

    #[test]
    fn test_region_counters() {
        let branch = RegionKind::Branch {
            true_count: Counter::Counter(1),
            false_count: Counter::Expression(0),
        };
        let counters: Vec<_> = branch.counters().collect();
        assert_eq!(counters, vec![Counter::Counter(1), Counter::Expression(0)]);
        assert_eq!(RegionKind::Skipped.counters().count(), 0);
    }

    #[test]
    fn test_placeholder_region() {
        let region = placeholder_region();
        assert_eq!(region.kind, RegionKind::Code(Counter::Counter(0)));
        assert_eq!(region.file_id, 0);
        assert_eq!(
            (region.line_start, region.column_start, region.line_end, region.column_end),
            (1, 1, 1, 10)
        );
    }
}
