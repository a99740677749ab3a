//! Interfaces to the IR host.
//!
//! Instrumentation and record emission never touch an IR library directly.
//! They describe what they need through the traits here, and each host
//! (the in-memory [`crate::ir`] module, or LLVM itself behind the `llvm`
//! feature) implements them once:
//!
//! - [`CoverageModule`]: create data objects and declarations, list globals
//! - [`IncrementSink`]: a builder cursor that can emit the increment call
//! - [`PassBackend`]: parse and run a textual pass pipeline
//!
//! What a host can do is reported once through [`HostCapabilities`] instead
//! of being checked at every call site.

use std::fmt;

use crate::error::{CoverageError, PipelineError};

/// Symbol linkage, with the same meaning as LLVM's linkage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Linkage {
    Private,
    Internal,
    #[default]
    External,
    /// Merged with identical definitions from other units; never discarded
    /// just for being unreferenced.
    LinkOnceOdr,
    WeakOdr,
}

impl Linkage {
    /// Whether the symbol is invisible outside its module.
    pub fn is_local(self) -> bool {
        matches!(self, Linkage::Private | Linkage::Internal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    #[default]
    Default,
    Hidden,
    Protected,
}

/// Initializer of a data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstData {
    U32(u32),
    U64(u64),
    /// `[N x i8]`
    Bytes(Vec<u8>),
    /// Non-packed struct of the given fields.
    Struct(Vec<ConstData>),
    /// Address of another global or function.
    SymbolRef(String),
    /// `[N x i64] zeroinitializer`, a counter array.
    Counters(u32),
}

impl ConstData {
    /// ABI alignment in bytes on a 64-bit target.
    pub fn align(&self) -> usize {
        match self {
            ConstData::U32(_) => 4,
            ConstData::U64(_) | ConstData::SymbolRef(_) | ConstData::Counters(_) => 8,
            ConstData::Bytes(_) => 1,
            ConstData::Struct(fields) => fields.iter().map(ConstData::align).max().unwrap_or(1),
        }
    }

    /// Allocation size in bytes on a 64-bit target, including padding.
    pub fn size(&self) -> usize {
        match self {
            ConstData::U32(_) => 4,
            ConstData::U64(_) | ConstData::SymbolRef(_) => 8,
            ConstData::Bytes(bytes) => bytes.len(),
            ConstData::Counters(n) => *n as usize * 8,
            ConstData::Struct(fields) => {
                let mut size: usize = 0;
                for field in fields {
                    size = size.next_multiple_of(field.align()) + field.size();
                }
                size.next_multiple_of(self.align())
            }
        }
    }

    /// Little-endian image of the constant, or `None` if it contains a
    /// relocation.
    pub fn to_le_bytes(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size());
        self.write_le(&mut out)?;
        Some(out)
    }

    fn write_le(&self, out: &mut Vec<u8>) -> Option<()> {
        match self {
            ConstData::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            ConstData::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            ConstData::Bytes(bytes) => out.extend_from_slice(bytes),
            ConstData::Counters(n) => out.resize(out.len() + *n as usize * 8, 0),
            ConstData::SymbolRef(_) => return None,
            ConstData::Struct(fields) => {
                let start = out.len();
                for field in fields {
                    let offset = (out.len() - start).next_multiple_of(field.align());
                    out.resize(start + offset, 0);
                    field.write_le(out)?;
                }
                out.resize(start + self.size(), 0);
            }
        }
        Some(())
    }

    /// Symbols this constant refers to.
    pub fn references(&self) -> Vec<&str> {
        match self {
            ConstData::SymbolRef(name) => vec![name.as_str()],
            ConstData::Struct(fields) => fields.iter().flat_map(ConstData::references).collect(),
            _ => Vec::new(),
        }
    }
}

/// A module-level global variable as the emitter wants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject {
    pub name: String,
    pub initializer: ConstData,
    pub constant: bool,
    pub linkage: Linkage,
    pub visibility: Visibility,
    pub section: Option<String>,
    pub alignment: Option<u32>,
}

impl DataObject {
    /// An external, writable global with default placement.
    pub fn new(name: impl Into<String>, initializer: ConstData) -> Self {
        Self {
            name: name.into(),
            initializer,
            constant: false,
            linkage: Linkage::External,
            visibility: Visibility::Default,
            section: None,
            alignment: None,
        }
    }

    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn aligned(mut self, alignment: u32) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

/// Arguments of one `llvm.instrprof.increment` call.
///
/// The field types are the intrinsic's parameter types; there is no other
/// check that a call matches what the lowering pass expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementCall {
    /// Name variable of the instrumented function (`__profn_<name>`).
    pub name_var: String,
    pub function_hash: u64,
    pub num_counters: u32,
    pub index: u32,
}

/// Options of the pass that lowers increment intrinsics into memory
/// operations on counter arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoweringOptions {
    /// Emit `atomicrmw add` instead of a load/add/store sequence.
    pub atomic: bool,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self { atomic: true }
    }
}

/// What a host supports, decided once when the host is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Pointers are untyped, so the name variable is passed without a cast.
    pub opaque_pointers: bool,
    /// The lowering pass can emit atomic counter updates.
    pub atomic_lowering: bool,
    /// Increment intrinsics can be lowered at all.
    pub lowering_pass: bool,
}

impl fmt::Display for HostCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "opaque_pointers={} atomic_lowering={} lowering_pass={}",
            self.opaque_pointers, self.atomic_lowering, self.lowering_pass
        )
    }
}

/// Module-level operations needed for instrumentation and record emission.
pub trait CoverageModule {
    fn capabilities(&self) -> HostCapabilities;

    /// Names of all global variables, in module order.
    fn global_names(&self) -> Vec<String>;

    fn has_function(&self, name: &str) -> bool;

    /// Create `object`, or replace the definition of an existing global of
    /// the same name.
    fn define_data(&mut self, object: DataObject) -> Result<(), CoverageError>;

    /// Declare `void name()` unless a function of that name already exists.
    fn declare_void_function(&mut self, name: &str) -> Result<(), CoverageError>;

    /// Declare the intrinsic `name` unless it already is.
    fn declare_intrinsic(&mut self, name: &str) -> Result<(), CoverageError>;
}

/// A builder positioned inside a function body.
pub trait IncrementSink {
    /// Emit `call void @llvm.instrprof.increment(...)` at the cursor.
    fn insert_increment(&mut self, intrinsic: &str, call: &IncrementCall) -> Result<(), CoverageError>;
}

/// A pass pipeline engine for modules of type `M`.
pub trait PassBackend<M: ?Sized> {
    /// A parsed, ready-to-run pipeline.
    type Pipeline;

    fn capabilities(&self) -> HostCapabilities;

    /// Parse `passes`, placing the lowering stage first when `lowering` is
    /// given. Nothing runs if parsing fails.
    fn build_pipeline(
        &self,
        lowering: Option<LoweringOptions>,
        passes: &str,
    ) -> Result<Self::Pipeline, PipelineError>;

    /// Run `pipeline` over `module` with freshly created analysis caches.
    fn run(&self, module: &mut M, pipeline: Self::Pipeline) -> Result<(), PipelineError>;
}
