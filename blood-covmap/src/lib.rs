//! # Blood Coverage Mapping
//!
//! Source-coverage instrumentation for the Blood LLVM backend.
//!
//! The crate inserts `llvm.instrprof.increment` calls while a module is
//! built, runs the module's pass pipeline with increment lowering in front of
//! it, and then emits the `__llvm_covmap` / `__llvm_covfun` records that
//! `llvm-cov` needs to map counters back to source.
//!
//! ## Pipeline
//!
//! ```text
//! instrument -> [instrprof lowering] -> pass pipeline -> coverage records
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use blood_covmap::config::CoverageOptions;
//! use blood_covmap::host::Linkage;
//! use blood_covmap::ir::{Module, PassEngine};
//! use blood_covmap::pipeline::run_passes_with_coverage;
//!
//! let mut module = Module::new("demo");
//! module.add_function("main", Linkage::External);
//! module.instrument_function("main", 1).unwrap();
//!
//! let report = run_passes_with_coverage(
//!     &mut module,
//!     &PassEngine::new(),
//!     "default<O2>",
//!     Some(CoverageOptions::new("src/main.blood")),
//! )
//! .unwrap();
//!
//! let emission = report.emission.unwrap();
//! assert_eq!(emission.records.len(), 1);
//! assert_eq!(emission.header.version, 6);
//! ```
//!
//! ## Module Overview
//!
//! - [`hash`] - Function and name hashes
//! - [`mapping`] - Counter model, mapping encoder/decoder, filenames table
//! - [`record`] - covmap header and covfun record layouts
//! - [`host`] - Interfaces to the IR library and pass engine
//! - [`instrument`] - Counter-increment insertion
//! - [`emit`] - Coverage record emission
//! - [`pipeline`] - Lowering / optimization / emission sequencing
//! - [`ir`] - In-memory IR host and pass engine
//! - `llvm` - LLVM host (`llvm` feature)
//! - [`config`] - TOML configuration
//! - [`runtime`] - Profiling runtime symbol names

pub mod config;
pub mod emit;
pub mod error;
pub mod hash;
pub mod host;
pub mod instrument;
pub mod ir;
pub mod leb128;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod mapping;
pub mod pipeline;
pub mod record;
pub mod runtime;

// Re-export commonly used types
pub use config::{CoverageOptions, ObjectFormat, PipelineConfig};
pub use emit::{CoverageEmitter, EmissionSummary};
pub use error::{CoverageError, Error, MappingError, PipelineError};
pub use hash::{function_hash, name_hash, FunctionIdentity};
pub use mapping::{Counter, CounterExpression, CounterMappingRegion, FilenameTable, MappingWriter, RegionKind};
pub use pipeline::{run_passes_with_coverage, CoveragePipeline, PipelineReport, PipelineState};
pub use record::{CoverageFunctionRecord, CoverageModuleHeader, COVERAGE_MAPPING_VERSION};
