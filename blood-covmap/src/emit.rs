//! Coverage record emission.
//!
//! Runs once per module, after the pass pipeline, so that it only describes
//! counter arrays that survived optimization:
//!
//! 1. encode the filenames table and place header + table in the covmap
//!    section as `__llvm_coverage_mapping`;
//! 2. for every `__profc_<name>` global, build `<name>`'s mapping and place
//!    its record in the covfun section as `__covrec_<name>`;
//! 3. reference `__llvm_profile_runtime` so the profiling runtime is linked.

use tracing::{debug, info, trace};

use crate::config::CoverageOptions;
use crate::error::CoverageError;
use crate::hash::FunctionIdentity;
use crate::host::{ConstData, CoverageModule, DataObject, Linkage, Visibility};
use crate::mapping::{placeholder_region, FilenameTable, MappingWriter};
use crate::record::{CoverageFunctionRecord, CoverageModuleHeader};
use crate::runtime::{coverage_record_name, function_name_from_counters, functions, symbols};

/// Alignment of both coverage sections' globals.
pub const COVERAGE_SECTION_ALIGN: u32 = 8;

/// One emitted `__covrec_` global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedRecord {
    pub function: String,
    pub global: String,
    pub record: CoverageFunctionRecord,
}

/// What [`CoverageEmitter::emit`] added to the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmissionSummary {
    pub header: CoverageModuleHeader,
    pub filenames: Vec<u8>,
    pub filenames_hash: u64,
    pub records: Vec<EmittedRecord>,
    /// Globals that did not look like counter arrays.
    pub skipped: Vec<String>,
}

impl EmissionSummary {
    pub fn record(&self, function: &str) -> Option<&EmittedRecord> {
        self.records.iter().find(|r| r.function == function)
    }
}

/// Builds coverage records for one module.
#[derive(Debug, Clone)]
pub struct CoverageEmitter<'a> {
    options: &'a CoverageOptions,
}

impl<'a> CoverageEmitter<'a> {
    pub fn new(options: &'a CoverageOptions) -> Self {
        Self { options }
    }

    pub fn emit<M: CoverageModule + ?Sized>(&self, module: &mut M) -> Result<EmissionSummary, CoverageError> {
        let sections = self.options.object_format.sections();

        let filenames = FilenameTable::single(self.options.source_file.as_str()).encode(self.options.compress_filenames)?;
        let filenames_len = u32::try_from(filenames.blob.len()).map_err(|_| CoverageError::MappingTooLarge {
            function: symbols::COVERAGE_MAPPING.to_string(),
            len: filenames.blob.len(),
        })?;
        let header = CoverageModuleHeader::new(filenames_len);
        module.define_data(
            DataObject::new(symbols::COVERAGE_MAPPING, header.to_const(&filenames.blob))
                .constant()
                .with_linkage(Linkage::LinkOnceOdr)
                .in_section(sections.covmap)
                .aligned(COVERAGE_SECTION_ALIGN),
        )?;
        debug!(
            source_file = %self.options.source_file,
            filenames_len,
            filenames_hash = format_args!("{:#018x}", filenames.hash),
            section = sections.covmap,
            "emitted coverage header"
        );

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for global in module.global_names() {
            let Some(function) = function_name_from_counters(&global).map(str::to_string) else {
                trace!(global = %global, "not a counter array, skipping");
                skipped.push(global);
                continue;
            };

            let identity = FunctionIdentity::new(function.as_str());
            // one synthetic region until front ends supply source positions
            let mapping = MappingWriter::new(&[0], &[], &[placeholder_region()]).encode()?;
            let record = CoverageFunctionRecord::new(&identity, filenames.hash, mapping)?;

            let record_global = coverage_record_name(&function);
            module.define_data(
                DataObject::new(record_global.clone(), ConstData::Bytes(record.to_bytes()))
                    .constant()
                    .with_linkage(Linkage::LinkOnceOdr)
                    .with_visibility(Visibility::Hidden)
                    .in_section(sections.covfun)
                    .aligned(COVERAGE_SECTION_ALIGN),
            )?;
            debug!(
                function = %identity.name,
                name_hash = format_args!("{:#018x}", record.name_hash),
                function_hash = record.function_hash,
                mapping_len = record.mapping_length(),
                "emitted coverage record"
            );
            records.push(EmittedRecord {
                function: identity.name,
                global: record_global,
                record,
            });
        }

        self.reference_runtime(module)?;

        info!(
            records = records.len(),
            skipped = skipped.len(),
            format = %self.options.object_format,
            "coverage mapping emitted"
        );
        Ok(EmissionSummary {
            header,
            filenames: filenames.blob,
            filenames_hash: filenames.hash,
            records,
            skipped,
        })
    }

    /// Declare the runtime entry point and keep it alive with a hidden
    /// link-once reference.
    fn reference_runtime<M: CoverageModule + ?Sized>(&self, module: &mut M) -> Result<(), CoverageError> {
        module.declare_void_function(functions::PROFILE_RUNTIME)?;
        module.define_data(
            DataObject::new(
                functions::PROFILE_RUNTIME_USER,
                ConstData::SymbolRef(functions::PROFILE_RUNTIME.to_string()),
            )
            .with_linkage(Linkage::LinkOnceOdr)
            .with_visibility(Visibility::Hidden),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectFormat;
    use crate::hash::{function_hash, name_hash};
    use crate::ir::Module;
    use crate::mapping::reader::{decode_mapping, read_filenames};

    fn module_with_counters(names: &[&str]) -> Module {
        let mut module = Module::new("m");
        for name in names {
            module
                .define_data(DataObject::new(*name, ConstData::Counters(1)).with_linkage(Linkage::Private))
                .unwrap();
        }
        module
    }

    #[test]
    fn test_emits_header_and_record() {
        let mut module = module_with_counters(&["__profc_foo"]);
        let options = CoverageOptions::new("test.c");
        let summary = CoverageEmitter::new(&options).emit(&mut module).unwrap();

        assert_eq!(summary.header.version, 6);
        assert_eq!(summary.header.filenames_length as usize, summary.filenames.len());
        assert_eq!(read_filenames(&summary.filenames).unwrap(), vec!["test.c"]);

        let header = module.global("__llvm_coverage_mapping").unwrap();
        assert_eq!(header.object.section.as_deref(), Some("__llvm_covmap"));
        assert_eq!(header.object.alignment, Some(8));
        assert_eq!(header.object.linkage, Linkage::LinkOnceOdr);
        assert!(header.object.constant);
        let bytes = header.object.initializer.to_le_bytes().unwrap();
        assert_eq!(&bytes[..16], &summary.header.to_bytes());
        // the aggregate is padded to 4-byte alignment
        assert_eq!(bytes.len(), (16 + summary.filenames.len()).next_multiple_of(4));
        assert_eq!(&bytes[16..16 + summary.filenames.len()], summary.filenames.as_slice());

        let emitted = summary.record("foo").unwrap();
        assert_eq!(emitted.record.name_hash, name_hash(b"foo"));
        assert_eq!(emitted.record.function_hash, function_hash(b"foo"));
        assert_eq!(emitted.record.filenames_hash, summary.filenames_hash);
        assert_eq!(decode_mapping(emitted.record.mapping()).unwrap().regions, vec![placeholder_region()]);

        let covrec = module.global("__covrec_foo").unwrap();
        assert_eq!(covrec.object.section.as_deref(), Some("__llvm_covfun"));
        assert_eq!(covrec.object.visibility, Visibility::Hidden);
        assert_eq!(covrec.object.linkage, Linkage::LinkOnceOdr);
        assert_eq!(covrec.object.initializer, ConstData::Bytes(emitted.record.to_bytes()));
    }

    #[test]
    fn test_skips_non_counter_globals() {
        let mut module = module_with_counters(&["notAProfileCounter", "__profc_bar"]);
        let options = CoverageOptions::new("test.c");
        let summary = CoverageEmitter::new(&options).emit(&mut module).unwrap();

        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].function, "bar");
        assert!(summary.skipped.contains(&"notAProfileCounter".to_string()));
        assert!(module.global("__covrec_notAProfileCounter").is_none());
    }

    #[test]
    fn test_runtime_reference() {
        let mut module = module_with_counters(&[]);
        let options = CoverageOptions::new("test.c");
        CoverageEmitter::new(&options).emit(&mut module).unwrap();

        assert!(module.function("__llvm_profile_runtime").unwrap().is_declaration());
        let user = module.global("__llvm_profile_runtime_user").unwrap();
        assert_eq!(user.object.visibility, Visibility::Hidden);
        assert_eq!(user.object.linkage, Linkage::LinkOnceOdr);
        assert_eq!(
            user.object.initializer,
            ConstData::SymbolRef("__llvm_profile_runtime".to_string())
        );
    }

    #[test]
    fn test_macho_sections_and_uncompressed_names() {
        let mut module = module_with_counters(&["__profc_f"]);
        let mut options = CoverageOptions::new("a.c");
        options.object_format = ObjectFormat::Macho;
        options.compress_filenames = false;
        let summary = CoverageEmitter::new(&options).emit(&mut module).unwrap();

        assert_eq!(summary.filenames, [&[1u8, 4, 0, 3][..], b"a.c"].concat());
        assert_eq!(
            module.global("__covrec_f").unwrap().object.section.as_deref(),
            Some("__LLVM_COV,__llvm_covfun")
        );
    }
}
