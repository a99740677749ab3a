//! LLVM host, built on inkwell.
//!
//! Compiled with the `llvm` feature plus one of `llvm17` / `llvm18`. Both
//! lines use opaque pointers and the new pass manager, so a single
//! [`HostCapabilities`] value describes them.
//!
//! ```text
//! LlvmModule   -> CoverageModule  (globals, declarations, intrinsics)
//! LlvmCursor   -> IncrementSink   (an inkwell Builder positioned in a block)
//! LlvmBackend  -> PassBackend     (LLVMRunPasses with a target machine)
//! ```

use std::ffi::CString;
use std::sync::Once;

use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::intrinsics::Intrinsic;
use inkwell::module::{Linkage as LlvmLinkage, Module};
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{CodeModel, InitializationConfig, RelocMode, Target, TargetMachine};
use inkwell::types::AnyType;
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, GlobalValue};
use inkwell::{GlobalVisibility, OptimizationLevel};
use tracing::{debug, trace};

use crate::error::{CoverageError, PipelineError};
use crate::host::{
    ConstData, CoverageModule, DataObject, HostCapabilities, IncrementCall, IncrementSink, Linkage,
    LoweringOptions, PassBackend, Visibility,
};

/// Capabilities of the supported LLVM lines.
pub const LLVM_CAPABILITIES: HostCapabilities = HostCapabilities {
    opaque_pointers: true,
    atomic_lowering: true,
    lowering_pass: true,
};

/// Name of the lowering pass in LLVM's pipeline syntax.
pub const LOWERING_PASS: &str = "instrprof";

/// `cl::opt` that makes the lowering pass emit `atomicrmw add`.
const ATOMIC_COUNTERS_FLAG: &str = "-instrprof-atomic-counter-update-all";

fn linkage(linkage: Linkage) -> LlvmLinkage {
    match linkage {
        Linkage::Private => LlvmLinkage::Private,
        Linkage::Internal => LlvmLinkage::Internal,
        Linkage::External => LlvmLinkage::External,
        Linkage::LinkOnceOdr => LlvmLinkage::LinkOnceODR,
        Linkage::WeakOdr => LlvmLinkage::WeakODR,
    }
}

fn visibility(visibility: Visibility) -> GlobalVisibility {
    match visibility {
        Visibility::Default => GlobalVisibility::Default,
        Visibility::Hidden => GlobalVisibility::Hidden,
        Visibility::Protected => GlobalVisibility::Protected,
    }
}

/// An inkwell module seen as a [`CoverageModule`].
pub struct LlvmModule<'m, 'ctx> {
    context: &'ctx Context,
    module: &'m Module<'ctx>,
}

impl<'m, 'ctx> LlvmModule<'m, 'ctx> {
    pub fn new(context: &'ctx Context, module: &'m Module<'ctx>) -> Self {
        Self { context, module }
    }

    pub fn module(&self) -> &'m Module<'ctx> {
        self.module
    }

    /// A cursor that emits increments through `builder`, which must already
    /// be positioned inside a function of this module.
    pub fn cursor<'b>(&self, builder: &'b Builder<'ctx>) -> LlvmCursor<'b, 'm, 'ctx> {
        LlvmCursor {
            context: self.context,
            module: self.module,
            builder,
        }
    }

    fn const_value(&self, data: &ConstData) -> Result<BasicValueEnum<'ctx>, CoverageError> {
        let value = match data {
            ConstData::U32(v) => self.context.i32_type().const_int(u64::from(*v), false).into(),
            ConstData::U64(v) => self.context.i64_type().const_int(*v, false).into(),
            ConstData::Bytes(bytes) => self.context.const_string(bytes, false).into(),
            ConstData::Counters(n) => self.context.i64_type().array_type(*n).const_zero().into(),
            ConstData::Struct(fields) => {
                let values = fields
                    .iter()
                    .map(|field| self.const_value(field))
                    .collect::<Result<Vec<_>, _>>()?;
                self.context.const_struct(&values, false).into()
            }
            ConstData::SymbolRef(name) => {
                let target = self
                    .module
                    .get_function(name)
                    .map(|f| f.as_global_value())
                    .or_else(|| self.module.get_global(name))
                    .ok_or_else(|| CoverageError::UnknownSymbol { name: name.clone() })?;
                target.as_pointer_value().into()
            }
        };
        Ok(value)
    }

    fn globals(&self) -> impl Iterator<Item = GlobalValue<'ctx>> + '_ {
        std::iter::successors(self.module.get_first_global(), |g| g.get_next_global())
    }
}

impl CoverageModule for LlvmModule<'_, '_> {
    fn capabilities(&self) -> HostCapabilities {
        LLVM_CAPABILITIES
    }

    fn global_names(&self) -> Vec<String> {
        self.globals()
            .map(|g| g.get_name().to_string_lossy().into_owned())
            .collect()
    }

    fn has_function(&self, name: &str) -> bool {
        self.module.get_function(name).is_some()
    }

    fn define_data(&mut self, object: DataObject) -> Result<(), CoverageError> {
        let initializer = self.const_value(&object.initializer)?;
        let global = match self.module.get_global(&object.name) {
            Some(existing) if existing.get_value_type() == initializer.get_type().as_any_type_enum() => existing,
            Some(_) => {
                return Err(CoverageError::Host {
                    message: format!("global `{}` already exists with a different type", object.name),
                })
            }
            None => self.module.add_global(initializer.get_type(), None, &object.name),
        };
        global.set_initializer(&initializer);
        global.set_constant(object.constant);
        global.set_linkage(linkage(object.linkage));
        global.set_visibility(visibility(object.visibility));
        if let Some(section) = &object.section {
            global.set_section(Some(section.as_str()));
        }
        if let Some(alignment) = object.alignment {
            global.set_alignment(alignment);
        }
        trace!(global = %object.name, "defined LLVM global");
        Ok(())
    }

    fn declare_void_function(&mut self, name: &str) -> Result<(), CoverageError> {
        if self.module.get_function(name).is_none() {
            let fn_type = self.context.void_type().fn_type(&[], false);
            self.module.add_function(name, fn_type, None);
        }
        Ok(())
    }

    fn declare_intrinsic(&mut self, name: &str) -> Result<(), CoverageError> {
        let missing = || CoverageError::MissingIntrinsic { name: name.to_string() };
        let intrinsic = Intrinsic::find(name).ok_or_else(missing)?;
        intrinsic.get_declaration(self.module, &[]).ok_or_else(missing)?;
        Ok(())
    }
}

/// An inkwell builder used as an [`IncrementSink`].
pub struct LlvmCursor<'b, 'm, 'ctx> {
    context: &'ctx Context,
    module: &'m Module<'ctx>,
    builder: &'b Builder<'ctx>,
}

impl<'ctx> IncrementSink for LlvmCursor<'_, '_, 'ctx> {
    fn insert_increment(&mut self, intrinsic: &str, call: &IncrementCall) -> Result<(), CoverageError> {
        let function = self
            .module
            .get_function(intrinsic)
            .ok_or_else(|| CoverageError::MissingIntrinsic {
                name: intrinsic.to_string(),
            })?;
        let name_var = self
            .module
            .get_global(&call.name_var)
            .ok_or_else(|| CoverageError::UnknownSymbol {
                name: call.name_var.clone(),
            })?;

        let name_ptr = name_var.as_pointer_value();

        let args: [BasicMetadataValueEnum<'ctx>; 4] = [
            name_ptr.into(),
            self.context.i64_type().const_int(call.function_hash, false).into(),
            self.context.i32_type().const_int(u64::from(call.num_counters), false).into(),
            self.context.i32_type().const_int(u64::from(call.index), false).into(),
        ];
        self.builder
            .build_call(function, &args, "")
            .map_err(|e| CoverageError::Host {
                message: format!("LLVM call error: {}", e),
            })?;
        Ok(())
    }
}

/// Runs textual pipelines through LLVM's new pass manager.
pub struct LlvmBackend {
    machine: TargetMachine,
}

/// A pipeline string LLVM has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlvmPipeline {
    text: String,
    lowering: Option<LoweringOptions>,
}

impl LlvmPipeline {
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl LlvmBackend {
    pub fn new(machine: TargetMachine) -> Self {
        Self { machine }
    }

    /// Backend for the host CPU.
    pub fn native() -> Result<Self, PipelineError> {
        Ok(Self::new(get_native_target_machine()?))
    }

    pub fn target_machine(&self) -> &TargetMachine {
        &self.machine
    }
}

impl<'m, 'ctx> PassBackend<LlvmModule<'m, 'ctx>> for LlvmBackend {
    type Pipeline = LlvmPipeline;

    fn capabilities(&self) -> HostCapabilities {
        LLVM_CAPABILITIES
    }

    fn build_pipeline(&self, lowering: Option<LoweringOptions>, passes: &str) -> Result<LlvmPipeline, PipelineError> {
        if passes.is_empty() {
            return Err(PipelineError::Malformed {
                text: String::new(),
                reason: "empty pipeline".to_string(),
            });
        }
        // LLVM only parses a pipeline when running it, so check the text
        // against an empty scratch module before touching the real one.
        let scratch_context = Context::create();
        let scratch = scratch_context.create_module("pipeline_check");
        scratch
            .run_passes(passes, &self.machine, PassBuilderOptions::create())
            .map_err(|e| parse_error(passes, &e.to_string()))?;

        let text = match lowering {
            Some(_) => format!("{},{}", LOWERING_PASS, passes),
            None => passes.to_string(),
        };
        Ok(LlvmPipeline { text, lowering })
    }

    fn run(&self, module: &mut LlvmModule<'m, 'ctx>, pipeline: LlvmPipeline) -> Result<(), PipelineError> {
        if let Some(options) = pipeline.lowering {
            configure_lowering(options)?;
        }
        debug!(pipeline = %pipeline.text, "running LLVM pass pipeline");
        // LLVMRunPasses builds its analysis managers per call.
        module
            .module
            .run_passes(&pipeline.text, &self.machine, PassBuilderOptions::create())
            .map_err(|e| PipelineError::Backend {
                message: e.to_string(),
            })
    }
}

fn parse_error(text: &str, message: &str) -> PipelineError {
    let unknown = message
        .strip_prefix("unknown pass name '")
        .and_then(|rest| rest.strip_suffix('\''));
    match unknown {
        Some(name) => PipelineError::UnknownPass { name: name.to_string() },
        None => PipelineError::Malformed {
            text: text.to_string(),
            reason: message.to_string(),
        },
    }
}

static ATOMIC_COUNTERS: Once = Once::new();

/// Whether `options` still needs the atomic flag switched on, given whether
/// it already is. The flag cannot be switched off again.
fn lowering_needs_atomic_flag(options: LoweringOptions, atomic_enabled: bool) -> Result<bool, PipelineError> {
    match (options.atomic, atomic_enabled) {
        (false, true) => Err(PipelineError::Backend {
            message: "non-atomic counter lowering requested, but atomic updates are already enabled for this process"
                .to_string(),
        }),
        (false, false) => Ok(false),
        (true, enabled) => Ok(!enabled),
    }
}

/// Atomic counter updates are a process-wide LLVM option and can only be
/// switched on, once.
fn configure_lowering(options: LoweringOptions) -> Result<(), PipelineError> {
    if !lowering_needs_atomic_flag(options, ATOMIC_COUNTERS.is_completed())? {
        return Ok(());
    }
    let args = [CString::new("blood-covmap"), CString::new(ATOMIC_COUNTERS_FLAG)]
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PipelineError::Backend { message: e.to_string() })?;
    let overview = CString::default();
    ATOMIC_COUNTERS.call_once(|| {
        let argv: Vec<*const std::os::raw::c_char> = args.iter().map(|a| a.as_ptr()).collect();
        // SAFETY: argv points at NUL-terminated strings that outlive the call.
        unsafe {
            inkwell::llvm_sys::support::LLVMParseCommandLineOptions(argv.len() as i32, argv.as_ptr(), overview.as_ptr());
        }
        debug!(flag = ATOMIC_COUNTERS_FLAG, "enabled atomic counter updates");
    });
    Ok(())
}

/// Get a target machine for the native platform.
pub fn get_native_target_machine() -> Result<TargetMachine, PipelineError> {
    let backend_error = |message: String| PipelineError::Backend { message };

    Target::initialize_native(&InitializationConfig::default())
        .map_err(|e| backend_error(format!("Failed to initialize native target: {}", e)))?;

    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple).map_err(|e| backend_error(format!("Failed to get target: {}", e)))?;

    let cpu = TargetMachine::get_host_cpu_name();
    let features = TargetMachine::get_host_cpu_features();

    target
        .create_target_machine(
            &triple,
            cpu.to_str().unwrap_or("generic"),
            features.to_str().unwrap_or(""),
            OptimizationLevel::Default,
            RelocMode::PIC,
            CodeModel::Default,
        )
        .ok_or_else(|| backend_error("Failed to create target machine".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoverageOptions;
    use crate::hash::{function_hash, name_hash};
    use crate::pipeline::run_passes_with_coverage;

    fn instrumented_foo<'ctx>(context: &'ctx Context, module: &Module<'ctx>, builder: &Builder<'ctx>) {
        let fn_type = context.void_type().fn_type(&[], false);
        let foo = module.add_function("foo", fn_type, None);
        let entry = context.append_basic_block(foo, "entry");
        builder.position_at_end(entry);

        let mut host = LlvmModule::new(context, module);
        let inst = crate::instrument::prepare_function(&mut host, "foo", 1).unwrap();
        inst.increment(&mut host.cursor(builder), 0).unwrap();
        builder.build_return(None).unwrap();
    }

    #[test]
    fn test_increment_call_is_emitted() {
        let context = Context::create();
        let module = context.create_module("test");
        let builder = context.create_builder();
        instrumented_foo(&context, &module, &builder);

        let ir = module.print_to_string().to_string();
        assert!(ir.contains("@__profn_foo = private constant [3 x i8] c\"foo\""));
        assert!(ir.contains(&format!(
            "call void @llvm.instrprof.increment(ptr @__profn_foo, i64 {}, i32 1, i32 0)",
            function_hash(b"foo")
        )));
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_atomic_flag_is_one_way() {
        let atomic = LoweringOptions { atomic: true };
        let plain = LoweringOptions { atomic: false };
        assert_eq!(lowering_needs_atomic_flag(atomic, false), Ok(true));
        assert_eq!(lowering_needs_atomic_flag(atomic, true), Ok(false));
        assert_eq!(lowering_needs_atomic_flag(plain, false), Ok(false));
        assert!(matches!(
            lowering_needs_atomic_flag(plain, true),
            Err(PipelineError::Backend { .. })
        ));
    }

    #[test]
    fn test_unknown_pass_is_construction_error() {
        let backend = LlvmBackend::native().unwrap();
        let err = PassBackend::<LlvmModule<'_, '_>>::build_pipeline(&backend, None, "not a real pass").unwrap_err();
        assert_eq!(
            err,
            PipelineError::UnknownPass {
                name: "not a real pass".to_string()
            }
        );
    }

    #[test]
    fn test_coverage_records_after_o0() {
        let context = Context::create();
        let module = context.create_module("test");
        let builder = context.create_builder();
        instrumented_foo(&context, &module, &builder);

        let backend = LlvmBackend::native().unwrap();
        let mut host = LlvmModule::new(&context, &module);
        let report =
            run_passes_with_coverage(&mut host, &backend, "default<O0>", Some(CoverageOptions::new("test.c"))).unwrap();

        let emission = report.emission.unwrap();
        assert_eq!(emission.records.len(), 1);
        assert_eq!(emission.records[0].record.name_hash, name_hash(b"foo"));

        let covrec = module.get_global("__covrec_foo").unwrap();
        assert_eq!(covrec.get_section().unwrap().to_str().unwrap(), "__llvm_covfun");
        assert_eq!(covrec.get_visibility(), GlobalVisibility::Hidden);
        assert!(module.get_global("__llvm_coverage_mapping").is_some());
        assert!(module.get_global("__llvm_profile_runtime_user").is_some());
    }
}
