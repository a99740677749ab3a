//! Counter-increment insertion.
//!
//! Instrumenting a function takes two steps, run while the module is still
//! being built and before any optimization:
//!
//! 1. [`prepare_function`] declares the increment intrinsic and the
//!    function's `__profn_` name variable, and computes its identity.
//! 2. [`FunctionInstrumentation::increment`] emits one increment call at a
//!    builder cursor, once per counter site.
//!
//! The function hash passed to the intrinsic is the same one the record
//! emitter later recomputes from the counter array's name, see
//! [`FunctionIdentity`].

use tracing::trace;

use crate::error::CoverageError;
use crate::hash::FunctionIdentity;
use crate::host::{ConstData, CoverageModule, DataObject, IncrementCall, IncrementSink, Linkage};
use crate::runtime::{functions, profile_name_var};

/// The declared `llvm.instrprof.increment` intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementIntrinsic {
    name: &'static str,
}

impl IncrementIntrinsic {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The private `__profn_<function>` global holding the function name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileNameVar {
    pub global: String,
    pub function: String,
}

/// Declare (or find) the increment intrinsic.
pub fn increment_intrinsic<M: CoverageModule + ?Sized>(module: &mut M) -> Result<IncrementIntrinsic, CoverageError> {
    module.declare_intrinsic(functions::INSTRPROF_INCREMENT)?;
    Ok(IncrementIntrinsic {
        name: functions::INSTRPROF_INCREMENT,
    })
}

/// Create the name variable of `function`, reusing the global if it exists.
///
/// The global is a private constant `[len x i8]` with the raw name bytes, no
/// NUL terminator.
pub fn create_profile_name<M: CoverageModule + ?Sized>(
    module: &mut M,
    function: &str,
) -> Result<ProfileNameVar, CoverageError> {
    let global = profile_name_var(function);
    module.define_data(
        DataObject::new(global.clone(), ConstData::Bytes(function.as_bytes().to_vec()))
            .constant()
            .with_linkage(Linkage::Private),
    )?;
    Ok(ProfileNameVar {
        global,
        function: function.to_string(),
    })
}

/// Emit one increment call at the sink's cursor.
///
/// Arguments are, in order: the name variable, the 64-bit function hash, the
/// 32-bit counter count and the 32-bit index of the counter to bump.
pub fn insert_increment<S: IncrementSink + ?Sized>(
    sink: &mut S,
    intrinsic: &IncrementIntrinsic,
    name: &ProfileNameVar,
    function_hash: u64,
    num_counters: u32,
    index: u32,
) -> Result<(), CoverageError> {
    let call = IncrementCall {
        name_var: name.global.clone(),
        function_hash,
        num_counters,
        index,
    };
    trace!(
        function = %name.function,
        hash = function_hash,
        num_counters,
        index,
        "inserting counter increment"
    );
    sink.insert_increment(intrinsic.name(), &call)
}

/// Everything needed to place counter increments into one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInstrumentation {
    pub identity: FunctionIdentity,
    pub intrinsic: IncrementIntrinsic,
    pub name_var: ProfileNameVar,
    pub num_counters: u32,
}

impl FunctionInstrumentation {
    /// Increment counter `index` at the sink's cursor.
    pub fn increment<S: IncrementSink + ?Sized>(&self, sink: &mut S, index: u32) -> Result<(), CoverageError> {
        insert_increment(
            sink,
            &self.intrinsic,
            &self.name_var,
            self.identity.structural_hash,
            self.num_counters,
            index,
        )
    }
}

/// Declare what instrumenting `function` with `num_counters` counters needs.
pub fn prepare_function<M: CoverageModule + ?Sized>(
    module: &mut M,
    function: &str,
    num_counters: u32,
) -> Result<FunctionInstrumentation, CoverageError> {
    if !module.has_function(function) {
        return Err(CoverageError::UnknownFunction {
            name: function.to_string(),
        });
    }
    let intrinsic = increment_intrinsic(module)?;
    let name_var = create_profile_name(module, function)?;
    Ok(FunctionInstrumentation {
        identity: FunctionIdentity::new(function),
        intrinsic,
        name_var,
        num_counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::function_hash;
    use crate::ir::{Instruction, Module};

    #[test]
    fn test_profile_name_var() {
        let mut module = Module::new("m");
        let var = create_profile_name(&mut module, "foo").unwrap();
        assert_eq!(var.global, "__profn_foo");

        let global = module.global("__profn_foo").unwrap();
        assert_eq!(global.object.initializer, ConstData::Bytes(b"foo".to_vec()));
        assert_eq!(global.object.linkage, Linkage::Private);
        assert!(global.object.constant);

        // a second call reuses the global
        create_profile_name(&mut module, "foo").unwrap();
        assert_eq!(module.global_names(), vec!["__profn_foo".to_string()]);
    }

    #[test]
    fn test_prepare_unknown_function() {
        let mut module = Module::new("m");
        assert!(matches!(
            prepare_function(&mut module, "missing", 1),
            Err(CoverageError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_increment_call_arguments() {
        let mut module = Module::new("m");
        module.add_function("foo", Linkage::External);
        let inst = prepare_function(&mut module, "foo", 1).unwrap();
        assert!(module.has_intrinsic(functions::INSTRPROF_INCREMENT));

        inst.increment(&mut module.entry_cursor("foo").unwrap(), 0).unwrap();

        let body = module.function("foo").unwrap().instructions();
        assert_eq!(
            body[0],
            Instruction::Call {
                callee: functions::INSTRPROF_INCREMENT.to_string(),
                increment: Some(IncrementCall {
                    name_var: "__profn_foo".to_string(),
                    function_hash: function_hash(b"foo"),
                    num_counters: 1,
                    index: 0,
                }),
            }
        );
    }
}
