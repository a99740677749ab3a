//! In-memory IR host.
//!
//! A small module model: global variables described by
//! [`DataObject`], and functions whose entry block is a flat list of
//! [`Instruction`]s. It implements every [`crate::host`] trait, so the whole
//! instrument / lower / optimize / emit flow can run without LLVM, and it
//! keeps enough structure (call edges, symbol references, associated
//! globals) for dead-code elimination to behave like LLVM's.

pub mod passes;

pub use passes::{AnalysisCaches, Pass, PassEngine, Pipeline, RunStats};

use std::collections::BTreeSet;

use tracing::trace;

use crate::error::CoverageError;
use crate::host::{
    ConstData, CoverageModule, DataObject, HostCapabilities, IncrementCall, IncrementSink, Linkage,
};
use crate::instrument::{prepare_function, FunctionInstrumentation};

/// Capabilities of the in-memory host.
pub const IR_CAPABILITIES: HostCapabilities = HostCapabilities {
    opaque_pointers: true,
    atomic_lowering: true,
    lowering_pass: true,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Call `callee`. Increment intrinsic calls carry their arguments.
    Call {
        callee: String,
        increment: Option<IncrementCall>,
    },
    /// `atomicrmw add ptr getelementptr(@counters, index), 1 monotonic`
    AtomicAdd { counters: String, index: u32 },
    /// `load`, `add 1`, `store` on `counters[index]`
    LoadAddStore { counters: String, index: u32 },
    Ret,
}

impl Instruction {
    /// Symbols the instruction refers to.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Instruction::Call { callee, increment } => {
                let mut refs = vec![callee.as_str()];
                if let Some(call) = increment {
                    refs.push(call.name_var.as_str());
                }
                refs
            }
            Instruction::AtomicAdd { counters, .. } | Instruction::LoadAddStore { counters, .. } => {
                vec![counters.as_str()]
            }
            Instruction::Ret => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    /// Entry block. `None` for declarations.
    pub body: Option<Vec<Instruction>>,
    pub intrinsic: bool,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub fn instructions(&self) -> &[Instruction] {
        self.body.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub object: DataObject,
    /// Function this global lives and dies with (`!associated`).
    pub associated: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    globals: Vec<Global>,
    functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Define `name` with an entry block holding only `ret`.
    pub fn add_function(&mut self, name: impl Into<String>, linkage: Linkage) {
        let name = name.into();
        if let Some(existing) = self.function_mut(&name) {
            existing.linkage = linkage;
            existing.body.get_or_insert_with(|| vec![Instruction::Ret]);
            return;
        }
        self.functions.push(Function {
            name,
            linkage,
            body: Some(vec![Instruction::Ret]),
            intrinsic: false,
        });
    }

    /// Append a call to `callee` before `caller`'s return.
    pub fn add_call(&mut self, caller: &str, callee: &str) -> Result<(), CoverageError> {
        if self.function(callee).is_none() {
            return Err(CoverageError::UnknownFunction {
                name: callee.to_string(),
            });
        }
        let body = self
            .function_mut(caller)
            .and_then(|f| f.body.as_mut())
            .ok_or_else(|| CoverageError::UnknownFunction {
                name: caller.to_string(),
            })?;
        let at = body.iter().position(|i| *i == Instruction::Ret).unwrap_or(body.len());
        body.insert(
            at,
            Instruction::Call {
                callee: callee.to_string(),
                increment: None,
            },
        );
        Ok(())
    }

    /// Add `object`, tying its lifetime to `function`.
    pub fn add_associated_global(&mut self, object: DataObject, function: &str) {
        let name = object.name.clone();
        self.upsert_global(object);
        if let Some(global) = self.globals.iter_mut().find(|g| g.object.name == name) {
            global.associated = Some(function.to_string());
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub(crate) fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.object.name == name)
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn has_intrinsic(&self, name: &str) -> bool {
        self.function(name).is_some_and(|f| f.intrinsic)
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.global(name).is_some() || self.function(name).is_some()
    }

    /// A cursor at the start of `function`'s entry block.
    pub fn entry_cursor(&mut self, function: &str) -> Option<Cursor<'_>> {
        let index = self
            .functions
            .iter()
            .position(|f| f.name == function && !f.is_declaration())?;
        Some(Cursor {
            module: self,
            function: index,
            position: 0,
        })
    }

    /// Prepare `function` for `num_counters` counters and increment each of
    /// them once at the top of its entry block.
    pub fn instrument_function(
        &mut self,
        function: &str,
        num_counters: u32,
    ) -> Result<FunctionInstrumentation, CoverageError> {
        let instrumentation = prepare_function(self, function, num_counters)?;
        let mut cursor = self
            .entry_cursor(function)
            .ok_or_else(|| CoverageError::UnknownFunction {
                name: function.to_string(),
            })?;
        for index in 0..num_counters {
            instrumentation.increment(&mut cursor, index)?;
        }
        Ok(instrumentation)
    }

    fn upsert_global(&mut self, object: DataObject) {
        match self.globals.iter_mut().find(|g| g.object.name == object.name) {
            Some(existing) => existing.object = object,
            None => self.globals.push(Global {
                object,
                associated: None,
            }),
        }
    }

    pub(crate) fn remove_global(&mut self, name: &str) {
        self.globals.retain(|g| g.object.name != name);
    }

    pub(crate) fn retain_globals(&mut self, keep: impl FnMut(&Global) -> bool) {
        self.globals.retain(keep);
    }

    pub(crate) fn retain_functions(&mut self, keep: impl FnMut(&Function) -> bool) {
        self.functions.retain(keep);
    }

    pub(crate) fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    /// Every symbol referenced anywhere in the module.
    pub(crate) fn referenced_symbols(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for function in &self.functions {
            for inst in function.instructions() {
                refs.extend(inst.references().into_iter().map(str::to_string));
            }
        }
        for global in &self.globals {
            refs.extend(global.object.initializer.references().into_iter().map(str::to_string));
        }
        refs
    }
}

impl CoverageModule for Module {
    fn capabilities(&self) -> HostCapabilities {
        IR_CAPABILITIES
    }

    fn global_names(&self) -> Vec<String> {
        self.globals.iter().map(|g| g.object.name.clone()).collect()
    }

    fn has_function(&self, name: &str) -> bool {
        self.function(name).is_some()
    }

    fn define_data(&mut self, object: DataObject) -> Result<(), CoverageError> {
        if self.function(&object.name).is_some() {
            return Err(CoverageError::Host {
                message: format!("`{}` is already defined as a function", object.name),
            });
        }
        for symbol in object.initializer.references() {
            if !self.has_symbol(symbol) {
                return Err(CoverageError::UnknownSymbol {
                    name: symbol.to_string(),
                });
            }
        }
        trace!(module = %self.name, global = %object.name, "defining global");
        self.upsert_global(object);
        Ok(())
    }

    fn declare_void_function(&mut self, name: &str) -> Result<(), CoverageError> {
        if self.global(name).is_some() {
            return Err(CoverageError::Host {
                message: format!("`{}` is already defined as a global", name),
            });
        }
        if self.function(name).is_none() {
            self.functions.push(Function {
                name: name.to_string(),
                linkage: Linkage::External,
                body: None,
                intrinsic: false,
            });
        }
        Ok(())
    }

    fn declare_intrinsic(&mut self, name: &str) -> Result<(), CoverageError> {
        if !name.starts_with("llvm.") {
            return Err(CoverageError::MissingIntrinsic {
                name: name.to_string(),
            });
        }
        if !self.has_intrinsic(name) {
            self.functions.push(Function {
                name: name.to_string(),
                linkage: Linkage::External,
                body: None,
                intrinsic: true,
            });
        }
        Ok(())
    }
}

/// Insertion point inside one function's entry block.
#[derive(Debug)]
pub struct Cursor<'m> {
    module: &'m mut Module,
    function: usize,
    position: usize,
}

impl IncrementSink for Cursor<'_> {
    fn insert_increment(&mut self, intrinsic: &str, call: &IncrementCall) -> Result<(), CoverageError> {
        if !self.module.has_intrinsic(intrinsic) {
            return Err(CoverageError::MissingIntrinsic {
                name: intrinsic.to_string(),
            });
        }
        match self.module.global(&call.name_var) {
            Some(global) if matches!(global.object.initializer, ConstData::Bytes(_)) => {}
            _ => {
                return Err(CoverageError::UnknownSymbol {
                    name: call.name_var.clone(),
                })
            }
        }
        let function = &mut self.module.functions[self.function];
        let body = function.body.as_mut().ok_or_else(|| CoverageError::Host {
            message: format!("cannot insert into declaration `{}`", function.name),
        })?;
        body.insert(
            self.position,
            Instruction::Call {
                callee: intrinsic.to_string(),
                increment: Some(call.clone()),
            },
        );
        self.position += 1;
        Ok(())
    }
}
