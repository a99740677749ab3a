//! Pass pipeline for the in-memory host.
//!
//! Accepts the same textual syntax as LLVM's new pass manager for the passes
//! it knows:
//!
//! ```text
//! pipeline := element (',' element)*
//! element  := name ['<' params '>']
//!           | 'module(' pipeline ')'
//! ```
//!
//! | Pass                    | Effect                                                  |
//! |-------------------------|---------------------------------------------------------|
//! | `instrprof`             | lower `llvm.instrprof.increment` to counter updates     |
//! | `globaldce`             | delete unreachable local / link-once definitions        |
//! | `strip-dead-prototypes` | delete unreferenced declarations                        |
//! | `default<O0..O3,Os,Oz>` | `O0` does nothing; other levels run the two passes above |
//! | `verify`                | check that every reference resolves                     |
//! | `no-op-module`          | nothing                                                 |
//!
//! Each run gets its own [`AnalysisCaches`]; nothing computed during one run
//! is visible to the next.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::{debug, trace};

use crate::error::PipelineError;
use crate::hash::{function_hash, name_hash};
use crate::host::{ConstData, DataObject, HostCapabilities, Linkage, LoweringOptions, PassBackend};
use crate::ir::{Instruction, Module, IR_CAPABILITIES};
use crate::leb128::write_uleb128;
use crate::runtime::{counters_name, data_name, functions, symbols};

/// Section of lowered counter arrays.
pub const COUNTERS_SECTION: &str = "__llvm_prf_cnts";
/// Section of per-function profile data.
pub const DATA_SECTION: &str = "__llvm_prf_data";
/// Section of the combined names blob.
pub const NAMES_SECTION: &str = "__llvm_prf_names";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
    Oz,
}

impl OptLevel {
    fn from_param(param: &str) -> Option<Self> {
        match param {
            "O0" => Some(OptLevel::O0),
            "O1" => Some(OptLevel::O1),
            "O2" => Some(OptLevel::O2),
            "O3" => Some(OptLevel::O3),
            "Os" => Some(OptLevel::Os),
            "Oz" => Some(OptLevel::Oz),
            _ => None,
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OptLevel::O0 => "O0",
            OptLevel::O1 => "O1",
            OptLevel::O2 => "O2",
            OptLevel::O3 => "O3",
            OptLevel::Os => "Os",
            OptLevel::Oz => "Oz",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    InstrProf(LoweringOptions),
    GlobalDce,
    StripDeadPrototypes,
    Default(OptLevel),
    Verify,
    NoOpModule,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::InstrProf(options) if options.atomic => write!(f, "instrprof<atomic>"),
            Pass::InstrProf(_) => write!(f, "instrprof"),
            Pass::GlobalDce => write!(f, "globaldce"),
            Pass::StripDeadPrototypes => write!(f, "strip-dead-prototypes"),
            Pass::Default(level) => write!(f, "default<{}>", level),
            Pass::Verify => write!(f, "verify"),
            Pass::NoOpModule => write!(f, "no-op-module"),
        }
    }
}

/// What a pass left intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservedAnalyses {
    All,
    None,
}

/// A parsed pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    passes: Vec<Pass>,
}

impl Pipeline {
    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    /// Parse `text`. Any unknown name fails the whole pipeline.
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let mut passes = Vec::new();
        parse_into(text, text, &mut passes)?;
        Ok(Self { passes })
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pass) in self.passes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", pass)?;
        }
        Ok(())
    }
}

fn malformed(text: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::Malformed {
        text: text.to_string(),
        reason: reason.into(),
    }
}

/// Split at commas that are not nested in `<>` or `()`.
fn split_top_level<'t>(full: &str, text: &'t str) -> Result<Vec<&'t str>, PipelineError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '<' => depth += 1,
            ')' | '>' => {
                depth -= 1;
                if depth < 0 {
                    return Err(malformed(full, format!("unbalanced '{}'", c)));
                }
            }
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(malformed(full, "unbalanced brackets"));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn parse_into(full: &str, text: &str, out: &mut Vec<Pass>) -> Result<(), PipelineError> {
    if text.is_empty() {
        return Err(malformed(full, "empty pipeline"));
    }
    for element in split_top_level(full, text)? {
        if element.is_empty() {
            return Err(malformed(full, "empty pass name"));
        }
        if let Some(inner) = element.strip_prefix("module(") {
            let inner = inner
                .strip_suffix(')')
                .ok_or_else(|| malformed(full, "unterminated 'module('"))?;
            parse_into(full, inner, out)?;
            continue;
        }

        let (name, params) = match element.split_once('<') {
            Some((name, rest)) => {
                let params = rest
                    .strip_suffix('>')
                    .ok_or_else(|| malformed(full, format!("trailing text after parameters of '{}'", name)))?;
                (name, Some(params))
            }
            None => (element, None),
        };
        out.push(parse_pass(name, params)?);
    }
    Ok(())
}

fn parse_pass(name: &str, params: Option<&str>) -> Result<Pass, PipelineError> {
    let invalid = |params: &str| PipelineError::InvalidParams {
        pass: name.to_string(),
        params: params.to_string(),
    };
    let no_params = |pass: Pass| match params {
        None => Ok(pass),
        Some(params) => Err(invalid(params)),
    };
    match name {
        "default" => {
            let params = params.unwrap_or_default();
            OptLevel::from_param(params)
                .map(Pass::Default)
                .ok_or_else(|| invalid(params))
        }
        "instrprof" => match params {
            None => Ok(Pass::InstrProf(LoweringOptions { atomic: false })),
            Some("atomic") => Ok(Pass::InstrProf(LoweringOptions { atomic: true })),
            Some(params) => Err(invalid(params)),
        },
        "globaldce" => no_params(Pass::GlobalDce),
        "strip-dead-prototypes" => no_params(Pass::StripDeadPrototypes),
        "verify" => no_params(Pass::Verify),
        "no-op-module" => no_params(Pass::NoOpModule),
        _ => Err(PipelineError::UnknownPass {
            name: name.to_string(),
        }),
    }
}

// ============================================================================
// Analyses
// ============================================================================

/// Counters of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    pub passes_run: usize,
    pub analyses_computed: usize,
    pub cache_hits: usize,
    pub invalidations: usize,
}

/// Symbols one function's body refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FunctionReferences(Vec<String>);

/// Function-level analyses, keyed by function name.
#[derive(Debug, Default)]
struct FunctionAnalysisCache {
    references: HashMap<String, FunctionReferences>,
}

/// Module-level analyses.
#[derive(Debug, Default)]
struct ModuleAnalysisCache {
    /// Edges from every function and global to the symbols it uses.
    reference_graph: Option<HashMap<String, Vec<String>>>,
}

/// Module and function analysis caches for one pipeline run.
///
/// The module cache reaches function analyses through a proxy, so the two
/// must be cross-registered before use and are invalidated together.
#[derive(Debug, Default)]
pub struct AnalysisCaches {
    module: ModuleAnalysisCache,
    function: FunctionAnalysisCache,
    cross_registered: bool,
    stats: RunStats,
}

impl AnalysisCaches {
    /// Fresh caches with proxies registered in both directions.
    pub fn new() -> Self {
        let mut caches = Self::default();
        caches.cross_register();
        caches
    }

    fn cross_register(&mut self) {
        self.cross_registered = true;
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    fn invalidate(&mut self, preserved: PreservedAnalyses) {
        if preserved == PreservedAnalyses::None {
            self.module.reference_graph = None;
            self.function.references.clear();
            self.stats.invalidations += 1;
        }
    }

    fn function_references(&mut self, module: &Module, function: &str) -> Vec<String> {
        if let Some(cached) = self.function.references.get(function) {
            self.stats.cache_hits += 1;
            return cached.0.clone();
        }
        let refs: Vec<String> = module
            .function(function)
            .map(|f| {
                f.instructions()
                    .iter()
                    .flat_map(Instruction::references)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.stats.analyses_computed += 1;
        self.function
            .references
            .insert(function.to_string(), FunctionReferences(refs.clone()));
        refs
    }

    fn reference_graph(&mut self, module: &Module) -> Result<HashMap<String, Vec<String>>, PipelineError> {
        if !self.cross_registered {
            return Err(PipelineError::Backend {
                message: "function analyses are not registered with the module cache".to_string(),
            });
        }
        if let Some(graph) = &self.module.reference_graph {
            self.stats.cache_hits += 1;
            return Ok(graph.clone());
        }
        let mut graph = HashMap::new();
        for function in module.functions() {
            let refs = self.function_references(module, &function.name);
            graph.insert(function.name.clone(), refs);
        }
        for global in module.globals() {
            let refs = global
                .object
                .initializer
                .references()
                .into_iter()
                .map(str::to_string)
                .collect();
            graph.insert(global.object.name.clone(), refs);
        }
        self.stats.analyses_computed += 1;
        self.module.reference_graph = Some(graph.clone());
        Ok(graph)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// [`PassBackend`] for [`Module`].
#[derive(Debug, Default)]
pub struct PassEngine {
    last_run: Cell<Option<RunStats>>,
}

impl PassEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics of the most recent [`PassBackend::run`].
    pub fn last_run(&self) -> Option<RunStats> {
        self.last_run.get()
    }
}

impl PassBackend<Module> for PassEngine {
    type Pipeline = Pipeline;

    fn capabilities(&self) -> HostCapabilities {
        IR_CAPABILITIES
    }

    fn build_pipeline(&self, lowering: Option<LoweringOptions>, passes: &str) -> Result<Pipeline, PipelineError> {
        let parsed = Pipeline::parse(passes)?;
        let mut pipeline = Pipeline::default();
        if let Some(options) = lowering {
            pipeline.passes.push(Pass::InstrProf(options));
        }
        pipeline.passes.extend(parsed.passes);
        Ok(pipeline)
    }

    fn run(&self, module: &mut Module, pipeline: Pipeline) -> Result<(), PipelineError> {
        let mut caches = AnalysisCaches::new();
        let result = pipeline
            .passes
            .iter()
            .try_for_each(|&pass| run_pass(pass, module, &mut caches));
        self.last_run.set(Some(caches.stats()));
        result
    }
}

fn run_pass(pass: Pass, module: &mut Module, caches: &mut AnalysisCaches) -> Result<(), PipelineError> {
    trace!(pass = %pass, module = %module.name, "running pass");
    caches.stats.passes_run += 1;
    let preserved = match pass {
        Pass::InstrProf(options) => lower_increments(module, options)?,
        Pass::GlobalDce => global_dce(module, caches)?,
        Pass::StripDeadPrototypes => strip_dead_prototypes(module),
        Pass::Default(OptLevel::O0) => PreservedAnalyses::All,
        Pass::Default(_) => {
            let dce = global_dce(module, caches)?;
            caches.invalidate(dce);
            strip_dead_prototypes(module)
        }
        Pass::Verify => {
            verify(module, caches)?;
            PreservedAnalyses::All
        }
        Pass::NoOpModule => PreservedAnalyses::All,
    };
    caches.invalidate(preserved);
    Ok(())
}

// ============================================================================
// Passes
// ============================================================================

struct PendingIncrement {
    function: usize,
    instruction: usize,
    name_var: String,
    function_hash: u64,
    num_counters: u32,
    index: u32,
}

/// Replace every increment call with an update of `__profc_<name>[index]`.
fn lower_increments(module: &mut Module, options: LoweringOptions) -> Result<PreservedAnalyses, PipelineError> {
    let mut pending = Vec::new();
    for (f, function) in module.functions().iter().enumerate() {
        for (i, inst) in function.instructions().iter().enumerate() {
            if let Instruction::Call {
                callee,
                increment: Some(call),
            } = inst
            {
                if callee == functions::INSTRPROF_INCREMENT {
                    pending.push(PendingIncrement {
                        function: f,
                        instruction: i,
                        name_var: call.name_var.clone(),
                        function_hash: call.function_hash,
                        num_counters: call.num_counters,
                        index: call.index,
                    });
                }
            }
        }
    }
    if pending.is_empty() {
        return Ok(PreservedAnalyses::All);
    }

    // name variable -> profiled function name, in first-use order
    let mut profiled: Vec<(String, String)> = Vec::new();
    for inc in &pending {
        if profiled.iter().any(|(var, _)| *var == inc.name_var) {
            continue;
        }
        let name = match module.global(&inc.name_var).map(|g| &g.object.initializer) {
            Some(ConstData::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            _ => {
                return Err(PipelineError::Backend {
                    message: format!("increment refers to missing name variable `{}`", inc.name_var),
                })
            }
        };

        let counters = counters_name(&name);
        let counters_object = DataObject::new(counters.clone(), ConstData::Counters(inc.num_counters))
            .with_linkage(Linkage::Private)
            .in_section(COUNTERS_SECTION)
            .aligned(8);
        let data_object = DataObject::new(
            data_name(&name),
            ConstData::Struct(vec![
                ConstData::U64(name_hash(name.as_bytes())),
                ConstData::U64(inc.function_hash),
                ConstData::SymbolRef(counters),
                ConstData::U32(inc.num_counters),
            ]),
        )
        .with_linkage(Linkage::Private)
        .in_section(DATA_SECTION)
        .aligned(8);
        module.add_associated_global(counters_object, &name);
        module.add_associated_global(data_object, &name);

        if function_hash(name.as_bytes()) != inc.function_hash {
            debug!(function = %name, "increment hash differs from the name-derived hash");
        }
        profiled.push((inc.name_var.clone(), name));
    }

    for inc in &pending {
        let Some((_, name)) = profiled.iter().find(|(var, _)| *var == inc.name_var) else {
            continue;
        };
        let counters = counters_name(name);
        let lowered = if options.atomic {
            Instruction::AtomicAdd {
                counters,
                index: inc.index,
            }
        } else {
            Instruction::LoadAddStore {
                counters,
                index: inc.index,
            }
        };
        if let Some(body) = module.functions_mut()[inc.function].body.as_mut() {
            body[inc.instruction] = lowered;
        }
    }

    // The name variables are folded into one blob: uleb raw length, uleb 0
    // (uncompressed), then the names separated by 0x01.
    let mut names: Vec<u8> = match module.global(symbols::PROFILE_NAMES).map(|g| &g.object.initializer) {
        Some(ConstData::Bytes(existing)) => existing.clone(),
        _ => Vec::new(),
    };
    let mut raw = Vec::new();
    for (i, (var, name)) in profiled.iter().enumerate() {
        if i > 0 {
            raw.push(0x01);
        }
        raw.extend_from_slice(name.as_bytes());
        module.remove_global(var);
    }
    write_uleb128(&mut names, raw.len() as u64);
    write_uleb128(&mut names, 0);
    names.extend_from_slice(&raw);
    module.upsert_global(
        DataObject::new(symbols::PROFILE_NAMES, ConstData::Bytes(names))
            .constant()
            .with_linkage(Linkage::Private)
            .in_section(NAMES_SECTION),
    );

    debug!(
        module = %module.name,
        increments = pending.len(),
        functions = profiled.len(),
        atomic = options.atomic,
        "lowered counter increments"
    );
    Ok(PreservedAnalyses::None)
}

fn is_discardable(linkage: Linkage) -> bool {
    linkage.is_local() || linkage == Linkage::LinkOnceOdr
}

/// Delete definitions nothing live refers to.
///
/// Roots are non-discardable symbols and, standing in for `llvm.used`,
/// unassociated globals placed in an explicit section. A global associated
/// with a function is live exactly when that function is.
fn global_dce(module: &mut Module, caches: &mut AnalysisCaches) -> Result<PreservedAnalyses, PipelineError> {
    let graph = caches.reference_graph(module)?;

    let mut associated: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut worklist: Vec<String> = Vec::new();
    for function in module.functions() {
        if function.is_declaration() || !is_discardable(function.linkage) {
            worklist.push(function.name.clone());
        }
    }
    for global in module.globals() {
        match &global.associated {
            Some(function) => associated
                .entry(function.as_str())
                .or_default()
                .push(global.object.name.as_str()),
            None => {
                if !is_discardable(global.object.linkage) || global.object.section.is_some() {
                    worklist.push(global.object.name.clone());
                }
            }
        }
    }

    let mut live: BTreeSet<String> = BTreeSet::new();
    while let Some(symbol) = worklist.pop() {
        if !live.insert(symbol.clone()) {
            continue;
        }
        if let Some(refs) = graph.get(&symbol) {
            worklist.extend(refs.iter().cloned());
        }
        if let Some(globals) = associated.get(symbol.as_str()) {
            worklist.extend(globals.iter().map(|g| g.to_string()));
        }
    }

    let before = module.functions().len() + module.globals().len();
    let dead_functions: Vec<String> = module
        .functions()
        .iter()
        .filter(|f| !live.contains(&f.name))
        .map(|f| f.name.clone())
        .collect();
    module.retain_functions(|f| live.contains(&f.name));
    module.retain_globals(|g| live.contains(&g.object.name));
    let removed = before - module.functions().len() - module.globals().len();

    if removed == 0 {
        return Ok(PreservedAnalyses::All);
    }
    debug!(module = %module.name, removed, functions = ?dead_functions, "globaldce removed dead symbols");
    Ok(PreservedAnalyses::None)
}

fn strip_dead_prototypes(module: &mut Module) -> PreservedAnalyses {
    let referenced = module.referenced_symbols();
    let before = module.functions().len();
    module.retain_functions(|f| !f.is_declaration() || referenced.contains(&f.name));
    if module.functions().len() == before {
        PreservedAnalyses::All
    } else {
        PreservedAnalyses::None
    }
}

fn verify(module: &Module, caches: &mut AnalysisCaches) -> Result<(), PipelineError> {
    let graph = caches.reference_graph(module)?;
    let fail = |message: String| Err(PipelineError::Verification { message });

    for (symbol, refs) in &graph {
        for target in refs {
            if !module.has_symbol(target) {
                return fail(format!("`{}` refers to undefined symbol `{}`", symbol, target));
            }
        }
    }
    for function in module.functions() {
        for inst in function.instructions() {
            if let Instruction::Call {
                callee,
                increment: Some(_),
            } = inst
            {
                if !module.has_intrinsic(callee) {
                    return fail(format!(
                        "increment in `{}` calls `{}`, which is not an intrinsic",
                        function.name, callee
                    ));
                }
            }
        }
        if function.body.as_ref().is_some_and(|b| b.last() != Some(&Instruction::Ret)) {
            return fail(format!("entry block of `{}` has no terminator", function.name));
        }
    }
    Ok(())
}
