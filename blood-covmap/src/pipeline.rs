//! Pipeline orchestration.
//!
//! ```text
//! Init ─(coverage)─> LoweringApplied ─> PipelineParsed ─> PipelineRun ─(coverage)─> MappingEmitted ─> Done
//!   └──────(no coverage)──────────────────┘      │
//!                                                └─ parse failure: construction error, nothing runs
//! ```
//!
//! The order is fixed. Increment intrinsics are lowered before any other
//! pass sees them, and records are emitted only after the last pass, so they
//! describe the counter arrays that actually survived.

use std::fmt;

use tracing::{debug, info_span, warn};

use crate::config::{CoverageOptions, PipelineConfig};
use crate::emit::{CoverageEmitter, EmissionSummary};
use crate::error::{CoverageError, Error};
use crate::host::{CoverageModule, HostCapabilities, LoweringOptions, PassBackend};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    LoweringApplied,
    PipelineParsed,
    PipelineRun,
    MappingEmitted,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Init => "init",
            PipelineState::LoweringApplied => "lowering-applied",
            PipelineState::PipelineParsed => "pipeline-parsed",
            PipelineState::PipelineRun => "pipeline-run",
            PipelineState::MappingEmitted => "mapping-emitted",
            PipelineState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Every state visited, in order, ending with [`PipelineState::Done`].
    pub states: Vec<PipelineState>,
    /// Lowering configuration, when coverage was requested.
    pub lowering: Option<LoweringOptions>,
    /// Emitted records, when coverage was requested.
    pub emission: Option<EmissionSummary>,
}

/// Runs lowering, the pass pipeline, and record emission over one module.
///
/// Create one per module being processed; it holds no state between runs.
#[derive(Debug)]
pub struct CoveragePipeline<'a, B> {
    backend: &'a B,
    config: &'a PipelineConfig,
}

struct Transitions {
    states: Vec<PipelineState>,
}

impl Transitions {
    fn new() -> Self {
        Self {
            states: vec![PipelineState::Init],
        }
    }

    fn enter(&mut self, state: PipelineState) {
        if let Some(from) = self.states.last() {
            debug!(from = %from, to = %state, "pipeline state transition");
        }
        self.states.push(state);
    }
}

impl<'a, B> CoveragePipeline<'a, B> {
    pub fn new(backend: &'a B, config: &'a PipelineConfig) -> Self {
        Self { backend, config }
    }

    pub fn run<M>(&self, module: &mut M) -> Result<PipelineReport, Error>
    where
        M: CoverageModule + ?Sized,
        B: PassBackend<M>,
    {
        let span = info_span!(
            "coverage_pipeline",
            passes = %self.config.passes,
            coverage = self.config.coverage_enabled()
        );
        let _enter = span.enter();

        let mut transitions = Transitions::new();

        let lowering = match &self.config.coverage {
            Some(coverage) => {
                let options = lowering_options(self.backend.capabilities(), coverage)?;
                transitions.enter(PipelineState::LoweringApplied);
                Some(options)
            }
            None => None,
        };

        let pipeline = self.backend.build_pipeline(lowering, &self.config.passes)?;
        transitions.enter(PipelineState::PipelineParsed);

        self.backend.run(module, pipeline)?;
        transitions.enter(PipelineState::PipelineRun);

        let emission = match &self.config.coverage {
            Some(coverage) => {
                let summary = CoverageEmitter::new(coverage).emit(module)?;
                transitions.enter(PipelineState::MappingEmitted);
                Some(summary)
            }
            None => None,
        };

        transitions.enter(PipelineState::Done);
        Ok(PipelineReport {
            states: transitions.states,
            lowering,
            emission,
        })
    }
}

/// Pick lowering options the host can honour.
///
/// Atomic updates fall back to plain load/add/store when the host cannot
/// lower atomically; a host without any lowering pass cannot do coverage.
fn lowering_options(capabilities: HostCapabilities, coverage: &CoverageOptions) -> Result<LoweringOptions, Error> {
    if !capabilities.lowering_pass {
        return Err(CoverageError::Host {
            message: format!("coverage needs increment lowering, host has {}", capabilities),
        }
        .into());
    }
    let atomic = coverage.atomic_counters && capabilities.atomic_lowering;
    if coverage.atomic_counters && !atomic {
        warn!("host cannot lower increments atomically; counters may race between threads");
    }
    Ok(LoweringOptions { atomic })
}

/// Run `passes` over `module`, with coverage when `coverage` is given.
pub fn run_passes_with_coverage<M, B>(
    module: &mut M,
    backend: &B,
    passes: &str,
    coverage: Option<CoverageOptions>,
) -> Result<PipelineReport, Error>
where
    M: CoverageModule + ?Sized,
    B: PassBackend<M>,
{
    let config = PipelineConfig {
        passes: passes.to_string(),
        coverage,
    };
    CoveragePipeline::new(backend, &config).run(module)
}
