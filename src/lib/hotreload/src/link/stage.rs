//! Link pipeline stages.
//!
//! A [Pipeline] is an ordered list of named [LinkStage]s. Each stage declares the [LinkPhase] it
//! runs in, which fixes the graph state it can rely on: a `PrePrune` stage sees symbolic
//! sections with no addresses, a `PostFixup` stage sees relocated memory that is still writable,
//! and so on. Stages are kept in insertion order, and a pipeline refuses a stage that would run in
//! an earlier phase than the one before it, so the list reads top to bottom in execution order.
use std::fmt::Display;

use tracing::trace;

use super::{
    arch::TrampolineEmitter,
    graph::{GraphState, LinkGraph, SymbolId},
    memory::MemoryAccess,
};
use crate::{
    definitions::DefinitionTable,
    error::{HotReloadError, HotReloadErrorKind},
    objects::NativeObjectFile,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkPhase {
    /// Before dead sections are dropped. Names, sections and edges may be rewritten freely.
    PrePrune,
    /// Every section has an address; external symbols are not yet resolved.
    PostAllocation,
    /// Every edge has been applied; memory is still writable.
    PostFixup,
    /// Memory protections are final and the code may be called.
    PostFinalize,
}

impl LinkPhase {
    /// The graph state a stage of this phase may assume.
    pub fn requires(&self) -> GraphState {
        match self {
            LinkPhase::PrePrune => GraphState::Parsed,
            LinkPhase::PostAllocation => GraphState::Allocated,
            LinkPhase::PostFixup => GraphState::FixedUp,
            LinkPhase::PostFinalize => GraphState::Finalized,
        }
    }
}

impl Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkPhase::PrePrune => "pre-prune",
            LinkPhase::PostAllocation => "post-allocation",
            LinkPhase::PostFixup => "post-fixup",
            LinkPhase::PostFinalize => "post-finalize",
        };
        f.write_str(s)
    }
}

/// A function whose definition was moved to a private name and is reached through a stub.
#[derive(Clone, Debug)]
pub struct Externalized {
    /// The name as spelled in the object.
    pub raw_name: String,
    /// The renamed, local definition.
    pub body: SymbolId,
    /// The external symbol all references were moved to.
    pub external: SymbolId,
}

#[derive(Clone, Debug)]
pub struct FirstDefinition {
    pub raw_name: String,
    pub body: SymbolId,
    pub cell: SymbolId,
    pub trampoline: SymbolId,
}

#[derive(Clone, Debug)]
pub struct Redefinition {
    pub raw_name: String,
    pub body: SymbolId,
    pub index: u32,
}

/// What the stub stages decided for one graph; consumed by the commit stage and the linker.
#[derive(Clone, Debug, Default)]
pub struct StubPlan {
    pub externalized: Vec<Externalized>,
    pub first: Vec<FirstDefinition>,
    pub redefinitions: Vec<Redefinition>,
    /// Number of indirection cells that were pointed at a new body.
    pub rebound: usize,
}

impl StubPlan {
    pub fn is_trampoline(&self, id: SymbolId) -> bool {
        self.first.iter().any(|f| f.trampoline == id)
    }
}

/// Everything a stage may touch besides the graph itself.
pub struct StageContext<'a> {
    pub epoch: u64,
    pub emitter: &'a dyn TrampolineEmitter,
    pub definitions: &'a mut DefinitionTable,
    pub memory: &'a dyn MemoryAccess,
    pub plan: &'a mut StubPlan,
    /// Managed symbols provided by this graph, filled in as the link progresses.
    pub linked: &'a mut NativeObjectFile,
}

pub trait LinkStage: Send {
    fn name(&self) -> &'static str;

    fn phase(&self) -> LinkPhase;

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError>;

    /// Check the stage's postcondition after it ran.
    fn verify(&self, _graph: &LinkGraph, _cx: &StageContext<'_>) -> Result<(), HotReloadError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn LinkStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Fails if it runs in an earlier phase than the last stage.
    pub fn push(&mut self, stage: Box<dyn LinkStage>) -> Result<&mut Self, HotReloadError> {
        if let Some(last) = self.stages.last() {
            if stage.phase() < last.phase() {
                return Err(HotReloadErrorKind::StageOrder {
                    stage: stage.name(),
                    phase: stage.phase().to_string(),
                    previous: last.phase().to_string(),
                }
                .into());
            }
        }
        self.stages.push(stage);
        Ok(self)
    }

    pub fn with(mut self, stage: impl LinkStage + 'static) -> Result<Self, HotReloadError> {
        self.push(Box::new(stage))?;
        Ok(self)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage of `phase`, in order.
    pub(crate) fn run_phase(
        &mut self,
        phase: LinkPhase,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        graph.require(phase.requires())?;
        for stage in self.stages.iter_mut().filter(|s| s.phase() == phase) {
            trace!("{}: running stage {} ({})", graph.name(), stage.name(), phase);
            let name = stage.name();
            stage
                .run(graph, cx)
                .and_then(|_| stage.verify(graph, cx))
                .map_err(|e| e.context(HotReloadErrorKind::StageFailed { stage: name }))?;
        }
        Ok(())
    }
}
