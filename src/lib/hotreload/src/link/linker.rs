//! Drives a link graph from parsed object to live code.
//!
//! Materialization runs in a fixed order: pre-prune stages, pruning, GOT and PLT construction,
//! allocation, post-allocation stages, external resolution, fixups, post-fixup stages,
//! finalization, post-finalize stages, and finally publication of the new library's symbols.
//! A failure anywhere before publication discards the library and its memory.
use std::collections::{BTreeSet, HashMap};

use tracing::{debug, debug_span, info, trace};

use super::{
    arch::{apply_fixup, host_emitter, TrampolineEmitter},
    fallback::WeakFallbackGenerator,
    graph::{
        Edge, EdgeKind, GraphState, LinkGraph, Linkage, Scope, SectionKind, SymbolId, SymbolKind,
    },
    memory::{JitMemory, MemoryAccess, ProcessMemory},
    session::{DylibId, JitSession, LookupFlags},
    stage::{Externalized, LinkPhase, Pipeline, StageContext, StubPlan},
    stages::{standard_pipeline, StubInstaller, StubPointerCommit},
};
use crate::{
    config::ReloadConfig,
    definitions::DefinitionTable,
    error::{HotReloadError, HotReloadErrorKind},
    mangling::{add_global_prefix, impl_name},
    objects::NativeObjectFile,
};

const GOT_SECTION: &str = "__hotreload_got";
const PLT_SECTION: &str = "__hotreload_plt";

/// The outcome of one successful link.
#[derive(Debug)]
pub struct LinkedObject {
    pub dylib: DylibId,
    /// Managed functions and classes the object defines, at their final addresses.
    pub symbols: NativeObjectFile,
    /// Functions whose stub now points at a new body.
    pub rebound: usize,
    /// Functions that got a stub for the first time.
    pub new_stubs: usize,
}

#[derive(Clone, Copy)]
enum PipelineKind {
    Object,
    Redirect,
}

pub struct JitLinker {
    session: JitSession,
    object_pipeline: Pipeline,
    redirect_pipeline: Pipeline,
    emitter: Box<dyn TrampolineEmitter>,
    definitions: DefinitionTable,
    memory: Box<dyn MemoryAccess>,
}

impl JitLinker {
    pub fn new(
        pipeline: Pipeline,
        emitter: Box<dyn TrampolineEmitter>,
        fallback: WeakFallbackGenerator,
    ) -> Result<Self, HotReloadError> {
        Ok(Self {
            session: JitSession::new(fallback),
            object_pipeline: pipeline,
            redirect_pipeline: Pipeline::new()
                .with(StubInstaller)?
                .with(StubPointerCommit)?,
            emitter,
            definitions: DefinitionTable::new(),
            memory: Box::new(ProcessMemory),
        })
    }

    /// A linker for the machine we are running on, using the standard pipeline.
    pub fn for_host(config: &ReloadConfig) -> Result<Self, HotReloadError> {
        let emitter = host_emitter().ok_or_else(|| HotReloadErrorKind::UnsupportedArchitecture {
            arch: std::env::consts::ARCH.to_string(),
        })?;
        Self::new(
            standard_pipeline()?,
            emitter,
            WeakFallbackGenerator::new(config.weak_fallbacks.iter().cloned()),
        )
    }

    pub fn session(&self) -> &JitSession {
        &self.session
    }

    pub fn definitions(&self) -> &DefinitionTable {
        &self.definitions
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.object_pipeline
    }

    /// Find a symbol (as spelled in object files) the way a newly linked object would.
    pub fn lookup(&self, raw_name: &str) -> Option<usize> {
        self.session.lookup_global(raw_name)
    }

    /// Parse a relocatable object and link it into a new JIT library.
    pub fn link_object(
        &mut self,
        name: &str,
        bytes: &[u8],
        epoch: u64,
    ) -> Result<LinkedObject, HotReloadError> {
        let graph = LinkGraph::from_object(name, bytes).map_err(|e| {
            e.context(HotReloadErrorKind::LinkFailure {
                object: name.to_string(),
            })
        })?;
        self.link_graph(graph, epoch)
    }

    /// Link an already built graph through the standard pipeline.
    pub fn link_graph(
        &mut self,
        mut graph: LinkGraph,
        epoch: u64,
    ) -> Result<LinkedObject, HotReloadError> {
        self.link_with(&mut graph, epoch, PipelineKind::Object, StubPlan::default())
    }

    /// Route managed functions that already live in the process (for example in a freshly opened
    /// shared library) through stubs. Functions that already have a stub are rebound to the given
    /// address; the rest get a new stub. `functions` pairs unprefixed names with addresses.
    pub fn redirect_functions(
        &mut self,
        name: &str,
        functions: &NativeObjectFile,
        epoch: u64,
    ) -> Result<LinkedObject, HotReloadError> {
        let mut graph = LinkGraph::new(format!("{name} (stubs)"), self.emitter.arch());
        let mut plan = StubPlan::default();
        for (function, address) in functions.functions() {
            let Some(address) = address else {
                continue;
            };
            let raw_name = add_global_prefix(function);
            let body = graph.add_absolute(impl_name(&raw_name), address);
            let external = graph.add_external(&raw_name);
            plan.externalized.push(Externalized {
                raw_name,
                body,
                external,
            });
        }
        let mut linked = self.link_with(&mut graph, epoch, PipelineKind::Redirect, plan)?;
        linked.symbols = functions.clone();
        Ok(linked)
    }

    fn link_with(
        &mut self,
        graph: &mut LinkGraph,
        epoch: u64,
        kind: PipelineKind,
        plan: StubPlan,
    ) -> Result<LinkedObject, HotReloadError> {
        let _span = debug_span!("link", object = graph.name(), epoch).entered();
        if graph.arch() != self.emitter.arch() {
            return Err(HotReloadErrorKind::UnsupportedArchitecture {
                arch: format!("{:?}", graph.arch()),
            }
            .into());
        }
        let dylib = self.session.create_dylib(graph.name(), epoch);
        match self.materialize(graph, dylib, epoch, kind, plan) {
            Ok(linked) => {
                info!(
                    "linked {}: {} new stubs, {} rebound",
                    graph.name(),
                    linked.new_stubs,
                    linked.rebound
                );
                Ok(linked)
            }
            Err(e) => {
                self.session.discard(dylib);
                Err(e.context(HotReloadErrorKind::LinkFailure {
                    object: graph.name().to_string(),
                }))
            }
        }
    }

    fn materialize(
        &mut self,
        graph: &mut LinkGraph,
        dylib: DylibId,
        epoch: u64,
        kind: PipelineKind,
        mut plan: StubPlan,
    ) -> Result<LinkedObject, HotReloadError> {
        let Self {
            session,
            object_pipeline,
            redirect_pipeline,
            emitter,
            definitions,
            memory,
        } = self;
        let pipeline = match kind {
            PipelineKind::Object => object_pipeline,
            PipelineKind::Redirect => redirect_pipeline,
        };
        let mut linked = NativeObjectFile::new();
        let mut cx = StageContext {
            epoch,
            emitter: emitter.as_ref(),
            definitions,
            memory: memory.as_ref(),
            plan: &mut plan,
            linked: &mut linked,
        };

        pipeline.run_phase(LinkPhase::PrePrune, graph, &mut cx)?;
        prune(graph);
        build_indirections(graph, emitter.as_ref());
        let mut mem = JitMemory::allocate(graph)?;
        pipeline.run_phase(LinkPhase::PostAllocation, graph, &mut cx)?;
        resolve_externals(graph, session, dylib)?;
        apply_fixups(graph, &mut mem)?;
        graph.advance(GraphState::FixedUp);
        pipeline.run_phase(LinkPhase::PostFixup, graph, &mut cx)?;
        mem.finalize(graph)?;
        pipeline.run_phase(LinkPhase::PostFinalize, graph, &mut cx)?;

        let stubs = session.stubs();
        for first in &plan.first {
            if let Some(address) = graph.symbol_address(first.trampoline) {
                session.define(stubs, &first.raw_name, address);
            }
        }
        for id in graph.symbol_ids() {
            let sym = graph.symbol(id);
            if !sym.is_defined() || sym.scope == Scope::Local || plan.is_trampoline(id) {
                continue;
            }
            if let Some(address) = graph.symbol_address(id) {
                session.define(dylib, &sym.name, address);
            }
        }
        session.attach_memory(dylib, mem);

        Ok(LinkedObject {
            dylib,
            symbols: linked,
            rebound: plan.rebound,
            new_stubs: plan.first.len(),
        })
    }
}

/// Drop sections that never get loaded.
fn prune(graph: &mut LinkGraph) {
    let dead: Vec<_> = graph
        .section_ids()
        .filter(|id| !graph.section(*id).kind.is_allocated())
        .collect();
    for id in dead {
        let symbols = graph.remove_section(id);
        trace!(
            "{}: pruned {} ({} symbols)",
            graph.name(),
            graph.section(id).name,
            symbols
        );
    }
    graph.advance(GraphState::Pruned);
}

/// Give every GOT-relative edge a pointer slot and every branch to an external symbol a PLT
/// trampoline, rewriting the edges to target them.
fn build_indirections(graph: &mut LinkGraph, emitter: &dyn TrampolineEmitter) {
    let mut got: HashMap<SymbolId, SymbolId> = HashMap::new();
    let mut plt: HashMap<SymbolId, SymbolId> = HashMap::new();
    let sections: Vec<_> = graph.section_ids().collect();
    for id in sections {
        for i in 0..graph.section(id).edges.len() {
            let edge = graph.section(id).edges[i];
            let lowered = match edge.kind {
                EdgeKind::GotDelta32 => Some(EdgeKind::Delta32),
                EdgeKind::GotPage21 => Some(EdgeKind::Page21),
                EdgeKind::GotPageOffset12 => Some(EdgeKind::PageOffset12 { shift: 3 }),
                _ => None,
            };
            let rewritten = if let Some(kind) = lowered {
                Some((kind, got_entry(graph, &mut got, edge.target)))
            } else if edge.kind.is_branch() && graph.symbol(edge.target).is_external() {
                Some((edge.kind, plt_entry(graph, emitter, &mut got, &mut plt, edge.target)))
            } else {
                None
            };
            if let Some((kind, target)) = rewritten {
                let edge = &mut graph.section_mut(id).edges[i];
                edge.kind = kind;
                edge.target = target;
            }
        }
    }
    if !got.is_empty() || !plt.is_empty() {
        debug!(
            "{}: {} GOT entries, {} PLT entries",
            graph.name(),
            got.len(),
            plt.len()
        );
    }
}

fn got_entry(
    graph: &mut LinkGraph,
    got: &mut HashMap<SymbolId, SymbolId>,
    target: SymbolId,
) -> SymbolId {
    if let Some(entry) = got.get(&target) {
        return *entry;
    }
    let section = graph.ensure_section(GOT_SECTION, SectionKind::Data, 8);
    let offset = graph.section_mut(section).append(&[0; 8], 8);
    graph.section_mut(section).edges.push(Edge {
        offset,
        kind: EdgeKind::Pointer64,
        target,
        addend: 0,
    });
    let name = format!("{}$got", graph.symbol(target).name);
    let entry = graph.add_defined(name, SymbolKind::Data, Scope::Local, section, offset, 8);
    got.insert(target, entry);
    entry
}

fn plt_entry(
    graph: &mut LinkGraph,
    emitter: &dyn TrampolineEmitter,
    got: &mut HashMap<SymbolId, SymbolId>,
    plt: &mut HashMap<SymbolId, SymbolId>,
    target: SymbolId,
) -> SymbolId {
    if let Some(entry) = plt.get(&target) {
        return *entry;
    }
    let slot = got_entry(graph, got, target);
    let trampoline = emitter.trampoline();
    let section = graph.ensure_section(PLT_SECTION, SectionKind::Text, trampoline.align);
    let start = graph
        .section_mut(section)
        .append(&trampoline.code, trampoline.align);
    for (offset, kind, addend) in trampoline.cell_fixups {
        graph.section_mut(section).edges.push(Edge {
            offset: start + offset,
            kind,
            target: slot,
            addend,
        });
    }
    let name = format!("{}$plt", graph.symbol(target).name);
    let entry = graph.add_defined(
        name,
        SymbolKind::Function,
        Scope::Local,
        section,
        start,
        trampoline.code.len() as u64,
    );
    plt.insert(target, entry);
    entry
}

/// Bind every external symbol some edge refers to. Unresolvable weak references bind to zero.
fn resolve_externals(
    graph: &mut LinkGraph,
    session: &JitSession,
    dylib: DylibId,
) -> Result<(), HotReloadError> {
    let referenced: BTreeSet<SymbolId> = graph
        .section_ids()
        .flat_map(|id| graph.section(id).edges.iter().map(|e| e.target))
        .filter(|target| graph.symbol(*target).is_external())
        .collect();

    let object = graph.name().to_string();
    let results = referenced.into_iter().map(|id| {
        let sym = graph.symbol(id);
        let flags = LookupFlags::SKIP_SELF | LookupFlags::ALLOW_FALLBACK;
        match session.lookup(dylib, &sym.name, flags) {
            Some(address) => Ok((id, address)),
            None if sym.linkage == Linkage::Weak => Ok((id, 0)),
            None => Err(HotReloadError::from(HotReloadErrorKind::SymbolUnresolved {
                name: sym.name.clone(),
                object: object.clone(),
            })),
        }
    });
    let resolved = HotReloadError::collect(
        HotReloadErrorKind::LinkFailure {
            object: object.clone(),
        },
        results,
    )?;
    for (id, address) in resolved {
        trace!("{}: {} -> {:#x}", object, graph.symbol(id).name, address);
        graph.symbol_mut(id).resolved = Some(address);
    }
    Ok(())
}

fn apply_fixups(graph: &LinkGraph, mem: &mut JitMemory) -> Result<(), HotReloadError> {
    let arch = graph.arch();
    let mut results = vec![];
    for id in graph.section_ids() {
        let section = graph.section(id);
        let Some(base) = section.address else {
            continue;
        };
        for edge in &section.edges {
            results.push(apply_edge(graph, mem, arch, base, section.size, edge));
        }
    }
    HotReloadError::collect(
        HotReloadErrorKind::LinkFailure {
            object: graph.name().to_string(),
        },
        results,
    )?;
    Ok(())
}

fn apply_edge(
    graph: &LinkGraph,
    mem: &mut JitMemory,
    arch: super::graph::Arch,
    base: usize,
    size: u64,
    edge: &Edge,
) -> Result<(), HotReloadError> {
    let sym = graph.symbol(edge.target);
    let target = graph.symbol_address(edge.target).ok_or_else(|| {
        HotReloadError::from(HotReloadErrorKind::SymbolUnresolved {
            name: sym.name.clone(),
            object: graph.name().to_string(),
        })
    })?;
    let place = base + edge.offset as usize;
    let len = size.saturating_sub(edge.offset).min(8) as usize;
    let loc = mem.bytes_mut(place, len).ok_or_else(|| {
        HotReloadError::from(HotReloadErrorKind::FixupOutOfRange {
            kind: edge.kind.to_string(),
            place,
            target,
        })
    })?;
    let value = (target as i64).wrapping_add(edge.addend) as u64;
    apply_fixup(arch, edge.kind, loc, place as u64, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{arch::emitter_for, graph::Arch};

    fn graph_with_calls() -> (LinkGraph, SymbolId) {
        let mut g = LinkGraph::new("t.o", Arch::X86_64);
        let text = g.create_section(".text", SectionKind::Text, 16);
        g.section_mut(text).append(&[0xe8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0, 0xc3], 1);
        let ext = g.add_external("puts");
        for offset in [1, 6] {
            g.section_mut(text).edges.push(Edge {
                offset,
                kind: EdgeKind::Branch32,
                target: ext,
                addend: -4,
            });
        }
        let dbg = g.create_section(".debug_info", SectionKind::Metadata, 1);
        g.section_mut(dbg).append(&[0; 8], 1);
        (g, ext)
    }

    #[test]
    fn external_branches_share_one_plt_entry() {
        let (mut g, ext) = graph_with_calls();
        prune(&mut g);
        assert!(g.section_by_name(".debug_info").is_none());

        let emitter = emitter_for(Arch::X86_64);
        build_indirections(&mut g, emitter.as_ref());
        let text = g.section_by_name(".text").unwrap();
        let targets: Vec<_> = g.section(text).edges.iter().map(|e| e.target).collect();
        assert_eq!(targets[0], targets[1]);
        assert_eq!(g.symbol(targets[0]).name, "puts$plt");

        let got = g.section_by_name(GOT_SECTION).unwrap();
        assert_eq!(g.section(got).edges[0].target, ext);
        assert_eq!(g.section(got).size, 8);
    }

    #[test]
    fn got_edges_are_lowered() {
        let mut g = LinkGraph::new("t.o", Arch::AArch64);
        let text = g.create_section(".text", SectionKind::Text, 4);
        g.section_mut(text).append(&[0; 8], 4);
        let ext = g.add_external("kclass:Foo");
        g.section_mut(text).edges.push(Edge {
            offset: 0,
            kind: EdgeKind::GotPage21,
            target: ext,
            addend: 0,
        });
        g.section_mut(text).edges.push(Edge {
            offset: 4,
            kind: EdgeKind::GotPageOffset12,
            target: ext,
            addend: 0,
        });
        prune(&mut g);
        build_indirections(&mut g, emitter_for(Arch::AArch64).as_ref());
        let edges = &g.section(text).edges;
        assert_eq!(edges[0].kind, EdgeKind::Page21);
        assert_eq!(edges[1].kind, EdgeKind::PageOffset12 { shift: 3 });
        assert_eq!(edges[0].target, edges[1].target);
        assert_eq!(g.symbol(edges[0].target).name, "kclass:Foo$got");
    }

    #[test]
    fn unresolved_strong_symbols_are_all_reported() {
        let mut g = LinkGraph::new("t.o", Arch::X86_64);
        let data = g.create_section(".data", SectionKind::Data, 8);
        g.section_mut(data).append(&[0; 24], 8);
        let a = g.add_external("kfun:missing_a");
        let b = g.add_external("kfun:missing_b");
        let w = g.add_external("maybe_there");
        g.symbol_mut(w).linkage = Linkage::Weak;
        for (offset, target) in [(0, a), (8, b), (16, w)] {
            g.section_mut(data).edges.push(Edge {
                offset,
                kind: EdgeKind::Pointer64,
                target,
                addend: 0,
            });
        }
        let mut session = JitSession::new(WeakFallbackGenerator::default());
        let dylib = session.create_dylib("t.o", 1);
        let err = resolve_externals(&mut g, &session, dylib).unwrap_err();
        assert!(matches!(err.kind, HotReloadErrorKind::LinkFailure { .. }));
        assert_eq!(err.related.len(), 2);
        assert_eq!(g.symbol(w).resolved, None);
    }
}
