use tracing::{debug, trace};

use crate::{
    error::{HotReloadError, HotReloadErrorKind},
    link::{
        graph::{Definition, Edge, EdgeKind, LinkGraph, Scope, SectionKind, SymbolKind},
        stage::{FirstDefinition, LinkPhase, LinkStage, Redefinition, StageContext},
    },
    mangling::{body_name, stub_ptr_name, strip_global_prefix},
};

/// Section holding the trampolines created by a graph.
pub const STUB_SECTION: &str = "__hotreload_stubs";
/// Section holding the indirection cells created by a graph.
pub const CELL_SECTION: &str = "__hotreload_cells";

/// Gives every externalized function a numbered body. A function seen for the first time also
/// gets an indirection cell initialized to that body and a trampoline, defined under the original
/// name, that jumps through the cell. A function that already has a cell is only scheduled for a
/// pointer update.
pub struct StubInstaller;

impl LinkStage for StubInstaller {
    fn name(&self) -> &'static str {
        "install-stubs"
    }

    fn phase(&self) -> LinkPhase {
        LinkPhase::PrePrune
    }

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        let externalized = cx.plan.externalized.clone();
        for ext in externalized {
            let name = strip_global_prefix(&ext.raw_name);
            let Some(info) = cx.definitions.get(name) else {
                let first = install_first(graph, cx, ext.raw_name, ext.body, ext.external);
                cx.plan.first.push(first);
                continue;
            };
            let index = info.redefinition_count + 1;
            graph.symbol_mut(ext.body).name = body_name(&ext.raw_name, index);
            trace!("{}: {} is body {}", graph.name(), ext.raw_name, index);
            cx.plan.redefinitions.push(Redefinition {
                raw_name: ext.raw_name,
                body: ext.body,
                index,
            });
        }
        Ok(())
    }
}

fn install_first(
    graph: &mut LinkGraph,
    cx: &StageContext<'_>,
    raw_name: String,
    body: crate::link::graph::SymbolId,
    external: crate::link::graph::SymbolId,
) -> FirstDefinition {
    graph.symbol_mut(body).name = body_name(&raw_name, 1);

    let cells = graph.ensure_section(CELL_SECTION, SectionKind::Data, 8);
    let offset = graph.section_mut(cells).append(&[0; 8], 8);
    let cell = graph.add_defined(
        stub_ptr_name(&raw_name),
        SymbolKind::Data,
        Scope::Local,
        cells,
        offset,
        8,
    );
    graph.section_mut(cells).edges.push(Edge {
        offset,
        kind: EdgeKind::Pointer64,
        target: body,
        addend: 0,
    });

    let trampoline = cx.emitter.trampoline();
    let stubs = graph.ensure_section(STUB_SECTION, SectionKind::Text, trampoline.align);
    let start = graph
        .section_mut(stubs)
        .append(&trampoline.code, trampoline.align);
    for (offset, kind, addend) in trampoline.cell_fixups {
        graph.section_mut(stubs).edges.push(Edge {
            offset: start + offset,
            kind,
            target: cell,
            addend,
        });
    }
    let sym = graph.symbol_mut(external);
    sym.definition = Definition::Defined {
        section: stubs,
        offset: start,
    };
    sym.kind = SymbolKind::Function;
    sym.scope = Scope::Default;
    sym.size = trampoline.code.len() as u64;
    trace!("{}: new stub for {}", graph.name(), raw_name);

    FirstDefinition {
        raw_name,
        body,
        cell,
        trampoline: external,
    }
}

/// Publishes the stub decisions once the graph is live: new cells enter the definition table and
/// every redefined function's cell is pointed at its new body. All addresses are checked before
/// the first cell is written, so a failure here leaves every existing stub untouched.
pub struct StubPointerCommit;

impl LinkStage for StubPointerCommit {
    fn name(&self) -> &'static str {
        "commit-stub-pointers"
    }

    fn phase(&self) -> LinkPhase {
        LinkPhase::PostFinalize
    }

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        let missing = |name: &str| -> HotReloadError {
            HotReloadErrorKind::MissingStubPointer {
                name: name.to_string(),
            }
            .into()
        };

        let mut firsts = vec![];
        for first in &cx.plan.first {
            let cell = graph
                .symbol_address(first.cell)
                .ok_or_else(|| missing(&first.raw_name))?;
            firsts.push((strip_global_prefix(&first.raw_name).to_string(), cell));
        }
        let mut writes = vec![];
        for redef in &cx.plan.redefinitions {
            let name = strip_global_prefix(&redef.raw_name);
            let info = cx
                .definitions
                .get(name)
                .ok_or_else(|| missing(&redef.raw_name))?;
            let body = graph
                .symbol_address(redef.body)
                .ok_or_else(|| missing(&redef.raw_name))?;
            writes.push((name.to_string(), info.ptr_address, body, redef.index));
        }

        for (name, cell) in firsts {
            cx.definitions.insert_first(&name, cell);
        }
        for (name, cell, body, index) in &writes {
            // Safety: cells are word-aligned slots in a live JIT mapping recorded at their first
            // definition, and nothing in Rust borrows them.
            unsafe { cx.memory.write_word(*cell, *body) };
            cx.definitions.record_redefinition(name, *index);
            debug!("rebound {} to body {} at {:#x}", name, index, body);
        }
        cx.plan.rebound = writes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        definitions::DefinitionTable,
        link::{
            arch::emitter_for,
            graph::{Arch, GraphState},
            stage::{Externalized, StubPlan},
            stages::testing::MapMemory,
        },
        objects::NativeObjectFile,
    };

    fn externalized_graph(name: &str) -> (LinkGraph, Externalized) {
        let mut g = LinkGraph::new("t.o", Arch::AArch64);
        let text = g.create_section(".text", SectionKind::Text, 4);
        g.section_mut(text).append(&[0; 8], 4);
        let body = g.add_defined(
            format!("{name}$impl"),
            SymbolKind::Function,
            Scope::Local,
            text,
            0,
            8,
        );
        let external = g.add_external(name);
        (
            g,
            Externalized {
                raw_name: name.to_string(),
                body,
                external,
            },
        )
    }

    #[test]
    fn first_definition_gets_cell_and_trampoline() {
        let (mut g, ext) = externalized_graph("kfun:f");
        let emitter = emitter_for(Arch::AArch64);
        let mut defs = DefinitionTable::new();
        let mem = MapMemory::default();
        let mut plan = StubPlan {
            externalized: vec![ext.clone()],
            ..Default::default()
        };
        let mut linked = NativeObjectFile::new();
        let mut cx = StageContext {
            epoch: 1,
            emitter: emitter.as_ref(),
            definitions: &mut defs,
            memory: &mem,
            plan: &mut plan,
            linked: &mut linked,
        };
        StubInstaller.run(&mut g, &mut cx).unwrap();

        assert_eq!(g.symbol(ext.body).name, "kfun:f$body_1");
        let first = &cx.plan.first[0];
        assert_eq!(g.symbol(first.cell).name, "kfun:f$stub_ptr");
        let tramp = g.symbol(ext.external);
        assert!(tramp.is_defined());
        assert_eq!(tramp.name, "kfun:f");
        assert_eq!(tramp.scope, Scope::Default);

        let cells = g.section_by_name(CELL_SECTION).unwrap();
        assert_eq!(g.section(cells).edges[0].target, ext.body);
        let stubs = g.section_by_name(STUB_SECTION).unwrap();
        assert!(g.section(stubs).edges.iter().all(|e| e.target == first.cell));
        assert!(cx.plan.redefinitions.is_empty());
    }

    #[test]
    fn redefinition_is_numbered_and_committed() {
        let (mut g, ext) = externalized_graph("kfun:f");
        let emitter = emitter_for(Arch::AArch64);
        let mut defs = DefinitionTable::new();
        defs.insert_first("kfun:f", 0x5000);
        let mem = MapMemory::default();
        let mut plan = StubPlan {
            externalized: vec![ext.clone()],
            ..Default::default()
        };
        let mut linked = NativeObjectFile::new();
        let mut cx = StageContext {
            epoch: 2,
            emitter: emitter.as_ref(),
            definitions: &mut defs,
            memory: &mem,
            plan: &mut plan,
            linked: &mut linked,
        };
        StubInstaller.run(&mut g, &mut cx).unwrap();
        assert_eq!(g.symbol(ext.body).name, "kfun:f$body_2");
        assert!(cx.plan.first.is_empty());
        assert!(g.section_by_name(STUB_SECTION).is_none());
        assert!(g.symbol(ext.external).is_external());

        let text = g.section_by_name(".text").unwrap();
        g.section_mut(text).address = Some(0x9000);
        g.advance(GraphState::Finalized);
        StubPointerCommit.run(&mut g, &mut cx).unwrap();

        assert_eq!(cx.plan.rebound, 1);
        assert_eq!(*mem.writes.lock().unwrap(), vec![(0x5000, 0x9000)]);
        assert_eq!(cx.definitions.get("kfun:f").unwrap().redefinition_count, 2);
    }

    #[test]
    fn commit_writes_nothing_when_a_cell_is_unknown() {
        let (mut g, ext) = externalized_graph("kfun:f");
        let (_, other) = externalized_graph("kfun:g");
        let emitter = emitter_for(Arch::AArch64);
        let mut defs = DefinitionTable::new();
        defs.insert_first("kfun:f", 0x5000);
        let mem = MapMemory::default();
        let mut plan = StubPlan {
            redefinitions: vec![
                Redefinition {
                    raw_name: ext.raw_name.clone(),
                    body: ext.body,
                    index: 2,
                },
                Redefinition {
                    raw_name: "kfun:g".into(),
                    body: other.body,
                    index: 2,
                },
            ],
            ..Default::default()
        };
        let mut linked = NativeObjectFile::new();
        let mut cx = StageContext {
            epoch: 2,
            emitter: emitter.as_ref(),
            definitions: &mut defs,
            memory: &mem,
            plan: &mut plan,
            linked: &mut linked,
        };
        let text = g.section_by_name(".text").unwrap();
        g.section_mut(text).address = Some(0x9000);
        g.advance(GraphState::Finalized);

        let err = StubPointerCommit.run(&mut g, &mut cx).unwrap_err();
        assert!(matches!(err.kind, HotReloadErrorKind::MissingStubPointer { .. }));
        assert!(mem.writes.lock().unwrap().is_empty());
        assert_eq!(cx.definitions.get("kfun:f").unwrap().redefinition_count, 1);
    }
}
