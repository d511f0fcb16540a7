use tracing::debug;

use crate::{
    error::HotReloadError,
    link::{
        graph::LinkGraph,
        stage::{LinkPhase, LinkStage, StageContext},
    },
    mangling::{split_body_name, strip_global_prefix},
};

/// Records the final address of every managed function and class the graph defines. Function
/// bodies are recorded under their original names; stubs and platform symbols are skipped.
pub struct ObjectListener;

impl LinkStage for ObjectListener {
    fn name(&self) -> &'static str {
        "record-symbols"
    }

    fn phase(&self) -> LinkPhase {
        LinkPhase::PostFinalize
    }

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        for id in graph.symbol_ids() {
            let sym = graph.symbol(id);
            if !sym.is_defined() || cx.plan.is_trampoline(id) {
                continue;
            }
            let address = graph.symbol_address(id);
            let name = strip_global_prefix(&sym.name);
            match split_body_name(name) {
                Some((original, _)) => cx.linked.insert_function(original, address),
                None => {
                    cx.linked.record(name, address);
                }
            }
        }
        debug!(
            "{}: recorded {} functions and {} classes",
            graph.name(),
            cx.linked.functions().count(),
            cx.linked.classes().count()
        );
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
            graph::{Arch, GraphState, Scope, SectionKind, SymbolKind},
            stage::{FirstDefinition, StubPlan},
            stages::testing::MapMemory,
        },
        mangling::add_global_prefix,
        objects::NativeObjectFile,
    };

    #[test]
    fn records_bodies_under_original_names() {
        let mut g = LinkGraph::new("t.o", Arch::X86_64);
        let text = g.create_section(".text", SectionKind::Text, 16);
        g.section_mut(text).append(&[0; 64], 1);
        let data = g.create_section(".data", SectionKind::Data, 8);
        g.section_mut(data).append(&[0; 64], 8);
        let body = add_global_prefix("kfun:f$body_3");
        g.add_defined(body, SymbolKind::Function, Scope::Local, text, 0, 8);
        let tramp = g.add_defined(
            add_global_prefix("kfun:g"),
            SymbolKind::Function,
            Scope::Default,
            text,
            32,
            8,
        );
        g.add_defined(
            add_global_prefix("kclass:Foo"),
            SymbolKind::Data,
            Scope::Default,
            data,
            16,
            8,
        );
        g.add_defined(
            add_global_prefix("kclass:platform.darwin.NSObject"),
            SymbolKind::Data,
            Scope::Default,
            data,
            24,
            8,
        );
        g.section_mut(text).address = Some(0x1000);
        g.section_mut(data).address = Some(0x2000);
        g.advance(GraphState::Finalized);

        let emitter = emitter_for(Arch::X86_64);
        let mut defs = DefinitionTable::new();
        let mem = MapMemory::default();
        let mut plan = StubPlan::default();
        plan.first.push(FirstDefinition {
            raw_name: "kfun:g".into(),
            body: tramp,
            cell: tramp,
            trampoline: tramp,
        });
        let mut linked = NativeObjectFile::new();
        let mut cx = StageContext {
            epoch: 1,
            emitter: emitter.as_ref(),
            definitions: &mut defs,
            memory: &mem,
            plan: &mut plan,
            linked: &mut linked,
        };
        ObjectListener.run(&mut g, &mut cx).unwrap();

        assert_eq!(linked.function("kfun:f"), Some(0x1000));
        assert_eq!(linked.function("kfun:g"), None);
        assert_eq!(linked.class("kclass:Foo"), Some(0x2010));
        assert_eq!(linked.classes().count(), 1);
    }
}
