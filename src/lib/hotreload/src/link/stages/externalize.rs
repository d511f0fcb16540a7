use tracing::trace;

use crate::{
    error::{HotReloadError, HotReloadErrorKind},
    link::{
        graph::{Definition, LinkGraph, Scope, SectionKind, SymbolKind},
        stage::{Externalized, LinkPhase, LinkStage, StageContext},
    },
    mangling::{classify_raw, impl_name, SymbolClass},
};

/// Moves every managed function definition to a private `$impl` name and points all references
/// at an external symbol carrying the original name, so that every call, including calls inside
/// the object itself, goes through the function's stub.
pub struct SymbolExternalizer;

fn is_reloadable_function(graph: &LinkGraph, id: crate::link::graph::SymbolId) -> bool {
    let sym = graph.symbol(id);
    let Definition::Defined { section, .. } = sym.definition else {
        return false;
    };
    sym.kind != SymbolKind::Section
        && graph.section(section).kind == SectionKind::Text
        && classify_raw(&sym.name) == SymbolClass::Function
}

impl LinkStage for SymbolExternalizer {
    fn name(&self) -> &'static str {
        "externalize-functions"
    }

    fn phase(&self) -> LinkPhase {
        LinkPhase::PrePrune
    }

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        let bodies: Vec<_> = graph
            .symbol_ids()
            .filter(|id| is_reloadable_function(graph, *id))
            .collect();
        for body in bodies {
            let raw_name = graph.symbol(body).name.clone();
            let sym = graph.symbol_mut(body);
            sym.name = impl_name(&raw_name);
            sym.scope = Scope::Local;

            let external = graph.add_external(&raw_name);
            graph.symbol_mut(external).kind = SymbolKind::Function;
            let moved = graph.retarget_edges(body, external);
            trace!(
                "{}: externalized {} ({} references)",
                graph.name(),
                raw_name,
                moved
            );
            cx.plan.externalized.push(Externalized {
                raw_name,
                body,
                external,
            });
        }
        Ok(())
    }

    fn verify(&self, graph: &LinkGraph, _cx: &StageContext<'_>) -> Result<(), HotReloadError> {
        match graph
            .symbol_ids()
            .find(|id| is_reloadable_function(graph, *id))
        {
            Some(id) => Err(HotReloadErrorKind::LinkFailure {
                object: format!(
                    "{} (function '{}' kept its public definition)",
                    graph.name(),
                    graph.symbol(id).name
                ),
            }
            .into()),
            None => Ok(()),
        }
    }
}
