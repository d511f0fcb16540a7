use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::{
    error::HotReloadError,
    link::{
        graph::LinkGraph,
        stage::{LinkPhase, LinkStage, StageContext},
    },
};

const SELECTOR_REFS: &str = "__objc_selrefs";
const SELECTOR_NAMES: &str = "__objc_methname";

/// Interns selector names with the native object runtime.
pub trait SelectorRegistry: Send {
    /// Return the unique selector value for `name`, or `None` if it cannot be registered.
    fn register(&self, name: &str) -> Option<usize>;
}

#[cfg(target_vendor = "apple")]
pub struct ObjcSelectorRegistry;

#[cfg(target_vendor = "apple")]
impl SelectorRegistry for ObjcSelectorRegistry {
    fn register(&self, name: &str) -> Option<usize> {
        #[link(name = "objc")]
        extern "C" {
            fn sel_registerName(name: *const libc::c_char) -> *const libc::c_void;
        }
        let name = std::ffi::CString::new(name).ok()?;
        let sel = unsafe { sel_registerName(name.as_ptr()) };
        (!sel.is_null()).then_some(sel as usize)
    }
}

/// Rewrites selector references to the runtime's interned selectors. JIT-loaded code is never
/// seen by the object runtime's image loader, so its references still point at private copies of
/// the selector strings.
pub struct SelectorFixup {
    registry: Box<dyn SelectorRegistry>,
}

impl SelectorFixup {
    pub fn new(registry: Box<dyn SelectorRegistry>) -> Self {
        Self { registry }
    }
}

impl LinkStage for SelectorFixup {
    fn name(&self) -> &'static str {
        "fixup-selectors"
    }

    fn phase(&self) -> LinkPhase {
        LinkPhase::PostFixup
    }

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        let Some(refs) = graph.section_by_name(SELECTOR_REFS) else {
            return Ok(());
        };

        let mut names: HashMap<usize, String> = HashMap::new();
        for id in graph
            .section_ids()
            .filter(|id| graph.section(*id).name == SELECTOR_NAMES)
        {
            let section = graph.section(id);
            let Some(base) = section.address else {
                continue;
            };
            let mut start = 0;
            for (i, b) in section.data.iter().enumerate() {
                if *b == 0 {
                    let name = String::from_utf8_lossy(&section.data[start..i]).into_owned();
                    names.insert(base + start, name);
                    start = i + 1;
                }
            }
        }

        let section = graph.section(refs);
        let Some(base) = section.address else {
            return Ok(());
        };
        let word = std::mem::size_of::<usize>() as u64;
        let mut fixed = 0;
        for offset in (0..section.size / word).map(|i| i * word) {
            let slot = base + offset as usize;
            let from_edge = section
                .edges
                .iter()
                .find(|e| e.offset == offset)
                .and_then(|e| {
                    graph
                        .symbol_address(e.target)
                        .map(|a| (a as i64 + e.addend) as usize)
                })
                .and_then(|a| names.get(&a).cloned());
            let name = from_edge.or_else(|| {
                // Safety: slot lies inside this graph's writable data.
                let value = unsafe { cx.memory.read_word(slot) };
                names
                    .get(&value)
                    .cloned()
                    .or_else(|| unsafe { cx.memory.read_c_string(value) })
            });
            let Some(name) = name else {
                warn!("{}: leaving selector reference at {:#x} unmodified", graph.name(), slot);
                continue;
            };
            let Some(selector) = self.registry.register(&name) else {
                warn!("{}: failed to register selector '{}'", graph.name(), name);
                continue;
            };
            // Safety: as above; the section is not yet write-protected.
            unsafe { cx.memory.write_word(slot, selector) };
            trace!("selector {} -> {:#x}", name, selector);
            fixed += 1;
        }
        debug!("{}: fixed {} selector references", graph.name(), fixed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        definitions::DefinitionTable,
        link::{
            arch::emitter_for,
            graph::{Arch, Edge, EdgeKind, GraphState, Scope, SectionKind, SymbolKind},
            stage::StubPlan,
            stages::testing::MapMemory,
        },
        objects::NativeObjectFile,
    };

    #[derive(Default)]
    struct Interner(Mutex<Vec<String>>);

    impl SelectorRegistry for Interner {
        fn register(&self, name: &str) -> Option<usize> {
            let mut names = self.0.lock().unwrap();
            let idx = match names.iter().position(|n| n == name) {
                Some(i) => i,
                None => {
                    names.push(name.to_string());
                    names.len() - 1
                }
            };
            Some(0xa000 + idx * 8)
        }
    }

    #[test]
    fn resolves_by_edge_value_and_leaves_unknowns() {
        let mut g = LinkGraph::new("t.o", Arch::AArch64);
        let methnames = g.create_section(SELECTOR_NAMES, SectionKind::ReadOnly, 1);
        g.section_mut(methnames).append(b"init\0count\0", 1);
        let init = g.add_defined("l_init", SymbolKind::Data, Scope::Local, methnames, 0, 5);
        let refs = g.create_section(SELECTOR_REFS, SectionKind::Data, 8);
        g.section_mut(refs).append(&[0; 24], 8);
        g.section_mut(refs).edges.push(Edge {
            offset: 0,
            kind: EdgeKind::Pointer64,
            target: init,
            addend: 0,
        });
        g.section_mut(methnames).address = Some(0x1000);
        g.section_mut(refs).address = Some(0x2000);
        g.advance(GraphState::FixedUp);

        let mem = MapMemory::default();
        // Second slot: no edge, relocated value points at "count".
        mem.words.lock().unwrap().insert(0x2008, 0x1005);
        // Third slot: points at nothing we know.
        mem.words.lock().unwrap().insert(0x2010, 0x7777);

        let emitter = emitter_for(Arch::AArch64);
        let mut defs = DefinitionTable::new();
        let mut plan = StubPlan::default();
        let mut linked = NativeObjectFile::new();
        let mut cx = StageContext {
            epoch: 1,
            emitter: emitter.as_ref(),
            definitions: &mut defs,
            memory: &mem,
            plan: &mut plan,
            linked: &mut linked,
        };
        let mut stage = SelectorFixup::new(Box::new(Interner::default()));
        stage.run(&mut g, &mut cx).unwrap();

        let words = mem.words.lock().unwrap();
        assert_eq!(words[&0x2000], 0xa000);
        assert_eq!(words[&0x2008], 0xa008);
        assert_eq!(words[&0x2010], 0x7777);
    }
}
