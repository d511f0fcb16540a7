//! The set of JIT libraries in the process and the symbol search order between them.
//!
//! Every successfully linked object becomes a JIT library. Libraries form a small dependency
//! graph: each new library depends on the `stubs` library first, then on every earlier JIT
//! library (newest first), and finally on the host process. Edge weights record that priority, so
//! a symbol redefined by several reloads always binds to its newest definition.
use std::{collections::HashMap, ffi::CString};

use petgraph::{graph::NodeIndex, stable_graph::StableDiGraph, visit::EdgeRef, Direction};
use tracing::{debug, trace};

use super::{fallback::WeakFallbackGenerator, memory::JitMemory};
use crate::mangling::strip_global_prefix;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    /// Options for symbol lookup.
    pub struct LookupFlags : u32 {
        /// Don't look in the starting library itself.
        const SKIP_SELF = 1;
        /// Don't look through the starting library's dependencies.
        const SKIP_DEPS = 2;
        /// Don't ask the host process.
        const SKIP_PROCESS = 4;
        /// Allow the weak fallback generator to supply a definition.
        const ALLOW_FALLBACK = 8;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DylibId(NodeIndex);

pub struct JitDylib {
    name: String,
    epoch: u64,
    symbols: HashMap<String, usize>,
    memory: Vec<JitMemory>,
}

impl JitDylib {
    fn new(name: &str, epoch: u64) -> Self {
        Self {
            name: name.to_string(),
            epoch,
            symbols: HashMap::new(),
            memory: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols.iter().map(|(n, a)| (n.as_str(), *a))
    }
}

enum SessionNode {
    Jit(JitDylib),
    Process,
}

pub struct JitSession {
    dylibs: StableDiGraph<SessionNode, u32>,
    stubs: NodeIndex,
    process: NodeIndex,
    /// JIT libraries other than `stubs`, oldest first.
    order: Vec<NodeIndex>,
    fallback: WeakFallbackGenerator,
}

impl JitSession {
    pub fn new(fallback: WeakFallbackGenerator) -> Self {
        let mut dylibs = StableDiGraph::new();
        let stubs = dylibs.add_node(SessionNode::Jit(JitDylib::new("stubs", 0)));
        let process = dylibs.add_node(SessionNode::Process);
        Self {
            dylibs,
            stubs,
            process,
            order: vec![],
            fallback,
        }
    }

    pub fn stubs(&self) -> DylibId {
        DylibId(self.stubs)
    }

    /// Create a library that searches `stubs`, then every earlier library newest first, then the
    /// host process.
    pub fn create_dylib(&mut self, name: &str, epoch: u64) -> DylibId {
        let node = self
            .dylibs
            .add_node(SessionNode::Jit(JitDylib::new(name, epoch)));
        self.dylibs.add_edge(node, self.stubs, 0);
        for (priority, prev) in self.order.iter().rev().enumerate() {
            self.dylibs.add_edge(node, *prev, priority as u32 + 1);
        }
        self.dylibs.add_edge(node, self.process, u32::MAX);
        self.order.push(node);
        debug!("created JIT library {} (epoch {})", name, epoch);
        DylibId(node)
    }

    /// Drop a library whose link failed, along with any memory attached to it.
    pub fn discard(&mut self, id: DylibId) {
        if id.0 == self.stubs || id.0 == self.process {
            return;
        }
        self.order.retain(|n| *n != id.0);
        if let Some(SessionNode::Jit(dylib)) = self.dylibs.remove_node(id.0) {
            debug!("discarded JIT library {}", dylib.name);
        }
    }

    pub fn dylib(&self, id: DylibId) -> Option<&JitDylib> {
        match self.dylibs.node_weight(id.0)? {
            SessionNode::Jit(d) => Some(d),
            SessionNode::Process => None,
        }
    }

    fn dylib_mut(&mut self, id: DylibId) -> Option<&mut JitDylib> {
        match self.dylibs.node_weight_mut(id.0)? {
            SessionNode::Jit(d) => Some(d),
            SessionNode::Process => None,
        }
    }

    pub fn define(&mut self, id: DylibId, name: &str, address: usize) {
        if let Some(dylib) = self.dylib_mut(id) {
            trace!("{}: define {} = {:#x}", dylib.name, name, address);
            dylib.symbols.insert(name.to_string(), address);
        }
    }

    pub(crate) fn attach_memory(&mut self, id: DylibId, memory: JitMemory) {
        if let Some(dylib) = self.dylib_mut(id) {
            dylib.memory.push(memory);
        }
    }

    /// The dependencies of a library in search order.
    pub fn search_order(&self, id: DylibId) -> Vec<DylibId> {
        let mut deps: Vec<_> = self
            .dylibs
            .edges_directed(id.0, Direction::Outgoing)
            .map(|e| (*e.weight(), e.target()))
            .collect();
        deps.sort();
        deps.into_iter().map(|(_, n)| DylibId(n)).collect()
    }

    /// Look a symbol up on behalf of library `start`. Names are as spelled in object files.
    pub fn lookup(&self, start: DylibId, name: &str, flags: LookupFlags) -> Option<usize> {
        if !flags.contains(LookupFlags::SKIP_SELF) {
            if let Some(addr) = self.dylib(start).and_then(|d| d.lookup(name)) {
                return Some(addr);
            }
        }
        if !flags.contains(LookupFlags::SKIP_DEPS) {
            for dep in self.search_order(start) {
                let found = match &self.dylibs[dep.0] {
                    SessionNode::Jit(d) => d.lookup(name),
                    SessionNode::Process if flags.contains(LookupFlags::SKIP_PROCESS) => None,
                    SessionNode::Process => process_symbol(name),
                };
                if found.is_some() {
                    return found;
                }
            }
        }
        if flags.contains(LookupFlags::ALLOW_FALLBACK) {
            return self.fallback.generate(name);
        }
        None
    }

    /// Look a symbol up as any new library would: `stubs`, every library newest first, then the
    /// host process.
    pub fn lookup_global(&self, name: &str) -> Option<usize> {
        std::iter::once(self.stubs)
            .chain(self.order.iter().rev().copied())
            .find_map(|n| match &self.dylibs[n] {
                SessionNode::Jit(d) => d.lookup(name),
                SessionNode::Process => None,
            })
            .or_else(|| process_symbol(name))
    }

    /// Number of JIT libraries, not counting `stubs`.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Resolve a symbol already loaded into the process.
pub fn process_symbol(name: &str) -> Option<usize> {
    let name = CString::new(strip_global_prefix(name)).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::fallback::default_allow_list;
    use crate::mangling::add_global_prefix;

    fn session() -> JitSession {
        JitSession::new(WeakFallbackGenerator::new(default_allow_list()))
    }

    #[test]
    fn newest_definition_wins() {
        let mut s = session();
        let boot = s.create_dylib("bootstrap", 0);
        s.define(boot, "kclass:Foo", 0x100);
        let r1 = s.create_dylib("reload-1", 1);
        s.define(r1, "kclass:Foo", 0x200);
        let r2 = s.create_dylib("reload-2", 2);

        assert_eq!(s.lookup(r2, "kclass:Foo", LookupFlags::empty()), Some(0x200));
        assert_eq!(s.lookup_global("kclass:Foo"), Some(0x200));
        assert_eq!(
            s.search_order(r2),
            vec![s.stubs(), r1, boot, DylibId(s.process)]
        );
    }

    #[test]
    fn stubs_come_first() {
        let mut s = session();
        let boot = s.create_dylib("bootstrap", 0);
        s.define(boot, "kfun:f", 0x100);
        let stubs = s.stubs();
        s.define(stubs, "kfun:f", 0x900);
        let r1 = s.create_dylib("reload-1", 1);
        assert_eq!(s.lookup(r1, "kfun:f", LookupFlags::SKIP_SELF), Some(0x900));
    }

    #[test]
    fn process_and_fallback() {
        let mut s = session();
        let r = s.create_dylib("reload-1", 1);
        let malloc = add_global_prefix("malloc");
        assert!(s.lookup(r, &malloc, LookupFlags::empty()).is_some());
        assert!(s
            .lookup(r, &malloc, LookupFlags::SKIP_PROCESS)
            .is_none());

        let trap = add_global_prefix("mach_msg_trap_that_does_not_exist");
        assert!(s.lookup(r, &trap, LookupFlags::ALLOW_FALLBACK).is_none());
        let constant = add_global_prefix("UIApplicationWillTerminateNotification");
        assert!(s.lookup(r, &constant, LookupFlags::empty()).is_none());
        assert!(s.lookup(r, &constant, LookupFlags::ALLOW_FALLBACK).is_some());
    }

    #[test]
    fn discarded_libraries_leave_the_search_order() {
        let mut s = session();
        let boot = s.create_dylib("bootstrap", 0);
        let bad = s.create_dylib("reload-1", 1);
        s.define(bad, "kclass:Foo", 0x200);
        s.discard(bad);
        let r2 = s.create_dylib("reload-2", 2);
        assert_eq!(s.search_order(r2), vec![s.stubs(), boot, DylibId(s.process)]);
        assert_eq!(s.lookup_global("kclass:Foo"), None);
        assert_eq!(s.len(), 2);
    }
}
