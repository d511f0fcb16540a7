//! The in-memory link graph: sections, symbols and the relocation edges between them.
//!
//! A graph is built from one relocatable object, transformed by the pipeline stages, assigned
//! addresses, fixed up and finally materialized. Indices stay stable for the life of a graph;
//! removing a section or symbol only marks it dead.
use std::fmt::Display;

use crate::error::{HotReloadError, HotReloadErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    AArch64,
}

impl Arch {
    pub const fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::AArch64)
        } else {
            None
        }
    }
}

/// How a section's memory is treated at materialization. The order is also the layout order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    Text,
    ReadOnly,
    Data,
    ZeroFill,
    /// Not loaded into memory (debug info, notes, relocation tables...). Dropped by pruning.
    Metadata,
}

impl SectionKind {
    pub fn is_allocated(&self) -> bool {
        !matches!(self, SectionKind::Metadata)
    }
}

#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub segment: Option<String>,
    pub kind: SectionKind,
    pub align: u64,
    /// Initial contents; empty for zero-fill sections.
    pub data: Vec<u8>,
    pub size: u64,
    pub edges: Vec<Edge>,
    pub address: Option<usize>,
    pub(crate) removed: bool,
}

impl Section {
    /// Append bytes aligned to `align`, returning their offset.
    pub fn append(&mut self, bytes: &[u8], align: u64) -> u64 {
        let offset = align_up(self.size, align);
        self.data.resize(offset as usize, 0);
        self.data.extend_from_slice(bytes);
        self.size = self.data.len() as u64;
        self.align = self.align.max(align);
        offset
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Exported from the JIT library the graph is materialized into.
    Default,
    /// Visible to other objects of the same link, not exported.
    Hidden,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    Strong,
    Weak,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Section,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Definition {
    Defined { section: SectionId, offset: u64 },
    External,
    Absolute(usize),
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub scope: Scope,
    pub linkage: Linkage,
    pub size: u64,
    pub definition: Definition,
    /// For external symbols, the address they were resolved to.
    pub resolved: Option<usize>,
    pub(crate) removed: bool,
}

impl Symbol {
    pub fn is_defined(&self) -> bool {
        matches!(self.definition, Definition::Defined { .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self.definition, Definition::External)
    }
}

/// The kind of a fixup, named by what it computes rather than by object-format relocation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// 64-bit absolute address.
    Pointer64,
    /// 32-bit absolute address, zero-extended.
    Pointer32,
    /// 32-bit absolute address, sign-extended.
    Pointer32Signed,
    /// 32-bit PC-relative displacement.
    Delta32,
    /// 64-bit PC-relative displacement.
    Delta64,
    /// x86-64 `call`/`jmp` rel32; may be routed through a PLT stub.
    Branch32,
    /// AArch64 `b`/`bl` imm26; may be routed through a PLT stub.
    Branch26,
    /// AArch64 `adrp` page delta.
    Page21,
    /// AArch64 low 12 bits of an address, scaled down by `1 << shift`.
    PageOffset12 { shift: u8 },
    /// x86-64 PC-relative displacement to a GOT entry for the target.
    GotDelta32,
    /// AArch64 `adrp` to the page of a GOT entry for the target.
    GotPage21,
    /// AArch64 `ldr` offset of a GOT entry for the target.
    GotPageOffset12,
}

impl EdgeKind {
    pub fn uses_got(&self) -> bool {
        matches!(
            self,
            EdgeKind::GotDelta32 | EdgeKind::GotPage21 | EdgeKind::GotPageOffset12
        )
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, EdgeKind::Branch32 | EdgeKind::Branch26)
    }
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub offset: u64,
    pub kind: EdgeKind,
    pub target: SymbolId,
    pub addend: i64,
}

/// Where a graph is in its lifecycle. Each state implies all earlier ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphState {
    Parsed,
    Pruned,
    Allocated,
    FixedUp,
    Finalized,
}

impl Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GraphState::Parsed => "parsed",
            GraphState::Pruned => "pruned",
            GraphState::Allocated => "allocated",
            GraphState::FixedUp => "fixed up",
            GraphState::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct LinkGraph {
    name: String,
    arch: Arch,
    state: GraphState,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl LinkGraph {
    pub fn new(name: impl Into<String>, arch: Arch) -> Self {
        Self {
            name: name.into(),
            arch,
            state: GraphState::Parsed,
            sections: vec![],
            symbols: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub(crate) fn advance(&mut self, state: GraphState) {
        debug_assert!(state >= self.state);
        self.state = state;
    }

    /// Fail unless the graph has reached at least `required`.
    pub fn require(&self, required: GraphState) -> Result<(), HotReloadError> {
        if self.state < required {
            return Err(HotReloadErrorKind::GraphState {
                actual: self.state.to_string(),
                required: required.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn add_section(&mut self, section: Section) -> SectionId {
        self.sections.push(section);
        SectionId(self.sections.len() - 1)
    }

    /// Create an empty section.
    pub fn create_section(&mut self, name: &str, kind: SectionKind, align: u64) -> SectionId {
        self.add_section(Section {
            name: name.to_string(),
            segment: None,
            kind,
            align,
            data: vec![],
            size: 0,
            edges: vec![],
            address: None,
            removed: false,
        })
    }

    /// Find a live section by name, creating it if it does not exist.
    pub fn ensure_section(&mut self, name: &str, kind: SectionKind, align: u64) -> SectionId {
        match self.section_by_name(name) {
            Some(id) => id,
            None => self.create_section(name, kind, align),
        }
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.section_ids().find(|id| self.section(*id).name == name)
    }

    /// Ids of all live sections.
    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
            .map(|(i, _)| SectionId(i))
    }

    /// Mark a section dead, along with every symbol defined in it and every edge that targets one
    /// of those symbols. Returns the number of symbols removed.
    pub fn remove_section(&mut self, id: SectionId) -> usize {
        self.sections[id.0].removed = true;
        self.sections[id.0].edges.clear();
        let mut dead = vec![];
        for (i, sym) in self.symbols.iter_mut().enumerate() {
            if let Definition::Defined { section, .. } = sym.definition {
                if section == id && !sym.removed {
                    sym.removed = true;
                    dead.push(SymbolId(i));
                }
            }
        }
        if !dead.is_empty() {
            for section in self.sections.iter_mut().filter(|s| !s.removed) {
                section.edges.retain(|e| !dead.contains(&e.target));
            }
        }
        dead.len()
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        SymbolId(self.symbols.len() - 1)
    }

    /// Add a defined symbol.
    pub fn add_defined(
        &mut self,
        name: impl Into<String>,
        kind: SymbolKind,
        scope: Scope,
        section: SectionId,
        offset: u64,
        size: u64,
    ) -> SymbolId {
        self.add_symbol(Symbol {
            name: name.into(),
            kind,
            scope,
            linkage: Linkage::Strong,
            size,
            definition: Definition::Defined { section, offset },
            resolved: None,
            removed: false,
        })
    }

    /// Get the live external symbol with this name, adding one if there is none.
    pub fn add_external(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self
            .symbol_ids()
            .find(|id| self.symbol(*id).is_external() && self.symbol(*id).name == name)
        {
            return id;
        }
        self.add_symbol(Symbol {
            name: name.to_string(),
            kind: SymbolKind::Other,
            scope: Scope::Default,
            linkage: Linkage::Strong,
            size: 0,
            definition: Definition::External,
            resolved: None,
            removed: false,
        })
    }

    pub fn add_absolute(&mut self, name: impl Into<String>, address: usize) -> SymbolId {
        self.add_symbol(Symbol {
            name: name.into(),
            kind: SymbolKind::Other,
            scope: Scope::Local,
            linkage: Linkage::Strong,
            size: 0,
            definition: Definition::Absolute(address),
            resolved: None,
            removed: false,
        })
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    /// Ids of all live symbols.
    pub fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
            .map(|(i, _)| SymbolId(i))
    }

    pub fn find_symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbol_ids().find(|id| self.symbol(*id).name == name)
    }

    /// Find a live defined symbol by name.
    pub fn find_defined(&self, name: &str) -> Option<SymbolId> {
        self.symbol_ids()
            .find(|id| self.symbol(*id).is_defined() && self.symbol(*id).name == name)
    }

    pub fn external_symbols(&self) -> Vec<SymbolId> {
        self.symbol_ids()
            .filter(|id| self.symbol(*id).is_external())
            .collect()
    }

    /// Point every edge that targets `from` at `to` instead. Returns the number of edges changed.
    pub fn retarget_edges(&mut self, from: SymbolId, to: SymbolId) -> usize {
        let mut count = 0;
        for section in self.sections.iter_mut().filter(|s| !s.removed) {
            for edge in section.edges.iter_mut().filter(|e| e.target == from) {
                edge.target = to;
                count += 1;
            }
        }
        count
    }

    /// The final address of a symbol, if the graph has got far enough to know it.
    pub fn symbol_address(&self, id: SymbolId) -> Option<usize> {
        let sym = self.symbol(id);
        match sym.definition {
            Definition::Defined { section, offset } => self
                .section(section)
                .address
                .map(|base| base + offset as usize),
            Definition::Absolute(addr) => Some(addr),
            Definition::External => sym.resolved,
        }
    }

    /// The bytes at a symbol's definition, before materialization.
    pub fn symbol_contents(&self, id: SymbolId) -> Option<&[u8]> {
        let Definition::Defined { section, offset } = self.symbol(id).definition else {
            return None;
        };
        self.section(section).data.get(offset as usize..)
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}
