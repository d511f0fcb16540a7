//! Building a [LinkGraph] from a relocatable ELF or Mach-O object.
use std::collections::HashMap;

use object::{
    elf, macho, Architecture, BinaryFormat, Object, ObjectKind, ObjectSection, ObjectSymbol,
    RelocationFlags, RelocationTarget, SectionIndex, SymbolIndex, SymbolScope, SymbolSection,
};
use tracing::{debug, trace};

use super::{
    arch::aarch64,
    graph::{
        Arch, Definition, Edge, EdgeKind, LinkGraph, Linkage, Scope, Section, SectionId,
        SectionKind, Symbol, SymbolId, SymbolKind,
    },
};
use crate::error::{HotReloadError, HotReloadErrorKind};

impl LinkGraph {
    /// Parse a relocatable object into a graph named `name`.
    pub fn from_object(name: &str, bytes: &[u8]) -> Result<LinkGraph, HotReloadError> {
        let file = object::File::parse(bytes)?;
        if file.kind() != ObjectKind::Relocatable {
            return Err(HotReloadErrorKind::NotRelocatable {
                object: name.to_string(),
            }
            .into());
        }
        let arch = match file.architecture() {
            Architecture::X86_64 => Arch::X86_64,
            Architecture::Aarch64 => Arch::AArch64,
            other => {
                return Err(HotReloadErrorKind::UnsupportedArchitecture {
                    arch: format!("{:?}", other),
                }
                .into())
            }
        };
        let macho = file.format() == BinaryFormat::MachO;

        let mut graph = LinkGraph::new(name, arch);
        let mut sections: HashMap<SectionIndex, (SectionId, u64)> = HashMap::new();
        for section in file.sections() {
            let kind = section_kind(section.kind());
            let data = match kind {
                SectionKind::ZeroFill => vec![],
                _ => section.data()?.to_vec(),
            };
            let id = graph.add_section(Section {
                name: section.name()?.to_string(),
                segment: section.segment_name()?.map(str::to_string),
                kind,
                align: section.align().max(1),
                data,
                size: section.size(),
                edges: vec![],
                address: None,
                removed: false,
            });
            sections.insert(section.index(), (id, section.address()));
        }

        let mut symbols: HashMap<SymbolIndex, SymbolId> = HashMap::new();
        for sym in file.symbols() {
            if sym.kind() == object::SymbolKind::File {
                continue;
            }
            let sym_name = sym.name()?;
            let definition = match sym.section() {
                SymbolSection::Section(index) => {
                    let Some(&(section, base)) = sections.get(&index) else {
                        continue;
                    };
                    Definition::Defined {
                        section,
                        offset: sym.address() - base,
                    }
                }
                SymbolSection::Undefined if !sym_name.is_empty() => Definition::External,
                SymbolSection::Absolute => Definition::Absolute(sym.address() as usize),
                _ => continue,
            };
            let scope = if sym.is_local() {
                Scope::Local
            } else if sym.scope() == SymbolScope::Linkage {
                Scope::Hidden
            } else {
                Scope::Default
            };
            let id = graph.add_symbol(Symbol {
                name: sym_name.to_string(),
                kind: match sym.kind() {
                    object::SymbolKind::Text => SymbolKind::Function,
                    object::SymbolKind::Data => SymbolKind::Data,
                    object::SymbolKind::Section => SymbolKind::Section,
                    _ => SymbolKind::Other,
                },
                scope,
                linkage: if sym.is_weak() {
                    Linkage::Weak
                } else {
                    Linkage::Strong
                },
                size: sym.size(),
                definition,
                resolved: None,
                removed: false,
            });
            symbols.insert(sym.index(), id);
        }

        let mut section_symbols: HashMap<SectionId, SymbolId> = HashMap::new();
        for section in file.sections() {
            let Some(&(id, section_base)) = sections.get(&section.index()) else {
                continue;
            };
            let section_name = graph.section(id).name.clone();
            for (offset, reloc) in section.relocations() {
                let flags = reloc.flags();
                let mut kind = edge_kind(arch, flags).ok_or_else(|| {
                    HotReloadError::from(HotReloadErrorKind::UnsupportedRelocation {
                        section: section_name.clone(),
                        reloc: format!("{:?}", flags),
                    })
                })?;
                let mut addend = reloc.addend();
                let implicit = if reloc.has_implicit_addend() {
                    read_implicit(&graph.section(id).data, offset, kind)
                } else {
                    0
                };
                let target = match reloc.target() {
                    RelocationTarget::Symbol(index) => *symbols.get(&index).ok_or_else(|| {
                        HotReloadError::from(HotReloadErrorKind::UnsupportedRelocation {
                            section: section_name.clone(),
                            reloc: format!("{:?} against a dropped symbol", flags),
                        })
                    })?,
                    RelocationTarget::Section(index) => {
                        let Some(&(target, target_base)) = sections.get(&index) else {
                            continue;
                        };
                        // Section-relative implicit addends hold the target's address in the
                        // object's own layout; rebase them onto the section.
                        if reloc.has_implicit_addend() && matches!(kind, EdgeKind::Delta32) {
                            let original = section_base as i64 + offset as i64 + implicit - addend;
                            addend += original - target_base as i64;
                        } else {
                            addend += implicit - target_base as i64;
                        }
                        *section_symbols
                            .entry(target)
                            .or_insert_with(|| graph.add_section_symbol(target))
                    }
                    _ => {
                        return Err(HotReloadErrorKind::UnsupportedRelocation {
                            section: section_name.clone(),
                            reloc: format!("{:?} with absolute target", flags),
                        }
                        .into())
                    }
                };
                if matches!(reloc.target(), RelocationTarget::Symbol(_)) {
                    addend += implicit;
                }
                // Mach-O leaves the load/store scale to the instruction being patched.
                if macho && matches!(kind, EdgeKind::PageOffset12 { .. }) {
                    let insn = read_u32(&graph.section(id).data, offset);
                    kind = EdgeKind::PageOffset12 {
                        shift: aarch64::ldst_shift(insn),
                    };
                }
                if let RelocationFlags::MachO { r_type, .. } = flags {
                    addend -= macho_signed_bias(arch, r_type);
                }
                trace!(
                    "edge {}+{:#x} {} -> {:?} {:+}",
                    section_name,
                    offset,
                    kind,
                    target,
                    addend
                );
                graph.section_mut(id).edges.push(Edge {
                    offset,
                    kind,
                    target,
                    addend,
                });
            }
        }
        debug!(
            "parsed {}: {} sections, {} symbols",
            name,
            graph.section_ids().count(),
            graph.symbol_ids().count()
        );
        Ok(graph)
    }

    fn add_section_symbol(&mut self, section: SectionId) -> SymbolId {
        let name = self.section(section).name.clone();
        self.add_defined(name, SymbolKind::Section, Scope::Local, section, 0, 0)
    }
}

fn section_kind(kind: object::SectionKind) -> SectionKind {
    use object::SectionKind as K;
    match kind {
        K::Text => SectionKind::Text,
        K::Data => SectionKind::Data,
        K::ReadOnlyData | K::ReadOnlyDataWithRel | K::ReadOnlyString => SectionKind::ReadOnly,
        K::UninitializedData | K::Common => SectionKind::ZeroFill,
        _ => SectionKind::Metadata,
    }
}

/// Map an object-format relocation to the edge it describes, or `None` if unsupported.
fn edge_kind(arch: Arch, flags: RelocationFlags) -> Option<EdgeKind> {
    let kind = match (arch, flags) {
        (Arch::X86_64, RelocationFlags::Elf { r_type }) => match r_type {
            elf::R_X86_64_64 => EdgeKind::Pointer64,
            elf::R_X86_64_32 => EdgeKind::Pointer32,
            elf::R_X86_64_32S => EdgeKind::Pointer32Signed,
            elf::R_X86_64_PC32 => EdgeKind::Delta32,
            elf::R_X86_64_PC64 => EdgeKind::Delta64,
            elf::R_X86_64_PLT32 => EdgeKind::Branch32,
            elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX => {
                EdgeKind::GotDelta32
            }
            _ => return None,
        },
        (Arch::AArch64, RelocationFlags::Elf { r_type }) => match r_type {
            elf::R_AARCH64_ABS64 => EdgeKind::Pointer64,
            elf::R_AARCH64_ABS32 => EdgeKind::Pointer32,
            elf::R_AARCH64_PREL32 => EdgeKind::Delta32,
            elf::R_AARCH64_PREL64 => EdgeKind::Delta64,
            elf::R_AARCH64_CALL26 | elf::R_AARCH64_JUMP26 => EdgeKind::Branch26,
            elf::R_AARCH64_ADR_PREL_PG_HI21 => EdgeKind::Page21,
            elf::R_AARCH64_ADD_ABS_LO12_NC | elf::R_AARCH64_LDST8_ABS_LO12_NC => {
                EdgeKind::PageOffset12 { shift: 0 }
            }
            elf::R_AARCH64_LDST16_ABS_LO12_NC => EdgeKind::PageOffset12 { shift: 1 },
            elf::R_AARCH64_LDST32_ABS_LO12_NC => EdgeKind::PageOffset12 { shift: 2 },
            elf::R_AARCH64_LDST64_ABS_LO12_NC => EdgeKind::PageOffset12 { shift: 3 },
            elf::R_AARCH64_LDST128_ABS_LO12_NC => EdgeKind::PageOffset12 { shift: 4 },
            elf::R_AARCH64_ADR_GOT_PAGE => EdgeKind::GotPage21,
            elf::R_AARCH64_LD64_GOT_LO12_NC => EdgeKind::GotPageOffset12,
            _ => return None,
        },
        (
            Arch::AArch64,
            RelocationFlags::MachO {
                r_type,
                r_pcrel,
                r_length,
            },
        ) => match (r_type, r_pcrel, r_length) {
            (macho::ARM64_RELOC_UNSIGNED, false, 3) => EdgeKind::Pointer64,
            (macho::ARM64_RELOC_UNSIGNED, false, 2) => EdgeKind::Pointer32,
            (macho::ARM64_RELOC_SUBTRACTOR, ..) => return None,
            (macho::ARM64_RELOC_BRANCH26, true, 2) => EdgeKind::Branch26,
            (macho::ARM64_RELOC_PAGE21, true, 2) => EdgeKind::Page21,
            // The scale is filled in from the instruction once the data is at hand.
            (macho::ARM64_RELOC_PAGEOFF12, false, 2) => EdgeKind::PageOffset12 { shift: 0 },
            (macho::ARM64_RELOC_GOT_LOAD_PAGE21, true, 2) => EdgeKind::GotPage21,
            (macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12, false, 2) => EdgeKind::GotPageOffset12,
            _ => return None,
        },
        (
            Arch::X86_64,
            RelocationFlags::MachO {
                r_type,
                r_pcrel,
                r_length,
            },
        ) => match (r_type, r_pcrel, r_length) {
            (macho::X86_64_RELOC_UNSIGNED, false, 3) => EdgeKind::Pointer64,
            (macho::X86_64_RELOC_UNSIGNED, false, 2) => EdgeKind::Pointer32,
            (macho::X86_64_RELOC_BRANCH, true, 2) => EdgeKind::Branch32,
            (
                macho::X86_64_RELOC_SIGNED
                | macho::X86_64_RELOC_SIGNED_1
                | macho::X86_64_RELOC_SIGNED_2
                | macho::X86_64_RELOC_SIGNED_4,
                true,
                2,
            ) => EdgeKind::Delta32,
            (macho::X86_64_RELOC_GOT_LOAD | macho::X86_64_RELOC_GOT, true, 2) => {
                EdgeKind::GotDelta32
            }
            _ => return None,
        },
        _ => return None,
    };
    Some(kind)
}

/// `X86_64_RELOC_SIGNED_n` displacements are relative to `n` bytes past the usual place.
fn macho_signed_bias(arch: Arch, r_type: u8) -> i64 {
    match (arch, r_type) {
        (Arch::X86_64, macho::X86_64_RELOC_SIGNED_1) => 1,
        (Arch::X86_64, macho::X86_64_RELOC_SIGNED_2) => 2,
        (Arch::X86_64, macho::X86_64_RELOC_SIGNED_4) => 4,
        _ => 0,
    }
}

fn read_u32(data: &[u8], offset: u64) -> u32 {
    let offset = offset as usize;
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or_default()
}

fn read_implicit(data: &[u8], offset: u64, kind: EdgeKind) -> i64 {
    let offset = offset as usize;
    match kind {
        EdgeKind::Pointer64 | EdgeKind::Delta64 => data
            .get(offset..offset + 8)
            .and_then(|b| b.try_into().ok())
            .map(i64::from_le_bytes)
            .unwrap_or_default(),
        EdgeKind::Pointer32 => read_u32(data, offset as u64) as i64,
        EdgeKind::Pointer32Signed
        | EdgeKind::Delta32
        | EdgeKind::Branch32
        | EdgeKind::GotDelta32 => read_u32(data, offset as u64) as i32 as i64,
        // Instruction immediates carry no addend in the objects we accept; Mach-O expresses one
        // with a separate ADDEND relocation.
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use object::write::{Object as WriteObject, Relocation, StandardSection, Symbol as WSymbol};
    use object::{Endianness, SymbolFlags};

    use super::*;

    fn build_x86_64() -> Vec<u8> {
        let mut obj = WriteObject::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.section_id(StandardSection::Text);
        // mov eax, 42; ret
        let answer = obj.append_section_data(text, &[0xb8, 0x2a, 0, 0, 0, 0xc3], 16);
        obj.add_symbol(WSymbol {
            name: b"kfun:answer".to_vec(),
            value: answer,
            size: 6,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: object::write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        // call ext; ret
        let caller = obj.append_section_data(text, &[0xe8, 0, 0, 0, 0, 0xc3], 16);
        obj.add_symbol(WSymbol {
            name: b"kfun:caller".to_vec(),
            value: caller,
            size: 6,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: object::write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        let ext = obj.add_symbol(WSymbol {
            name: b"external_thing".to_vec(),
            value: 0,
            size: 0,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: object::write::SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        obj.add_relocation(
            text,
            Relocation {
                offset: caller + 1,
                symbol: ext,
                addend: -4,
                flags: RelocationFlags::Elf {
                    r_type: elf::R_X86_64_PLT32,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }

    #[test]
    fn parses_sections_symbols_and_edges() {
        let bytes = build_x86_64();
        let graph = LinkGraph::from_object("test.o", &bytes).unwrap();
        assert_eq!(graph.arch(), Arch::X86_64);

        let answer = graph.find_defined("kfun:answer").unwrap();
        assert_eq!(graph.symbol(answer).kind, SymbolKind::Function);
        assert_eq!(graph.symbol(answer).scope, Scope::Default);
        assert_eq!(&graph.symbol_contents(answer).unwrap()[..6], &[0xb8, 0x2a, 0, 0, 0, 0xc3]);

        let ext = graph.find_symbol("external_thing").unwrap();
        assert!(graph.symbol(ext).is_external());

        let text = graph.section_by_name(".text").unwrap();
        let edges = &graph.section(text).edges;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::Branch32);
        assert_eq!(edges[0].target, ext);
        assert_eq!(edges[0].addend, -4);
    }

    #[test]
    fn rejects_non_object_input() {
        let err = LinkGraph::from_object("junk.o", b"definitely not an object").unwrap_err();
        assert!(matches!(err.kind, HotReloadErrorKind::ObjectParse { .. }));
    }

    #[test]
    fn aarch64_relocations_map_to_edges() {
        assert_eq!(
            edge_kind(
                Arch::AArch64,
                RelocationFlags::Elf {
                    r_type: elf::R_AARCH64_CALL26
                }
            ),
            Some(EdgeKind::Branch26)
        );
        assert_eq!(
            edge_kind(
                Arch::AArch64,
                RelocationFlags::Elf {
                    r_type: elf::R_AARCH64_LDST64_ABS_LO12_NC
                }
            ),
            Some(EdgeKind::PageOffset12 { shift: 3 })
        );
        assert_eq!(
            edge_kind(
                Arch::AArch64,
                RelocationFlags::MachO {
                    r_type: macho::ARM64_RELOC_GOT_LOAD_PAGE21,
                    r_pcrel: true,
                    r_length: 2
                }
            ),
            Some(EdgeKind::GotPage21)
        );
        assert_eq!(
            edge_kind(
                Arch::AArch64,
                RelocationFlags::Elf {
                    r_type: elf::R_AARCH64_TLSDESC_ADR_PAGE21
                }
            ),
            None
        );
    }
}
