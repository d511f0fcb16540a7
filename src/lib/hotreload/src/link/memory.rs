//! JIT memory: one anonymous mapping per linked graph, laid out as text, read-only data and
//! writable data segments, each starting on its own page.
use std::{
    ffi::CStr,
    io,
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use memmap2::MmapMut;
use tracing::{debug, trace};

use super::graph::{align_up, GraphState, LinkGraph, SectionKind};
use crate::error::{HotReloadError, HotReloadErrorKind};

const LAYOUT_ORDER: [SectionKind; 4] = [
    SectionKind::Text,
    SectionKind::ReadOnly,
    SectionKind::Data,
    SectionKind::ZeroFill,
];

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Memory holding one materialized graph. Dropping it unmaps the code, so it must live as long
/// as anything may call into it.
pub struct JitMemory {
    map: MmapMut,
    text: Range<usize>,
    read_only: Range<usize>,
    finalized: bool,
}

impl std::fmt::Debug for JitMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitMemory")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.map.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl JitMemory {
    /// Assign every live allocated section an address and copy its contents into a fresh mapping.
    pub(crate) fn allocate(graph: &mut LinkGraph) -> Result<JitMemory, HotReloadError> {
        graph.require(GraphState::Pruned)?;
        let page = page_size() as u64;

        let mut placements = vec![];
        let mut boundaries = [0u64; LAYOUT_ORDER.len() + 1];
        let mut cursor = 0u64;
        for (i, kind) in LAYOUT_ORDER.iter().enumerate() {
            cursor = align_up(cursor, page);
            boundaries[i] = cursor;
            let ids: Vec<_> = graph
                .section_ids()
                .filter(|id| graph.section(*id).kind == *kind)
                .collect();
            for id in ids {
                let section = graph.section(id);
                cursor = align_up(cursor, section.align);
                placements.push((id, cursor));
                cursor += section.size;
            }
        }
        let total = align_up(cursor, page).max(page);
        boundaries[LAYOUT_ORDER.len()] = total;

        let mut map = MmapMut::map_anon(total as usize).map_err(|source| {
            HotReloadError::from(HotReloadErrorKind::MemoryMap {
                len: total as usize,
                source,
            })
        })?;
        let base = map.as_ptr() as usize;
        for (id, offset) in placements {
            let section = graph.section_mut(id);
            let start = offset as usize;
            map[start..start + section.data.len()].copy_from_slice(&section.data);
            section.address = Some(base + start);
            trace!(
                "placed {} at {:#x} ({} bytes)",
                section.name,
                base + start,
                section.size
            );
        }
        graph.advance(GraphState::Allocated);
        debug!("allocated {} bytes of JIT memory at {:#x}", total, base);

        Ok(JitMemory {
            map,
            text: boundaries[0] as usize..boundaries[1] as usize,
            read_only: boundaries[1] as usize..boundaries[2] as usize,
            finalized: false,
        })
    }

    pub fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, address: usize) -> bool {
        (self.base()..self.base() + self.len()).contains(&address)
    }

    /// Writable bytes at an address inside this mapping. Only available before finalization.
    pub(crate) fn bytes_mut(&mut self, address: usize, len: usize) -> Option<&mut [u8]> {
        if self.finalized {
            return None;
        }
        let start = address.checked_sub(self.base())?;
        self.map.get_mut(start..start.checked_add(len)?)
    }

    /// Apply final protections (text R+X, read-only data R) and make the code visible to the
    /// instruction fetch path.
    pub(crate) fn finalize(&mut self, graph: &mut LinkGraph) -> Result<(), HotReloadError> {
        graph.require(GraphState::FixedUp)?;
        let base = self.base();
        self.protect(self.text.clone(), libc::PROT_READ | libc::PROT_EXEC)?;
        self.protect(self.read_only.clone(), libc::PROT_READ)?;
        flush_icache(base + self.text.start, self.text.len());
        self.finalized = true;
        graph.advance(GraphState::Finalized);
        Ok(())
    }

    fn protect(&self, range: Range<usize>, prot: libc::c_int) -> Result<(), HotReloadError> {
        if range.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::mprotect(
                (self.base() + range.start) as *mut libc::c_void,
                range.len(),
                prot,
            )
        };
        if ret != 0 {
            return Err(HotReloadErrorKind::MemoryProtect {
                source: io::Error::last_os_error(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
fn flush_icache(start: usize, len: usize) {
    extern "C" {
        fn sys_icache_invalidate(start: *mut libc::c_void, len: usize);
    }
    unsafe { sys_icache_invalidate(start as *mut libc::c_void, len) }
}

#[cfg(all(target_arch = "aarch64", not(target_vendor = "apple")))]
fn flush_icache(start: usize, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe { __clear_cache(start as *mut libc::c_char, (start + len) as *mut libc::c_char) }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: usize, _len: usize) {}

/// Word-sized access to memory outside any link graph: indirection cells, selector references.
pub trait MemoryAccess: Send + Sync {
    /// # Safety
    /// `address` must be valid for reads and word-aligned.
    unsafe fn read_word(&self, address: usize) -> usize;

    /// Store a word with a single atomic, release-ordered write.
    ///
    /// # Safety
    /// `address` must be valid for writes and word-aligned, and nothing may hold a Rust reference
    /// to that memory.
    unsafe fn write_word(&self, address: usize, value: usize);

    /// # Safety
    /// `address` must point to a NUL-terminated string.
    unsafe fn read_c_string(&self, address: usize) -> Option<String>;
}

/// Direct access to this process's memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessMemory;

impl MemoryAccess for ProcessMemory {
    unsafe fn read_word(&self, address: usize) -> usize {
        (*(address as *const AtomicUsize)).load(Ordering::Acquire)
    }

    unsafe fn write_word(&self, address: usize, value: usize) {
        (*(address as *const AtomicUsize)).store(value, Ordering::Release)
    }

    unsafe fn read_c_string(&self, address: usize) -> Option<String> {
        if address == 0 {
            return None;
        }
        Some(
            CStr::from_ptr(address as *const libc::c_char)
                .to_string_lossy()
                .into_owned(),
        )
    }
}
