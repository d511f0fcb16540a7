//! Per-instruction-set code: trampoline emission and fixup encoding.
use super::graph::{Arch, EdgeKind};
use crate::error::{HotReloadError, HotReloadErrorKind};

pub mod aarch64;
pub mod x86_64;

/// Machine code that loads a pointer cell and jumps to the address stored in it.
#[derive(Clone, Debug)]
pub struct Trampoline {
    pub code: Vec<u8>,
    pub align: u64,
    /// Fixups, relative to the start of `code`, that must point at the cell.
    pub cell_fixups: Vec<(u64, EdgeKind, i64)>,
}

/// Produces indirect-jump trampolines for one instruction set. The same code serves as the
/// redirectable stub of a managed function and as a PLT entry for calls to external symbols.
pub trait TrampolineEmitter: Send + Sync {
    fn arch(&self) -> Arch;

    fn trampoline(&self) -> Trampoline;
}

pub fn emitter_for(arch: Arch) -> Box<dyn TrampolineEmitter> {
    match arch {
        Arch::X86_64 => Box::new(x86_64::X86_64Trampolines),
        Arch::AArch64 => Box::new(aarch64::AArch64Trampolines),
    }
}

/// The emitter for the machine we are running on.
pub fn host_emitter() -> Option<Box<dyn TrampolineEmitter>> {
    Arch::host().map(emitter_for)
}

/// Encode `target` into the bytes at `loc`, which live at address `place`.
pub(crate) fn apply_fixup(
    arch: Arch,
    kind: EdgeKind,
    loc: &mut [u8],
    place: u64,
    target: u64,
) -> Result<(), HotReloadError> {
    let out_of_range = || -> HotReloadError {
        HotReloadErrorKind::FixupOutOfRange {
            kind: kind.to_string(),
            place: place as usize,
            target: target as usize,
        }
        .into()
    };
    let delta = (target as i64).wrapping_sub(place as i64);
    match kind {
        EdgeKind::Pointer64 => write_bytes(loc, &target.to_le_bytes()),
        EdgeKind::Pointer32 => {
            let v = u32::try_from(target).map_err(|_| out_of_range())?;
            write_bytes(loc, &v.to_le_bytes())
        }
        EdgeKind::Pointer32Signed => {
            let v = i32::try_from(target as i64).map_err(|_| out_of_range())?;
            write_bytes(loc, &v.to_le_bytes())
        }
        EdgeKind::Delta64 => write_bytes(loc, &delta.to_le_bytes()),
        EdgeKind::Delta32 | EdgeKind::Branch32 => {
            let v = i32::try_from(delta).map_err(|_| out_of_range())?;
            write_bytes(loc, &v.to_le_bytes())
        }
        EdgeKind::Branch26 | EdgeKind::Page21 | EdgeKind::PageOffset12 { .. }
            if arch == Arch::AArch64 =>
        {
            aarch64::apply_fixup(kind, loc, place, target).ok_or_else(out_of_range)
        }
        _ => Err(HotReloadErrorKind::UnsupportedRelocation {
            section: String::new(),
            reloc: format!("{} on {:?} at fixup time", kind, arch),
        }
        .into()),
    }
}

fn write_bytes(loc: &mut [u8], bytes: &[u8]) -> Result<(), HotReloadError> {
    let Some(dst) = loc.get_mut(..bytes.len()) else {
        return Err(HotReloadErrorKind::UnsupportedRelocation {
            section: String::new(),
            reloc: "fixup past the end of its section".to_string(),
        }
        .into());
    };
    dst.copy_from_slice(bytes);
    Ok(())
}
