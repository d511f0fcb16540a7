use super::{Trampoline, TrampolineEmitter};
use crate::link::graph::{Arch, EdgeKind};

const ADRP_X16: u32 = 0x9000_0010;
const LDR_X16_X16: u32 = 0xf940_0210;
const BR_X16: u32 = 0xd61f_0200;
const BRK_0: u32 = 0xd420_0000;

/// `adrp x16, cell@PAGE; ldr x16, [x16, cell@PAGEOFF]; br x16`, padded to 16 bytes.
///
/// x16 is IP0, which the procedure call standard reserves for exactly this kind of veneer.
pub struct AArch64Trampolines;

impl TrampolineEmitter for AArch64Trampolines {
    fn arch(&self) -> Arch {
        Arch::AArch64
    }

    fn trampoline(&self) -> Trampoline {
        let code = [ADRP_X16, LDR_X16_X16, BR_X16, BRK_0]
            .iter()
            .flat_map(|insn| insn.to_le_bytes())
            .collect();
        Trampoline {
            code,
            align: 16,
            cell_fixups: vec![
                (0, EdgeKind::Page21, 0),
                (4, EdgeKind::PageOffset12 { shift: 3 }, 0),
            ],
        }
    }
}

/// Scale of the unsigned-offset load/store at `insn`, or 0 for anything else (e.g. `add`).
pub fn ldst_shift(insn: u32) -> u8 {
    if insn & 0x3b00_0000 != 0x3900_0000 {
        return 0;
    }
    let size = (insn >> 30) as u8;
    let vector = insn & 0x0400_0000 != 0;
    let opc_hi = insn & 0x0080_0000 != 0;
    if vector && size == 0 && opc_hi {
        4
    } else {
        size
    }
}

/// Patch one instruction. Returns `None` if the target cannot be encoded.
pub(super) fn apply_fixup(kind: EdgeKind, loc: &mut [u8], place: u64, target: u64) -> Option<()> {
    let bytes: &mut [u8; 4] = loc.get_mut(..4)?.try_into().ok()?;
    let insn = u32::from_le_bytes(*bytes);
    let patched = match kind {
        EdgeKind::Branch26 => {
            let delta = (target as i64).wrapping_sub(place as i64);
            if delta & 3 != 0 || !(-(1 << 27)..(1 << 27)).contains(&delta) {
                return None;
            }
            (insn & 0xfc00_0000) | ((delta >> 2) as u32 & 0x03ff_ffff)
        }
        EdgeKind::Page21 => {
            let pages = ((target & !0xfff) as i64).wrapping_sub((place & !0xfff) as i64) >> 12;
            if !(-(1 << 20)..(1 << 20)).contains(&pages) {
                return None;
            }
            let pages = pages as u32;
            let immlo = (pages & 0x3) << 29;
            let immhi = ((pages >> 2) & 0x7_ffff) << 5;
            (insn & 0x9f00_001f) | immlo | immhi
        }
        EdgeKind::PageOffset12 { shift } => {
            let low = (target & 0xfff) as u32;
            if low & ((1 << shift) - 1) != 0 {
                return None;
            }
            (insn & 0xffc0_03ff) | ((low >> shift) << 10)
        }
        _ => return None,
    };
    *bytes = patched.to_le_bytes();
    Some(())
}
