use super::{Trampoline, TrampolineEmitter};
use crate::link::graph::{Arch, EdgeKind};

/// `jmp qword ptr [rip + cell]`, padded with `int3` to 8 bytes.
pub struct X86_64Trampolines;

impl TrampolineEmitter for X86_64Trampolines {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn trampoline(&self) -> Trampoline {
        Trampoline {
            code: vec![0xff, 0x25, 0, 0, 0, 0, 0xcc, 0xcc],
            align: 8,
            // The displacement is relative to the end of the 6-byte instruction.
            cell_fixups: vec![(2, EdgeKind::Delta32, -4)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::arch::apply_fixup;

    #[test]
    fn trampoline_reaches_cell() {
        let t = X86_64Trampolines.trampoline();
        let mut code = t.code.clone();
        let (offset, kind, addend) = t.cell_fixups[0];
        let base = 0x10_0000u64;
        let cell = 0x10_0100u64;
        apply_fixup(
            Arch::X86_64,
            kind,
            &mut code[offset as usize..],
            base + offset,
            (cell as i64 + addend) as u64,
        )
        .unwrap();
        let disp = i32::from_le_bytes(code[2..6].try_into().unwrap());
        // rip after the jmp is base + 6
        assert_eq!(base as i64 + 6 + disp as i64, cell as i64);
    }
}
