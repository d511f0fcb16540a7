use std::{
    ffi::{CStr, OsStr},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
};

use object::{
    macho::{
        LoadCommand, MachHeader64, Nlist64, SegmentCommand64, SymtabCommand, LC_SEGMENT_64,
        LC_SYMTAB, N_STAB, N_TYPE, N_UNDF,
    },
    NativeEndian,
};

use super::{ImageSymbol, LoadedImage};
use crate::error::{HotReloadError, HotReloadErrorKind};

const LINKEDIT: &[u8] = b"__LINKEDIT";

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const libc::c_void;
    fn _dyld_get_image_name(index: u32) -> *const libc::c_char;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
}

pub(super) fn loaded_images() -> Vec<LoadedImage> {
    let count = unsafe { _dyld_image_count() };
    (0..count)
        .filter_map(|i| {
            let (header, name, slide) = unsafe {
                (
                    _dyld_get_image_header(i),
                    _dyld_get_image_name(i),
                    _dyld_get_image_vmaddr_slide(i),
                )
            };
            if header.is_null() || name.is_null() {
                return None;
            }
            let name = unsafe { CStr::from_ptr(name) };
            Some(LoadedImage {
                path: PathBuf::from(OsStr::from_bytes(name.to_bytes())),
                base: slide as usize,
                header: header as usize,
                header_count: 1,
            })
        })
        .collect()
}

pub(super) fn image_symbols(image: &LoadedImage) -> Result<Vec<ImageSymbol>, HotReloadError> {
    let missing = || -> HotReloadError {
        HotReloadErrorKind::MissingSymbolTable {
            path: image.path.display().to_string(),
        }
        .into()
    };
    let e = NativeEndian;
    // Safety: dyld keeps the header and load commands of a loaded image mapped.
    let header = unsafe { &*(image.header as *const MachHeader64<NativeEndian>) };
    let mut cmd = image.header + std::mem::size_of::<MachHeader64<NativeEndian>>();
    let mut linkedit = None;
    let mut symtab = None;
    for _ in 0..header.ncmds.get(e) {
        let lc = unsafe { &*(cmd as *const LoadCommand<NativeEndian>) };
        match lc.cmd.get(e) {
            LC_SEGMENT_64 => {
                let seg = unsafe { &*(cmd as *const SegmentCommand64<NativeEndian>) };
                if seg.segname.starts_with(LINKEDIT) {
                    linkedit = Some(seg.vmaddr.get(e) as usize - seg.fileoff.get(e) as usize);
                }
            }
            LC_SYMTAB => symtab = Some(unsafe { &*(cmd as *const SymtabCommand<NativeEndian>) }),
            _ => {}
        }
        cmd += lc.cmdsize.get(e) as usize;
    }
    let (Some(linkedit), Some(symtab)) = (linkedit, symtab) else {
        return Err(missing());
    };

    let base = image.base.wrapping_add(linkedit);
    let symbols = base + symtab.symoff.get(e) as usize;
    let strings = base + symtab.stroff.get(e) as usize;
    let mut out = vec![];
    for i in 0..symtab.nsyms.get(e) as usize {
        let sym = unsafe { &*(symbols as *const Nlist64<NativeEndian>).add(i) };
        if sym.n_type & N_STAB != 0 || sym.n_type & N_TYPE == N_UNDF {
            continue;
        }
        let strx = sym.n_strx.get(e) as usize;
        if strx == 0 {
            continue;
        }
        let name = unsafe { CStr::from_ptr((strings + strx) as *const libc::c_char) };
        out.push(ImageSymbol {
            name: name.to_string_lossy().into_owned(),
            address: image.base.wrapping_add(sym.n_value.get(e) as usize),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_libsystem_exports() {
        let images = loaded_images();
        let system = images
            .iter()
            .find(|i| i.path.to_string_lossy().contains("libsystem_malloc"))
            .unwrap();
        let symbols = image_symbols(system).unwrap();
        let malloc = symbols.iter().find(|s| s.name == "_malloc").unwrap();
        let expected = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"malloc".as_ptr()) } as usize;
        assert_eq!(malloc.address, expected);
    }
}
