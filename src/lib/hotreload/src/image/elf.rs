use std::{
    ffi::{c_void, CStr, OsStr},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
};

use elf::{
    abi::{DT_GNU_HASH, DT_HASH, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB, PT_DYNAMIC},
    endian::NativeEndian,
    file::Class,
    string_table::StringTable,
    symbol::SymbolTable,
};
use tracing::warn;

use super::{ImageSymbol, LoadedImage};
use crate::error::{HotReloadError, HotReloadErrorKind};

const SYM_SIZE: usize = 24;

pub(super) fn loaded_images() -> Vec<LoadedImage> {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let images = &mut *(data as *mut Vec<LoadedImage>);
        let info = &*info;
        let mut path = if info.dlpi_name.is_null() {
            PathBuf::new()
        } else {
            PathBuf::from(OsStr::from_bytes(CStr::from_ptr(info.dlpi_name).to_bytes()))
        };
        // The executable is reported first, with an empty name.
        if images.is_empty() && path.as_os_str().is_empty() {
            if let Ok(exe) = std::env::current_exe() {
                path = exe;
            }
        }
        images.push(LoadedImage {
            path,
            base: info.dlpi_addr as usize,
            header: info.dlpi_phdr as usize,
            header_count: info.dlpi_phnum as usize,
        });
        0
    }

    let mut images: Vec<LoadedImage> = vec![];
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut images as *mut _ as *mut c_void);
    }
    images
}

#[derive(Default)]
struct DynamicInfo {
    symtab: Option<usize>,
    strtab: Option<usize>,
    strsz: Option<usize>,
    hash: Option<usize>,
    gnu_hash: Option<usize>,
}

pub(super) fn image_symbols(image: &LoadedImage) -> Result<Vec<ImageSymbol>, HotReloadError> {
    let missing = || -> HotReloadError {
        HotReloadErrorKind::MissingSymbolTable {
            path: image.path.display().to_string(),
        }
        .into()
    };
    if image.header == 0 {
        return Err(missing());
    }
    // Safety: the loader hands out program headers that stay valid while the image is loaded.
    let phdrs = unsafe {
        std::slice::from_raw_parts(image.header as *const libc::Elf64_Phdr, image.header_count)
    };
    let dynamic = phdrs
        .iter()
        .find(|p| p.p_type == PT_DYNAMIC)
        .ok_or_else(missing)?;
    let info = unsafe { read_dynamic(image.base, image.base + dynamic.p_vaddr as usize) };

    let (Some(symtab), Some(strtab), Some(strsz)) = (info.symtab, info.strtab, info.strsz) else {
        return Err(missing());
    };
    let count = unsafe {
        match (info.gnu_hash, info.hash) {
            (Some(gnu), _) => gnu_hash_symbol_count(gnu),
            (None, Some(hash)) => *(hash as *const u32).add(1) as usize,
            (None, None) => return Err(missing()),
        }
    };

    // Safety: the dynamic section describes tables that are mapped for the life of the image.
    let (symbols, strings) = unsafe {
        (
            std::slice::from_raw_parts(symtab as *const u8, count * SYM_SIZE),
            std::slice::from_raw_parts(strtab as *const u8, strsz),
        )
    };
    let symbols = SymbolTable::new(NativeEndian, Class::ELF64, symbols);
    let strings = StringTable::new(strings);

    let mut out = vec![];
    for sym in symbols.iter() {
        if sym.is_undefined() || sym.st_name == 0 {
            continue;
        }
        let name = match strings.get(sym.st_name as usize) {
            Ok(name) => name,
            Err(e) => {
                warn!("{}: bad symbol name: {}", image.path.display(), e);
                continue;
            }
        };
        out.push(ImageSymbol {
            name: name.to_string(),
            address: image.base + sym.st_value as usize,
        });
    }
    Ok(out)
}

/// Some loaders relocate the address-valued dynamic entries in place and some do not.
fn rebase(base: usize, value: u64) -> usize {
    let value = value as usize;
    if value < base {
        base + value
    } else {
        value
    }
}

unsafe fn read_dynamic(base: usize, address: usize) -> DynamicInfo {
    let mut info = DynamicInfo::default();
    let mut entry = address as *const [u64; 2];
    loop {
        let [tag, value] = *entry;
        match tag as i64 {
            DT_NULL => break,
            DT_SYMTAB => info.symtab = Some(rebase(base, value)),
            DT_STRTAB => info.strtab = Some(rebase(base, value)),
            DT_STRSZ => info.strsz = Some(value as usize),
            DT_HASH => info.hash = Some(rebase(base, value)),
            DT_GNU_HASH => info.gnu_hash = Some(rebase(base, value)),
            _ => {}
        }
        entry = entry.add(1);
    }
    info
}

/// The GNU hash table has no symbol count; walk past the end of the longest chain instead.
unsafe fn gnu_hash_symbol_count(table: usize) -> usize {
    let header = table as *const u32;
    let nbuckets = *header as usize;
    let symoffset = *header.add(1) as usize;
    let bloom_size = *header.add(2) as usize;
    let buckets = (table + 16 + bloom_size * 8) as *const u32;
    let chains = buckets.add(nbuckets);

    let last = (0..nbuckets).map(|i| *buckets.add(i) as usize).max().unwrap_or(0);
    if last < symoffset {
        return symoffset;
    }
    let mut index = last;
    while *chains.add(index - symoffset) & 1 == 0 {
        index += 1;
    }
    index + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_comes_first() {
        let images = loaded_images();
        assert!(!images.is_empty());
        assert_eq!(Some(&images[0].path), std::env::current_exe().ok().as_ref());
    }

    #[cfg(target_env = "gnu")]
    #[test]
    fn reads_libc_exports() {
        let images = loaded_images();
        let libc = images
            .iter()
            .find(|i| i.path.to_string_lossy().contains("libc.so"))
            .unwrap();
        let symbols = image_symbols(libc).unwrap();
        let malloc = symbols.iter().find(|s| s.name == "malloc").unwrap();
        let expected = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"malloc".as_ptr()) } as usize;
        assert_eq!(malloc.address, expected);
    }
}
