//! Reads the managed symbols of a shared library that is already loaded into the process.
//!
//! Only the in-memory symbol and string tables of the loaded image are consulted; the file on
//! disk is never parsed.
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::{
    error::{HotReloadError, HotReloadErrorKind},
    mangling::strip_global_prefix,
    objects::NativeObjectFile,
};

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod elf;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
use self::elf as platform;

#[cfg(target_vendor = "apple")]
mod macho;
#[cfg(target_vendor = "apple")]
use self::macho as platform;

/// An image in the process's loaded image list.
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub path: PathBuf,
    /// Load bias (ELF) or slide (Mach-O).
    pub base: usize,
    /// Address of the program headers (ELF) or the Mach-O header.
    pub(crate) header: usize,
    pub(crate) header_count: usize,
}

/// A defined symbol of a loaded image, as spelled in its symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSymbol {
    pub name: String,
    pub address: usize,
}

pub fn loaded_images() -> Vec<LoadedImage> {
    platform::loaded_images()
}

/// Every defined symbol of a loaded image.
pub fn image_symbols(image: &LoadedImage) -> Result<Vec<ImageSymbol>, HotReloadError> {
    platform::image_symbols(image)
}

/// Find the loaded image for `path`.
pub fn find_image(path: &Path) -> Result<LoadedImage, HotReloadError> {
    let images = loaded_images();
    let index = match_image(path, images.iter().map(|i| i.path.as_path())).ok_or_else(|| {
        HotReloadErrorKind::ImageNotFound {
            path: path.display().to_string(),
        }
    })?;
    Ok(images[index].clone())
}

/// Read the managed functions and classes of the loaded library at `path`.
pub fn read_symbols(path: &Path) -> Result<NativeObjectFile, HotReloadError> {
    let image = find_image(path)?;
    debug!("reading symbols of {} (base {:#x})", image.path.display(), image.base);
    let mut file = NativeObjectFile::new();
    for sym in image_symbols(&image)? {
        if file.record(strip_global_prefix(&sym.name), Some(sym.address)) {
            trace!("{} = {:#x}", sym.name, sym.address);
        }
    }
    debug!(
        "{}: {} functions, {} classes",
        image.path.display(),
        file.functions().count(),
        file.classes().count()
    );
    Ok(file)
}

/// Pick the candidate that names the same file as `target`: an exact match, then a match after
/// normalization, then a candidate containing the normalized target.
pub(crate) fn match_image<'a>(
    target: &Path,
    candidates: impl Iterator<Item = &'a Path>,
) -> Option<usize> {
    let candidates: Vec<&Path> = candidates.collect();
    if let Some(i) = candidates.iter().position(|c| *c == target) {
        return Some(i);
    }
    let want = normalize(target);
    if want.is_empty() {
        return None;
    }
    let normalized: Vec<String> = candidates.iter().map(|c| normalize(c)).collect();
    normalized
        .iter()
        .position(|c| *c == want)
        .or_else(|| normalized.iter().position(|c| c.contains(&want)))
}

fn normalize(path: &Path) -> String {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let path = path.to_string_lossy();
    match path.strip_prefix("/private") {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.into_owned(),
    }
}
