use std::path::{Path, PathBuf};

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tracing::debug;

use crate::error::HotReloadError;

/// A shared library opened by a reload. Handles are kept for the life of the process and never
/// closed, since stubs may point into the library's code.
#[derive(Debug)]
pub struct LibraryHandle {
    epoch: u64,
    path: PathBuf,
    library: Library,
}

impl LibraryHandle {
    /// Open a library with all symbols bound immediately and made visible to later lookups.
    pub fn open(path: &Path, epoch: u64) -> Result<Self, HotReloadError> {
        let library = unsafe { Library::open(Some(path), RTLD_NOW | RTLD_GLOBAL)? };
        debug!("opened {} (epoch {})", path.display(), epoch);
        Ok(Self {
            epoch,
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of an exported symbol, given without the platform's global prefix.
    pub fn symbol_address(&self, name: &str) -> Option<usize> {
        let sym = unsafe { self.library.get::<*const libc::c_void>(name.as_bytes()) }.ok()?;
        Some(sym.into_raw() as usize)
    }
}
