//! The reload request wire format.
//!
//! A request is a `u32` path count followed by that many `(u32 length, bytes)` records. Integers
//! use the host's native byte order, since sender and receiver always share a machine. A single
//! trailing NUL on a path is tolerated and stripped; NULs elsewhere are kept.
use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::error::{HotReloadError, HotReloadErrorKind};

/// Longest path accepted in a request.
pub const MAX_PATH_LEN: u32 = 64 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReloadRequest {
    pub paths: Vec<PathBuf>,
}

impl ReloadRequest {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            paths: paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }

    /// Read one request. Fails if the peer closes the stream before the request is complete.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HotReloadError> {
        let count = read_u32(reader)?;
        let mut paths = Vec::new();
        for _ in 0..count {
            let len = read_u32(reader)?;
            if len > MAX_PATH_LEN {
                return Err(HotReloadErrorKind::PathTooLong {
                    len,
                    limit: MAX_PATH_LEN,
                }
                .into());
            }
            let mut bytes = vec![0; len as usize];
            read_exact(reader, &mut bytes)?;
            if bytes.last() == Some(&0) {
                bytes.pop();
            }
            paths.push(PathBuf::from(OsStr::from_bytes(&bytes)));
        }
        Ok(Self { paths })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())?;
        writer.flush()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.paths.len() as u32).to_ne_bytes());
        for path in &self.paths {
            let bytes = path.as_os_str().as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), HotReloadError> {
    reader
        .read_exact(buf)
        .map_err(|source| HotReloadErrorKind::TruncatedRequest { source }.into())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, HotReloadError> {
    let mut buf = [0; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}
