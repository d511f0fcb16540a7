//! Definitions for errors for the hot reload subsystem.
use std::io;

use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, Default)]
#[error("{kind}")]
pub struct HotReloadError {
    pub kind: HotReloadErrorKind,
    #[related]
    pub related: Vec<HotReloadError>,
}

impl HotReloadError {
    pub fn new_collect(kind: HotReloadErrorKind, related: Vec<HotReloadError>) -> Self {
        Self { kind, related }
    }

    pub fn new(kind: HotReloadErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn collect<I, T>(parent_kind: HotReloadErrorKind, it: I) -> Result<Vec<T>, HotReloadError>
    where
        I: IntoIterator<Item = Result<T, HotReloadError>>,
    {
        // Collect errors and values, and then if there any errors, build a new error from them.
        let (vals, errs): (Vec<T>, Vec<HotReloadError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(HotReloadError {
                kind: parent_kind,
                related: errs,
            })
        }
    }

    /// Wrap this error as the single related cause of a new error of the given kind.
    pub fn context(self, kind: HotReloadErrorKind) -> Self {
        Self {
            kind,
            related: vec![self],
        }
    }
}

impl From<HotReloadErrorKind> for HotReloadError {
    fn from(value: HotReloadErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

#[derive(Debug, Error, Diagnostic, Default)]
pub enum HotReloadErrorKind {
    #[default]
    #[error("unknown")]
    Unknown,
    #[error("no loaded image matches '{path}'")]
    ImageNotFound { path: String },
    #[error("loaded image '{path}' has no usable symbol table")]
    MissingSymbolTable { path: String },
    #[error("failed to link '{object}'")]
    LinkFailure { object: String },
    #[error("failed to find symbol '{name}' for '{object}'")]
    SymbolUnresolved { name: String, object: String },
    #[error("{stale} reference(s) to old instances of '{class}' were left in place")]
    PartialMigration { class: String, stale: usize },
    #[error("socket {op} failed: {source}")]
    SocketFailure {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("reload request ended early: {source}")]
    TruncatedRequest {
        #[source]
        source: io::Error,
    },
    #[error("reload request path of {len} bytes exceeds the {limit} byte limit")]
    PathTooLong { len: u32, limit: u32 },
    #[error("reload server was not started")]
    ServerNotStarted,
    #[error("reload server is already running")]
    ServerAlreadyRunning,
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("object parse failed: {err}")]
    ObjectParse {
        #[from]
        err: object::read::Error,
    },
    #[error("image table parse failed: {err}")]
    ImageParse {
        #[from]
        err: elf::ParseError,
    },
    #[error("failed to open library: {err}")]
    LibraryOpen {
        #[from]
        err: libloading::Error,
    },
    #[error("'{object}' is not a relocatable object")]
    NotRelocatable { object: String },
    #[error("unsupported architecture {arch}")]
    UnsupportedArchitecture { arch: String },
    #[error("unsupported relocation {reloc} in section '{section}'")]
    UnsupportedRelocation { section: String, reloc: String },
    #[error("{kind} fixup at {place:#x} cannot encode target {target:#x}")]
    FixupOutOfRange {
        kind: String,
        place: usize,
        target: usize,
    },
    #[error("stage '{stage}' failed")]
    StageFailed { stage: &'static str },
    #[error("stage '{stage}' runs {phase} but follows a stage that runs {previous}")]
    StageOrder {
        stage: &'static str,
        phase: String,
        previous: String,
    },
    #[error("link graph is {actual} but {required} is required")]
    GraphState { actual: String, required: String },
    #[error("failed to map {len} bytes of JIT memory: {source}")]
    MemoryMap {
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to change protection of JIT memory: {source}")]
    MemoryProtect {
        #[source]
        source: io::Error,
    },
    #[error("no indirection cell recorded for '{name}'")]
    MissingStubPointer { name: String },
    #[error("entry point '{name}' not found")]
    EntryPointMissing { name: String },
    #[error("invalid value '{value}' for {key}")]
    InvalidConfig { key: &'static str, value: String },
}

impl From<object::read::Error> for HotReloadError {
    fn from(value: object::read::Error) -> Self {
        Self::new(HotReloadErrorKind::ObjectParse { err: value })
    }
}

impl From<elf::ParseError> for HotReloadError {
    fn from(value: elf::ParseError) -> Self {
        Self::new(HotReloadErrorKind::ImageParse { err: value })
    }
}

impl From<libloading::Error> for HotReloadError {
    fn from(value: libloading::Error) -> Self {
        Self::new(HotReloadErrorKind::LibraryOpen { err: value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_keeps_values_when_all_succeed() {
        let items: Vec<Result<u32, HotReloadError>> = vec![Ok(1), Ok(2)];
        let vals = HotReloadError::collect(HotReloadErrorKind::Unknown, items).unwrap();
        assert_eq!(vals, vec![1, 2]);
    }

    #[test]
    fn collect_gathers_every_failure() {
        let items: Vec<Result<u32, HotReloadError>> = vec![
            Ok(1),
            Err(HotReloadErrorKind::SymbolUnresolved {
                name: "a".into(),
                object: "x.o".into(),
            }
            .into()),
            Err(HotReloadErrorKind::SymbolUnresolved {
                name: "b".into(),
                object: "x.o".into(),
            }
            .into()),
        ];
        let err = HotReloadError::collect(
            HotReloadErrorKind::LinkFailure {
                object: "x.o".into(),
            },
            items,
        )
        .unwrap_err();
        assert!(matches!(err.kind, HotReloadErrorKind::LinkFailure { .. }));
        assert_eq!(err.related.len(), 2);
        assert_eq!(err.to_string(), "failed to link 'x.o'");
    }
}
