//! Hot reload for natively compiled managed code.
//!
//! A running program links its bootstrap object through an in-process JIT linker. Every managed
//! function is reached through a stub that jumps via a pointer cell, so when a recompiled object
//! (or shared library) arrives over the reload listener, the new bodies are linked and the cells
//! repointed. Classes whose layout changed have their live instances migrated to the new layout
//! while mutator threads are parked.
//!
//! The entry point is [HotReloadService]; the launcher constructs one with a [StatsCollector] and
//! a [HostRuntime](migrate::host::HostRuntime), links the bootstrap, and starts the listener.

pub mod config;
pub mod definitions;
pub mod error;
pub mod ffi;
pub mod image;
pub mod library;
pub mod link;
pub mod mangling;
pub mod migrate;
pub mod objects;
pub mod server;
pub mod service;
pub mod stats;
pub mod wire;

pub use config::ReloadConfig;
pub use error::*;
pub use service::{EntryPoint, HotReloadService, ReloadOutcome};
pub use stats::{Stats, StatsCollector};
pub use wire::ReloadRequest;
