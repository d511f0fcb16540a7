//! The JIT link layer.
//!
//! An object file is parsed into a [LinkGraph](graph::LinkGraph) of sections, symbols and fixup
//! edges. A [Pipeline](stage::Pipeline) of named stages then rewrites the graph at declared
//! [phases](stage::LinkPhase) while the [JitLinker](linker::JitLinker) materializes it into
//! executable memory. Managed functions never bind directly: every call goes through a stub
//! trampoline that jumps via a pointer cell, so later reloads can redirect callers by rewriting
//! the cell.
pub mod arch;
pub mod fallback;
pub mod graph;
pub mod linker;
pub mod memory;
mod parse;
pub mod session;
pub mod stage;
pub mod stages;

pub use linker::{JitLinker, LinkedObject};
pub use session::{JitSession, LookupFlags};
