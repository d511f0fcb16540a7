//! The stages of the standard reload pipeline.
mod externalize;
mod listener;
mod selectors;
mod stubs;
mod unwind;

pub use externalize::SymbolExternalizer;
pub use listener::ObjectListener;
#[cfg(target_vendor = "apple")]
pub use selectors::ObjcSelectorRegistry;
pub use selectors::{SelectorFixup, SelectorRegistry};
pub use stubs::{StubInstaller, StubPointerCommit, CELL_SECTION, STUB_SECTION};
pub use unwind::UnwindStripper;

use super::stage::Pipeline;
use crate::error::HotReloadError;

/// The pipeline every reloadable object goes through:
///
/// 1. `strip-unwind` (pre-prune)
/// 2. `externalize-functions` (pre-prune)
/// 3. `install-stubs` (pre-prune)
/// 4. `fixup-selectors` (post-fixup, Apple targets)
/// 5. `record-symbols` (post-finalize)
/// 6. `commit-stub-pointers` (post-finalize)
pub fn standard_pipeline() -> Result<Pipeline, HotReloadError> {
    let pipeline = Pipeline::new()
        .with(UnwindStripper::default())?
        .with(SymbolExternalizer)?
        .with(StubInstaller)?;
    #[cfg(target_vendor = "apple")]
    let pipeline = pipeline.with(SelectorFixup::new(Box::new(ObjcSelectorRegistry)))?;
    pipeline.with(ObjectListener)?.with(StubPointerCommit)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order() {
        let names = standard_pipeline().unwrap().stage_names();
        let mut expected = vec!["strip-unwind", "externalize-functions", "install-stubs"];
        if cfg!(target_vendor = "apple") {
            expected.push("fixup-selectors");
        }
        expected.extend(["record-symbols", "commit-stub-pointers"]);
        assert_eq!(names, expected);
    }
}
