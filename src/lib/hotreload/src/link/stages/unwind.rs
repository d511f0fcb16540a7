use tracing::debug;

use crate::{
    error::{HotReloadError, HotReloadErrorKind},
    link::{
        graph::LinkGraph,
        stage::{LinkPhase, LinkStage, StageContext},
    },
};

/// Drops unwind tables before pruning. JIT libraries never register unwind info, and the tables
/// reference personality routines of the host image.
pub struct UnwindStripper {
    names: Vec<&'static str>,
}

impl Default for UnwindStripper {
    fn default() -> Self {
        Self {
            names: vec!["__compact_unwind", "__unwind_info", ".eh_frame"],
        }
    }
}

impl UnwindStripper {
    pub fn new(names: Vec<&'static str>) -> Self {
        Self { names }
    }
}

impl LinkStage for UnwindStripper {
    fn name(&self) -> &'static str {
        "strip-unwind"
    }

    fn phase(&self) -> LinkPhase {
        LinkPhase::PrePrune
    }

    fn run(
        &mut self,
        graph: &mut LinkGraph,
        _cx: &mut StageContext<'_>,
    ) -> Result<(), HotReloadError> {
        let doomed: Vec<_> = graph
            .section_ids()
            .filter(|id| self.names.contains(&graph.section(*id).name.as_str()))
            .collect();
        for id in doomed {
            let name = graph.section(id).name.clone();
            let symbols = graph.remove_section(id);
            debug!("{}: stripped {} ({} symbols)", graph.name(), name, symbols);
        }
        Ok(())
    }

    fn verify(&self, graph: &LinkGraph, _cx: &StageContext<'_>) -> Result<(), HotReloadError> {
        match graph
            .section_ids()
            .find(|id| self.names.contains(&graph.section(*id).name.as_str()))
        {
            Some(id) => Err(HotReloadErrorKind::UnsupportedRelocation {
                section: graph.section(id).name.clone(),
                reloc: "unwind section survived stripping".to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }
}
