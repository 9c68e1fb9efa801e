pub mod cpu;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use cpu::BrightRegionScorer;
pub use stub::{ScorerProbe, ScriptedScorer};

#[cfg(feature = "backend-tract")]
pub use tract::TractScorer;
