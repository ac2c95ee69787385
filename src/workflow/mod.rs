//! Pipeline definitions and run profiles.
//!
//! A pipeline is declared in TOML and built into a task graph for one
//! profile. See [`PipelineSpec::build`].

mod pipeline;
mod profile;

pub use pipeline::{BlockerDecl, BuiltPipeline, PhaseSpec, PipelineSpec, TaskDef};
pub use profile::Profile;
