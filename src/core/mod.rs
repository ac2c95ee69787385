//! Core domain models: tasks, their artifacts and the graph that orders them.

pub mod artifact;
pub mod dag;
pub mod task;

pub use artifact::{ArtifactDescriptor, ArtifactSchema, Requirement};
pub use dag::{EdgeKind, GraphPatch, PatchTarget, Splice, TaskFilter, TaskGraph, TaskUpdate, Transition};
pub use task::{Annotation, FailureReason, Phase, Task, TaskId, TaskOutput, TaskSpec, TaskStatus};
