// Build orchestration: one build from recipe generation to container teardown.

mod context;
mod orchestrator;
mod types;

pub use context::BuildContext;
pub use orchestrator::{Orchestrator, spawn_build};
pub use types::{
    BuildError, BuildEvent, BuildInput, BuildOptions, BuildReport, BuildState, ErrorKind,
    LifecycleStage,
};
