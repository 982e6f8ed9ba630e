mod artifact;
mod run_result;
mod summary;
mod tool_run;
mod tool_spec;

pub use artifact::{ArtifactEntry, ArtifactKind, ChildEntry, Fingerprint, Preview, SheetPreview};
pub use run_result::RunResult;
pub use summary::{Confidence, Summary, SummaryMeta};
pub use tool_run::{EXIT_KILLED, EXIT_NOT_FOUND, EXIT_SPAWN_FAILED, FailureKind, RunStatus, ToolRun};
pub use tool_spec::{Bindings, InvocationMode, ToolSpec};
