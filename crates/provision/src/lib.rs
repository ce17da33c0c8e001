//! Provisioning and ingestion: brings each backend from "container started"
//! to "queryable with verified data".

pub mod acquire;
pub mod backends;
pub mod docker;
pub mod error;
pub mod orchestrator;
pub mod outcome;
mod pipeline;
pub mod readiness;
pub mod target;
pub mod verify;

#[cfg(test)]
mod testing;

pub use acquire::Acquirer;
pub use backends::{Backend, BulkLoader};
pub use docker::{Container, DockerContainer};
pub use error::{AcquisitionError, Stage, StageError, StageErrorKind};
pub use orchestrator::{BackendScope, Orchestrator, RunOptions};
pub use outcome::{FinalOutcome, JobKey, JobOutcome, JobState};
pub use readiness::ReadinessPolicy;
pub use target::{DockerTarget, Target};
