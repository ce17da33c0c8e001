pub mod dataset;
pub mod normalize;
pub mod plan;
pub mod staging;

pub use dataset::{BackendKind, DocumentFormat, EntitySpec};
pub use normalize::Normalization;
pub use plan::{LoadPlan, PlanError};
pub use staging::StagingLayout;
