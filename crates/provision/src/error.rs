use polystore_model::BackendKind;

/// Pipeline stage at which a load job can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Acquire,
    BringUp,
    Readiness,
    Schema,
    Reset,
    Load,
    Verify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::BringUp => "bring-up",
            Stage::Readiness => "readiness",
            Stage::Schema => "schema",
            Stage::Reset => "reset",
            Stage::Load => "load",
            Stage::Verify => "verify",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetching or staging a source artifact failed. Aborts the whole run.
#[derive(Debug, thiserror::Error)]
#[error("cannot stage {backend} artifact of `{entity}` from {url}: {cause:#}")]
pub struct AcquisitionError {
    pub entity: String,
    pub backend: BackendKind,
    pub url: String,
    #[source]
    pub cause: anyhow::Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageErrorKind {
    #[error("backend not ready after {attempts} attempts: {last_error}")]
    Timeout { attempts: u32, last_error: String },
    #[error("{0}")]
    Acquisition(String),
    #[error("{0}")]
    BringUp(String),
    #[error("{0}")]
    Schema(String),
    #[error("{0}")]
    Reset(String),
    #[error("{0}")]
    Load(String),
    #[error("count probe failed: {0}")]
    Probe(String),
    #[error("expected {expected} records, observed {observed} ({})", delta(*expected, *observed))]
    CountMismatch { expected: u64, observed: u64 },
    #[error("cancelled")]
    Cancelled,
}

fn delta(expected: u64, observed: u64) -> String {
    if observed >= expected {
        format!("+{}", observed - expected)
    } else {
        format!("-{}", expected - observed)
    }
}

/// Terminal failure of a load job: which backend, which entity, which stage.
/// `entity` is `None` when a whole pipeline failed before any load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{backend}/{}: {stage} failed: {kind}", .entity.as_deref().unwrap_or("*"))]
pub struct StageError {
    pub backend: BackendKind,
    pub entity: Option<String>,
    pub stage: Stage,
    pub kind: StageErrorKind,
}

impl StageError {
    pub fn pipeline(backend: BackendKind, stage: Stage, kind: StageErrorKind) -> Self {
        StageError {
            backend,
            entity: None,
            stage,
            kind,
        }
    }

    pub fn job(backend: BackendKind, entity: &str, stage: Stage, kind: StageErrorKind) -> Self {
        StageError {
            backend,
            entity: Some(entity.to_owned()),
            stage,
            kind,
        }
    }

    /// Same failure attributed to one entity of the failed pipeline.
    pub fn for_entity(&self, entity: &str) -> Self {
        StageError::job(self.backend, entity, self.stage, self.kind.clone())
    }
}

/// Renders an anyhow chain on one line.
pub(crate) fn chain(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
