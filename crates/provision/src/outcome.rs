//! Per-job state machine and the aggregated result of one run.

use std::collections::BTreeMap;

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use polystore_model::BackendKind;

use crate::error::{Stage, StageError};

/// One dataset loaded into one backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub backend: BackendKind,
    pub entity: String,
}

impl JobKey {
    pub fn new(backend: BackendKind, entity: &str) -> Self {
        JobKey {
            backend,
            entity: entity.to_owned(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend, self.entity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Acquiring,
    ReadyToLoad,
    Loading,
    Verifying,
    Succeeded,
    Failed(Stage),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

impl JobState {
    fn successor(&self) -> Option<JobState> {
        match self {
            JobState::Pending => Some(JobState::Acquiring),
            JobState::Acquiring => Some(JobState::ReadyToLoad),
            JobState::ReadyToLoad => Some(JobState::Loading),
            JobState::Loading => Some(JobState::Verifying),
            JobState::Verifying => Some(JobState::Succeeded),
            JobState::Succeeded | JobState::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }

    /// Moves to the next state. Skipping a state is rejected.
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if self.successor() != Some(next) {
            return Err(TransitionError { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }

    pub fn fail(&mut self, stage: Stage) -> Result<(), TransitionError> {
        let next = JobState::Failed(stage);
        if self.is_terminal() {
            return Err(TransitionError { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded {
        expected: Option<u64>,
        observed: Option<u64>,
        note: Option<String>,
    },
    Failed(StageError),
    Skipped(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OutcomeError {
    #[error("unknown job {0}")]
    UnknownJob(JobKey),
    #[error("job {0} already has an outcome")]
    AlreadyRecorded(JobKey),
    #[error("job {key}: {source}")]
    Transition {
        key: JobKey,
        #[source]
        source: TransitionError,
    },
}

#[derive(Debug)]
struct JobRecord {
    state: JobState,
    outcome: Option<JobOutcome>,
}

/// Outcome of the run in progress. Only the orchestrator writes to it.
#[derive(Debug, Default)]
pub struct RunOutcome {
    jobs: BTreeMap<JobKey, JobRecord>,
}

impl RunOutcome {
    pub fn new(keys: impl IntoIterator<Item = JobKey>) -> Self {
        let jobs = keys
            .into_iter()
            .map(|key| {
                let record = JobRecord {
                    state: JobState::Pending,
                    outcome: None,
                };
                (key, record)
            })
            .collect();
        RunOutcome { jobs }
    }

    pub fn keys(&self) -> impl Iterator<Item = &JobKey> {
        self.jobs.keys()
    }

    pub fn state(&self, key: &JobKey) -> Option<JobState> {
        self.jobs.get(key).map(|record| record.state)
    }

    pub fn advance(&mut self, key: &JobKey, next: JobState) -> Result<(), OutcomeError> {
        let record = self.record_mut(key)?;
        record.state.advance(next).map_err(|source| OutcomeError::Transition {
            key: key.clone(),
            source,
        })
    }

    /// Stores the terminal outcome of a job, moving its state accordingly.
    /// Skipped jobs never left `Pending`.
    pub fn record(&mut self, key: &JobKey, outcome: JobOutcome) -> Result<(), OutcomeError> {
        let record = self.record_mut(key)?;
        if record.outcome.is_some() {
            return Err(OutcomeError::AlreadyRecorded(key.clone()));
        }
        let transition = match &outcome {
            JobOutcome::Succeeded { .. } => record.state.advance(JobState::Succeeded),
            JobOutcome::Failed(err) => record.state.fail(err.stage),
            JobOutcome::Skipped(_) if record.state == JobState::Pending => Ok(()),
            JobOutcome::Skipped(_) => Err(TransitionError {
                from: record.state,
                to: JobState::Pending,
            }),
        };
        transition.map_err(|source| OutcomeError::Transition {
            key: key.clone(),
            source,
        })?;
        record.outcome = Some(outcome);
        Ok(())
    }

    pub fn has_outcome(&self, key: &JobKey) -> bool {
        self.jobs.get(key).is_some_and(|record| record.outcome.is_some())
    }

    /// Freezes the outcome. Jobs nothing reported on are recorded as skipped.
    pub fn finalize(self) -> FinalOutcome {
        let jobs = self
            .jobs
            .into_iter()
            .map(|(key, record)| {
                let outcome = record
                    .outcome
                    .unwrap_or_else(|| JobOutcome::Skipped("no result reported".to_owned()));
                (key, outcome)
            })
            .collect();
        FinalOutcome { jobs }
    }

    fn record_mut(&mut self, key: &JobKey) -> Result<&mut JobRecord, OutcomeError> {
        self.jobs
            .get_mut(key)
            .ok_or_else(|| OutcomeError::UnknownJob(key.clone()))
    }
}

/// Immutable outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalOutcome {
    jobs: BTreeMap<JobKey, JobOutcome>,
}

impl FinalOutcome {
    pub fn get(&self, backend: BackendKind, entity: &str) -> Option<&JobOutcome> {
        self.jobs.get(&JobKey::new(backend, entity))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobKey, &JobOutcome)> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.jobs.values().all(JobOutcome::is_success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["backend", "entity", "status", "stage", "detail", "expected", "observed"]);

        for (key, outcome) in &self.jobs {
            let (status, stage, detail, expected, observed) = match outcome {
                JobOutcome::Succeeded {
                    expected,
                    observed,
                    note,
                } => (
                    Cell::new("succeeded").fg(Color::Green),
                    String::new(),
                    note.clone().unwrap_or_default(),
                    *expected,
                    *observed,
                ),
                JobOutcome::Failed(err) => {
                    let (expected, observed) = match err.kind {
                        crate::error::StageErrorKind::CountMismatch { expected, observed } => {
                            (Some(expected), Some(observed))
                        }
                        _ => (None, None),
                    };
                    (
                        Cell::new("failed").fg(Color::Red),
                        err.stage.to_string(),
                        err.kind.to_string(),
                        expected,
                        observed,
                    )
                }
                JobOutcome::Skipped(reason) => (
                    Cell::new("skipped").fg(Color::Yellow),
                    String::new(),
                    reason.clone(),
                    None,
                    None,
                ),
            };
            let number = |n: Option<u64>| n.map(|n| n.to_string()).unwrap_or_else(|| "-".to_owned());
            table.add_row(vec![
                Cell::new(key.backend),
                Cell::new(&key.entity),
                status,
                Cell::new(stage),
                Cell::new(detail),
                Cell::new(number(expected)),
                Cell::new(number(observed)),
            ]);
        }
        table
    }
}

impl std::fmt::Display for FinalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_table())
    }
}
