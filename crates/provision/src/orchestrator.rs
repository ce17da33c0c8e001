use std::collections::BTreeSet;

use polystore_model::{BackendKind, EntitySpec, LoadPlan, PlanError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::acquire::Acquirer;
use crate::error::{AcquisitionError, Stage, StageError, StageErrorKind};
use crate::outcome::{FinalOutcome, JobKey, JobOutcome, RunOutcome};
use crate::pipeline::{JobEvent, Pipeline, Report};
use crate::readiness::ReadinessPolicy;
use crate::target::Target;

/// Backends a run is limited to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendScope {
    #[default]
    All,
    Only(BackendKind),
}

impl BackendScope {
    pub fn includes(&self, kind: BackendKind) -> bool {
        match self {
            BackendScope::All => true,
            BackendScope::Only(only) => *only == kind,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse staged artifacts instead of fetching missing ones.
    pub skip_acquire: bool,
    pub scope: BackendScope,
}

/// Sequences acquisition and the backend pipelines, and owns the run
/// outcome.
pub struct Orchestrator<T> {
    entities: Vec<EntitySpec>,
    acquirer: Acquirer,
    policy: ReadinessPolicy,
    targets: Vec<T>,
}

impl<T: Target> Orchestrator<T> {
    pub fn new(entities: Vec<EntitySpec>, acquirer: Acquirer, policy: ReadinessPolicy, targets: Vec<T>) -> Self {
        Orchestrator {
            entities,
            acquirer,
            policy,
            targets,
        }
    }

    pub async fn run(self, options: &RunOptions, cancel: CancellationToken) -> Result<FinalOutcome, PlanError> {
        let mut pipelines = Vec::new();
        for target in self.targets {
            let kind = target.kind();
            if options.scope.includes(kind) {
                let plan = LoadPlan::for_backend(kind, &self.entities)?;
                pipelines.push((target, plan));
            }
        }
        let mut outcome = RunOutcome::new(
            pipelines
                .iter()
                .flat_map(|(_, plan)| plan.load_order().map(|e| JobKey::new(plan.kind(), &e.name))),
        );
        tracing::info!(
            jobs = outcome.keys().count(),
            backends = pipelines.len(),
            skip_acquire = options.skip_acquire,
            "run started"
        );

        if cancel.is_cancelled() {
            fail_all(&mut outcome, |_| JobOutcome::Skipped("cancelled".to_owned()));
            return Ok(outcome.finalize());
        }

        let plans: Vec<&LoadPlan> = pipelines.iter().map(|(_, plan)| plan).collect();
        if let Err(err) = acquire_all(&self.acquirer, &plans, options.skip_acquire).await {
            tracing::error!(error = %err, "acquisition failed, no backend is loaded");
            let reason = err.to_string();
            fail_all(&mut outcome, |key| {
                let failure = StageError::job(
                    key.backend,
                    &key.entity,
                    Stage::Acquire,
                    StageErrorKind::Acquisition(reason.clone()),
                );
                JobOutcome::Failed(failure)
            });
            return Ok(outcome.finalize());
        }

        let (reports, mut receiver) = mpsc::unbounded_channel();
        let mut tasks = tokio::task::JoinSet::new();
        for (target, plan) in pipelines {
            let span = tracing::info_span!("pipeline", backend = %plan.kind());
            let pipeline = Pipeline {
                target,
                plan,
                layout: self.acquirer.layout().clone(),
                policy: self.policy,
                cancel: cancel.clone(),
                reports: reports.clone(),
            };
            tasks.spawn(pipeline.run().instrument(span));
        }
        drop(reports);

        // Closes once every pipeline has dropped its sender.
        while let Some(Report { key, event }) = receiver.recv().await {
            let applied = match event {
                JobEvent::Advanced(state) => outcome.advance(&key, state),
                JobEvent::Finished(result) => outcome.record(&key, result),
            };
            if let Err(err) = applied {
                tracing::error!(error = %err, "inconsistent job report");
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "pipeline task aborted");
            }
        }

        let outcome = outcome.finalize();
        tracing::info!(succeeded = outcome.succeeded(), "run finished");
        Ok(outcome)
    }
}

/// Stages every artifact the targeted pipelines read, including the record
/// encodings graph entities are verified against.
async fn acquire_all(acquirer: &Acquirer, plans: &[&LoadPlan], skip_acquire: bool) -> Result<(), AcquisitionError> {
    let mut seen = BTreeSet::new();
    let mut needed = Vec::new();
    for plan in plans {
        for entity in plan.load_order() {
            let mut kinds = vec![plan.kind()];
            if plan.kind() == BackendKind::Graph && entity.graph.as_ref().is_some_and(|g| g.label.is_some()) {
                if entity.tabular.is_some() {
                    kinds.push(BackendKind::Tabular);
                } else if entity.document.is_some() {
                    kinds.push(BackendKind::Document);
                }
            }
            for kind in kinds {
                if seen.insert((kind, entity.name.as_str())) {
                    needed.push((entity, kind));
                }
            }
        }
    }

    if skip_acquire {
        for (entity, kind) in needed {
            acquirer.require_staged(entity, kind)?;
        }
        return Ok(());
    }
    futures_util::future::try_join_all(needed.into_iter().map(|(entity, kind)| acquirer.acquire(entity, kind))).await?;
    Ok(())
}

fn fail_all(outcome: &mut RunOutcome, mut result: impl FnMut(&JobKey) -> JobOutcome) {
    let keys: Vec<JobKey> = outcome.keys().cloned().collect();
    for key in keys {
        if outcome.has_outcome(&key) {
            continue;
        }
        if let Err(err) = outcome.record(&key, result(&key)) {
            tracing::error!(error = %err, "cannot record outcome");
        }
    }
}
