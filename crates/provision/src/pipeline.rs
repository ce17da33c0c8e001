//! Stages of one backend: bring-up, readiness, schema, reset, then one load
//! job per entity. Results are reported to the orchestrator over a channel.

use std::collections::BTreeMap;

use polystore_model::staging::expected_records;
use polystore_model::{BackendKind, EntitySpec, LoadPlan, StagingLayout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{Stage, StageError, StageErrorKind, chain};
use crate::outcome::{JobKey, JobOutcome, JobState};
use crate::readiness::{ReadinessPolicy, await_ready};
use crate::target::Target;
use crate::verify::{Verified, verify};

#[derive(Debug)]
pub(crate) enum JobEvent {
    Advanced(JobState),
    Finished(JobOutcome),
}

#[derive(Debug)]
pub(crate) struct Report {
    pub(crate) key: JobKey,
    pub(crate) event: JobEvent,
}

pub(crate) struct Pipeline<T> {
    pub(crate) target: T,
    pub(crate) plan: LoadPlan,
    pub(crate) layout: StagingLayout,
    pub(crate) policy: ReadinessPolicy,
    pub(crate) cancel: CancellationToken,
    pub(crate) reports: mpsc::UnboundedSender<Report>,
}

impl<T: Target> Pipeline<T> {
    fn kind(&self) -> BackendKind {
        self.target.kind()
    }

    pub(crate) async fn run(self) {
        if let Err(err) = self.prepare().await {
            if err.kind == StageErrorKind::Cancelled {
                tracing::warn!(stage = %err.stage, "cancelled before loading");
                for entity in self.plan.load_order() {
                    self.finish(entity, JobOutcome::Skipped("cancelled".to_owned()));
                }
            } else {
                tracing::error!(stage = %err.stage, error = %err, "pipeline failed");
                for entity in self.plan.load_order() {
                    self.finish(entity, JobOutcome::Failed(err.for_entity(&entity.name)));
                }
            }
            return;
        }

        match self.kind() {
            BackendKind::Document => self.load_concurrently().await,
            BackendKind::Tabular | BackendKind::Graph => self.load_in_order().await,
        }
        tracing::info!("pipeline finished");
    }

    async fn prepare(&self) -> Result<(), StageError> {
        let kind = self.kind();
        let failed = |stage, kind_of: fn(String) -> StageErrorKind| {
            move |err: anyhow::Error| StageError::pipeline(kind, stage, kind_of(chain(&err)))
        };

        self.checkpoint(Stage::BringUp)?;
        tracing::info!("bringing up");
        self.target
            .bring_up()
            .await
            .map_err(failed(Stage::BringUp, StageErrorKind::BringUp))?;

        self.checkpoint(Stage::Readiness)?;
        let attempts = await_ready(&self.policy, &self.cancel, || self.target.probe())
            .await
            .map_err(|err| StageError::pipeline(kind, Stage::Readiness, err))?;
        tracing::info!(attempts, "backend ready");

        self.checkpoint(Stage::Schema)?;
        self.target
            .ensure_schema(&self.plan)
            .await
            .map_err(failed(Stage::Schema, StageErrorKind::Schema))?;

        self.checkpoint(Stage::Reset)?;
        self.target
            .reset_data(&self.plan)
            .await
            .map_err(failed(Stage::Reset, StageErrorKind::Reset))?;
        tracing::info!(entities = self.plan.len(), "schema ready, data reset");
        Ok(())
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::pipeline(self.kind(), stage, StageErrorKind::Cancelled));
        }
        Ok(())
    }

    /// Foreign-key order, one entity at a time. A failed tabular load skips
    /// the entities depending on it.
    async fn load_in_order(&self) {
        let mut blocked: BTreeMap<String, String> = BTreeMap::new();
        for entity in self.plan.load_order() {
            if let Some(parent) = blocked.get(&entity.name) {
                tracing::warn!(entity = %entity.name, %parent, "skipping dependent of failed load");
                self.finish(entity, JobOutcome::Skipped(format!("parent {parent} failed")));
                continue;
            }
            let outcome = self.run_job(entity).instrument(self.job_span(entity)).await;
            if self.kind() == BackendKind::Tabular && matches!(outcome, JobOutcome::Failed(_)) {
                for dependent in self.plan.dependents_of(&entity.name) {
                    blocked.entry(dependent).or_insert_with(|| entity.name.clone());
                }
            }
            self.finish(entity, outcome);
        }
    }

    async fn load_concurrently(&self) {
        let jobs = self.plan.load_order().map(|entity| async move {
            let outcome = self.run_job(entity).instrument(self.job_span(entity)).await;
            self.finish(entity, outcome);
        });
        futures_util::future::join_all(jobs).await;
    }

    fn job_span(&self, entity: &EntitySpec) -> tracing::Span {
        tracing::info_span!("job", backend = %self.kind(), entity = %entity.name)
    }

    async fn run_job(&self, entity: &EntitySpec) -> JobOutcome {
        let kind = self.kind();
        let key = JobKey::new(kind, &entity.name);
        let failed = |stage, err| JobOutcome::Failed(StageError::job(kind, &entity.name, stage, err));

        if self.cancel.is_cancelled() {
            return JobOutcome::Skipped("cancelled".to_owned());
        }

        self.advance(&key, JobState::Acquiring);
        let Some(staged) = self.layout.staged(kind, &entity.name) else {
            let missing = format!("no staged artifact at {}", self.layout.path(kind, &entity.name).display());
            return failed(Stage::Acquire, StageErrorKind::Acquisition(missing));
        };
        let expected = match expected_records(&self.layout, entity, kind) {
            Ok(expected) => expected,
            Err(err) => return failed(Stage::Acquire, StageErrorKind::Acquisition(chain(&err))),
        };
        self.advance(&key, JobState::ReadyToLoad);

        self.advance(&key, JobState::Loading);
        tracing::info!(staged = %staged.display(), ?expected, "loading");
        let reported = match self.target.load(entity, &staged).await {
            Ok(reported) => reported,
            Err(err) => {
                tracing::warn!(error = %chain(&err), "load failed");
                return failed(Stage::Load, StageErrorKind::Load(chain(&err)));
            }
        };
        if let (Some(reported), Some(expected)) = (reported, expected) {
            if reported != expected {
                tracing::warn!(reported, expected, "backend reported a different record count");
            }
        }

        self.advance(&key, JobState::Verifying);
        match verify(&self.target, entity, expected).await {
            Ok(Verified::Exact(observed)) => {
                tracing::info!(observed, "verified");
                JobOutcome::Succeeded {
                    expected,
                    observed: Some(observed),
                    note: None,
                }
            }
            Ok(Verified::Unverified { observed }) => {
                tracing::info!(?observed, "loaded without count verification");
                JobOutcome::Succeeded {
                    expected,
                    observed,
                    note: Some("unverified".to_owned()),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "verification failed");
                failed(Stage::Verify, err)
            }
        }
    }

    fn advance(&self, key: &JobKey, state: JobState) {
        self.send(key.clone(), JobEvent::Advanced(state));
    }

    fn finish(&self, entity: &EntitySpec, outcome: JobOutcome) {
        self.send(JobKey::new(self.kind(), &entity.name), JobEvent::Finished(outcome));
    }

    fn send(&self, key: JobKey, event: JobEvent) {
        // The orchestrator outlives every pipeline.
        if self.reports.send(Report { key, event }).is_err() {
            tracing::error!("run outcome receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::outcome::RunOutcome;
    use crate::testing::entity;
    use crate::testing::fake::FakeTarget;

    fn table(name: &str, references: &[&str]) -> EntitySpec {
        let foreign_keys: Vec<_> = references
            .iter()
            .map(|parent| {
                serde_json::json!({
                    "columns": [format!("{parent}_id")],
                    "references": parent,
                    "referenced_columns": ["id"]
                })
            })
            .collect();
        entity(serde_json::json!({
            "name": name,
            "tabular": {
                "source": { "url": format!("{name}.csv") },
                "table": name,
                "columns": [{ "name": "id", "type": "integer" }],
                "foreign_keys": foreign_keys
            }
        }))
    }

    fn stage(layout: &StagingLayout, name: &str, rows: usize) -> anyhow::Result<()> {
        let path = layout.path(BackendKind::Tabular, name);
        std::fs::create_dir_all(layout.family_dir(BackendKind::Tabular))?;
        let body: String = (0..rows).map(|i| format!("{i}\n")).collect();
        std::fs::write(path, format!("id\n{body}"))?;
        Ok(())
    }

    async fn run(target: FakeTarget, plan: LoadPlan, layout: StagingLayout) -> RunOutcome {
        let keys: Vec<_> = plan
            .load_order()
            .map(|e| JobKey::new(plan.kind(), &e.name))
            .collect();
        let mut outcome = RunOutcome::new(keys);
        let (reports, mut receiver) = mpsc::unbounded_channel();
        let pipeline = Pipeline {
            target,
            plan,
            layout,
            policy: ReadinessPolicy {
                max_attempts: 2,
                interval: Duration::from_millis(10),
            },
            cancel: CancellationToken::new(),
            reports,
        };
        pipeline.run().await;
        while let Some(report) = receiver.recv().await {
            match report.event {
                JobEvent::Advanced(state) => outcome.advance(&report.key, state).expect("valid transition"),
                JobEvent::Finished(result) => outcome.record(&report.key, result).expect("single outcome"),
            }
        }
        outcome
    }

    #[tokio::test]
    async fn reordered_dependencies_surface_referential_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = StagingLayout::new(dir.path());
        stage(&layout, "customers", 3)?;
        stage(&layout, "orders", 5)?;

        // Child first, bypassing the dependency sort.
        let plan = LoadPlan::in_given_order(
            BackendKind::Tabular,
            vec![table("orders", &["customers"]), table("customers", &[])],
        );
        let target = FakeTarget::new(BackendKind::Tabular);
        let outcome = run(target, plan, layout).await.finalize();

        let Some(JobOutcome::Failed(err)) = outcome.get(BackendKind::Tabular, "orders") else {
            panic!("orders must fail: {outcome:?}");
        };
        assert_eq!(err.stage, Stage::Load);
        assert!(err.to_string().contains("violates foreign key constraint"), "{err}");
        assert!(outcome.get(BackendKind::Tabular, "customers").is_some_and(JobOutcome::is_success));
        Ok(())
    }

    #[tokio::test]
    async fn failed_parent_skips_dependents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = StagingLayout::new(dir.path());
        for name in ["customers", "products", "orders", "order_details"] {
            stage(&layout, name, 4)?;
        }
        let entities = vec![
            table("customers", &[]),
            table("products", &[]),
            table("orders", &["customers"]),
            table("order_details", &["orders", "products"]),
        ];
        let plan = LoadPlan::for_backend(BackendKind::Tabular, &entities)?;
        let target = FakeTarget::new(BackendKind::Tabular).fail_load("customers");
        let store = target.store().clone();
        let outcome = run(target, plan, layout).await.finalize();

        assert!(matches!(
            outcome.get(BackendKind::Tabular, "customers"),
            Some(JobOutcome::Failed(_))
        ));
        assert!(outcome.get(BackendKind::Tabular, "products").is_some_and(JobOutcome::is_success));
        for dependent in ["orders", "order_details"] {
            assert_eq!(
                outcome.get(BackendKind::Tabular, dependent),
                Some(&JobOutcome::Skipped("parent customers failed".into()))
            );
        }
        assert_eq!(store.max_concurrent_loads(BackendKind::Tabular), 1);
        Ok(())
    }

    #[tokio::test]
    async fn readiness_timeout_fails_every_job_of_the_backend() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = StagingLayout::new(dir.path());
        stage(&layout, "customers", 3)?;
        let plan = LoadPlan::for_backend(BackendKind::Tabular, &[table("customers", &[])])?;
        let outcome = run(FakeTarget::new(BackendKind::Tabular).never_ready(), plan, layout)
            .await
            .finalize();

        let Some(JobOutcome::Failed(err)) = outcome.get(BackendKind::Tabular, "customers") else {
            panic!("customers must fail: {outcome:?}");
        };
        assert_eq!(err.stage, Stage::Readiness);
        assert_eq!(err.entity.as_deref(), Some("customers"));
        assert_eq!(
            err.kind,
            StageErrorKind::Timeout {
                attempts: 2,
                last_error: "connection refused".into()
            }
        );
        Ok(())
    }
}
