//! In-memory backends for orchestrator tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use polystore_model::staging::{count_delimited, count_documents};
use polystore_model::{BackendKind, EntitySpec, LoadPlan};
use tokio_util::sync::CancellationToken;

use crate::target::Target;

#[derive(Default)]
struct BackendState {
    running: bool,
    creations: u32,
    counts: BTreeMap<String, u64>,
    /// Entities loaded since the last reset.
    loaded: BTreeSet<String>,
    /// Entity and its stored count at the moment its load started.
    loads: Vec<(String, u64)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Data held by the fake backends. Survives across runs like a container
/// volume does, until the backend is removed.
#[derive(Clone, Default)]
pub(crate) struct FakeStore(Arc<Mutex<HashMap<BackendKind, BackendState>>>);

impl FakeStore {
    fn with<R>(&self, kind: BackendKind, f: impl FnOnce(&mut BackendState) -> R) -> R {
        let mut guard: MutexGuard<'_, _> = self.0.lock().expect("store lock");
        f(guard.entry(kind).or_default())
    }

    pub(crate) fn set_count(&self, kind: BackendKind, entity: &str, count: u64) {
        self.with(kind, |state| {
            state.counts.insert(entity.to_owned(), count);
        });
    }

    pub(crate) fn count(&self, kind: BackendKind, entity: &str) -> Option<u64> {
        self.with(kind, |state| state.counts.get(entity).copied())
    }

    pub(crate) fn creations(&self, kind: BackendKind) -> u32 {
        self.with(kind, |state| state.creations)
    }

    /// Simulates removing the container together with its volume.
    pub(crate) fn remove_backend(&self, kind: BackendKind) {
        self.with(kind, |state| {
            state.running = false;
            state.counts.clear();
            state.loaded.clear();
        });
    }

    pub(crate) fn loads(&self, kind: BackendKind) -> Vec<(String, u64)> {
        self.with(kind, |state| state.loads.clone())
    }

    pub(crate) fn max_concurrent_loads(&self, kind: BackendKind) -> usize {
        self.with(kind, |state| state.max_in_flight)
    }
}

#[derive(Clone, Default)]
struct Faults {
    never_ready: bool,
    fail_schema: bool,
    fail_reset: bool,
    fail_load: HashSet<String>,
    fail_count: HashSet<String>,
    drop_records: HashMap<String, u64>,
    cancel_on_load: Option<(String, CancellationToken)>,
}

/// Backend keeping record counts in a [`FakeStore`]. Tabular loads enforce
/// foreign keys against the parents loaded since the last reset.
#[derive(Clone)]
pub(crate) struct FakeTarget {
    kind: BackendKind,
    store: FakeStore,
    faults: Faults,
}

impl FakeTarget {
    pub(crate) fn new(kind: BackendKind) -> Self {
        FakeTarget::with_store(kind, FakeStore::default())
    }

    pub(crate) fn with_store(kind: BackendKind, store: FakeStore) -> Self {
        FakeTarget {
            kind,
            store,
            faults: Faults::default(),
        }
    }

    pub(crate) fn store(&self) -> &FakeStore {
        &self.store
    }

    pub(crate) fn never_ready(mut self) -> Self {
        self.faults.never_ready = true;
        self
    }

    pub(crate) fn fail_schema(mut self) -> Self {
        self.faults.fail_schema = true;
        self
    }

    pub(crate) fn fail_reset(mut self) -> Self {
        self.faults.fail_reset = true;
        self
    }

    pub(crate) fn fail_load(mut self, entity: &str) -> Self {
        self.faults.fail_load.insert(entity.to_owned());
        self
    }

    pub(crate) fn fail_count(mut self, entity: &str) -> Self {
        self.faults.fail_count.insert(entity.to_owned());
        self
    }

    /// Loads of `entity` silently lose `records`.
    pub(crate) fn drop_records(mut self, entity: &str, records: u64) -> Self {
        self.faults.drop_records.insert(entity.to_owned(), records);
        self
    }

    pub(crate) fn cancel_on_load(mut self, entity: &str, cancel: CancellationToken) -> Self {
        self.faults.cancel_on_load = Some((entity.to_owned(), cancel));
        self
    }

    fn records_in(&self, entity: &EntitySpec, staged: &Path) -> anyhow::Result<u64> {
        match self.kind {
            BackendKind::Tabular => {
                let Some(tabular) = &entity.tabular else {
                    anyhow::bail!("no tabular encoding");
                };
                count_delimited(staged, tabular.delimiter as u8, tabular.header)
            }
            BackendKind::Document => {
                let Some(document) = &entity.document else {
                    anyhow::bail!("no document encoding");
                };
                count_documents(staged, document.format)
            }
            // One node per `CREATE` statement.
            BackendKind::Graph => {
                let script = std::fs::read_to_string(staged)?;
                Ok(script.lines().filter(|l| l.trim_start().starts_with("CREATE")).count() as u64)
            }
        }
    }
}

impl Target for FakeTarget {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn bring_up(&self) -> anyhow::Result<()> {
        self.store.with(self.kind, |state| {
            if !state.running {
                state.running = true;
                state.creations += 1;
            }
        });
        Ok(())
    }

    async fn probe(&self) -> anyhow::Result<()> {
        if self.faults.never_ready {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn ensure_schema(&self, plan: &LoadPlan) -> anyhow::Result<()> {
        if self.faults.fail_schema {
            anyhow::bail!("permission denied to create database");
        }
        self.store.with(self.kind, |state| {
            for entity in plan.load_order() {
                state.counts.entry(entity.name.clone()).or_insert(0);
            }
        });
        Ok(())
    }

    async fn reset_data(&self, plan: &LoadPlan) -> anyhow::Result<()> {
        if self.faults.fail_reset {
            anyhow::bail!("canceling statement due to lock timeout");
        }
        self.store.with(self.kind, |state| {
            if self.kind == BackendKind::Graph {
                state.counts.values_mut().for_each(|count| *count = 0);
            }
            for entity in plan.reset_order() {
                state.counts.insert(entity.name.clone(), 0);
            }
            state.loaded.clear();
        });
        Ok(())
    }

    async fn load(&self, entity: &EntitySpec, staged: &Path) -> anyhow::Result<Option<u64>> {
        if let Some((name, cancel)) = &self.faults.cancel_on_load {
            if *name == entity.name {
                cancel.cancel();
            }
        }
        self.store.with(self.kind, |state| {
            let before = state.counts.get(&entity.name).copied().unwrap_or(0);
            state.loads.push((entity.name.clone(), before));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        });
        // Let concurrent loads overlap.
        tokio::task::yield_now().await;
        let result = self.apply_load(entity, staged);
        self.store.with(self.kind, |state| state.in_flight -= 1);
        result
    }

    async fn count(&self, entity: &EntitySpec) -> anyhow::Result<Option<u64>> {
        if self.faults.fail_count.contains(&entity.name) {
            anyhow::bail!("count query timed out");
        }
        if self.kind == BackendKind::Graph && entity.graph.as_ref().and_then(|g| g.label.as_ref()).is_none() {
            return Ok(None);
        }
        Ok(Some(self.store.count(self.kind, &entity.name).unwrap_or(0)))
    }
}

impl FakeTarget {
    fn apply_load(&self, entity: &EntitySpec, staged: &Path) -> anyhow::Result<Option<u64>> {
        if self.faults.fail_load.contains(&entity.name) {
            anyhow::bail!("injected load failure for {}", entity.name);
        }
        let records = self.records_in(entity, staged)?;
        let stored = records.saturating_sub(self.faults.drop_records.get(&entity.name).copied().unwrap_or(0));
        self.store.with(self.kind, |state| {
            if self.kind == BackendKind::Tabular {
                for parent in entity.references().filter(|p| *p != entity.name) {
                    if !state.loaded.contains(parent) {
                        anyhow::bail!(
                            "insert or update on table \"{}\" violates foreign key constraint referencing \"{parent}\"",
                            entity.name
                        );
                    }
                }
            }
            let count = state.counts.entry(entity.name.clone()).or_insert(0);
            match self.kind {
                // Drop-and-replace import.
                BackendKind::Document => *count = stored,
                BackendKind::Tabular | BackendKind::Graph => *count += stored,
            }
            state.loaded.insert(entity.name.clone());
            Ok(())
        })?;
        Ok(match self.kind {
            BackendKind::Graph => None,
            _ => Some(records),
        })
    }
}
