use std::path::Path;

use anyhow::Context;
use polystore_model::{BackendKind, EntitySpec, LoadPlan};

use crate::backends::{Backend, BulkLoader};
use crate::docker::Container;

/// Directory staged artifacts are uploaded to inside backend containers.
pub const STAGING_DIR: &str = "/tmp/polystore";
const TABULAR_DIR: &str = const_format::formatc!("{STAGING_DIR}/tabular");
const DOCUMENT_DIR: &str = const_format::formatc!("{STAGING_DIR}/document");
const GRAPH_DIR: &str = const_format::formatc!("{STAGING_DIR}/graph");

/// Path of the staged artifact of `entity` inside the container.
pub fn container_path(kind: BackendKind, entity: &str) -> String {
    let dir = match kind {
        BackendKind::Tabular => TABULAR_DIR,
        BackendKind::Document => DOCUMENT_DIR,
        BackendKind::Graph => GRAPH_DIR,
    };
    format!("{dir}/{entity}.{}", kind.staged_extension())
}

/// Everything a pipeline needs from one backend. Each operation is a fresh
/// call parameterized by its inputs.
pub trait Target: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn bring_up(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn probe(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn ensure_schema(&self, plan: &LoadPlan) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn reset_data(&self, plan: &LoadPlan) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Loads the staged artifact at host path `staged`.
    fn load(
        &self,
        entity: &EntitySpec,
        staged: &Path,
    ) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;

    fn count(&self, entity: &EntitySpec) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;
}

/// Backend running in a container, driven by its [`BulkLoader`].
pub struct DockerTarget<C> {
    container: C,
    loader: BulkLoader,
}

impl<C: Container> DockerTarget<C> {
    pub fn new(container: C, loader: BulkLoader) -> Self {
        DockerTarget { container, loader }
    }
}

impl<C: Container> Target for DockerTarget<C> {
    fn kind(&self) -> BackendKind {
        self.loader.kind()
    }

    async fn bring_up(&self) -> anyhow::Result<()> {
        self.container
            .ensure_running()
            .await
            .with_context(|| format!("container {}", self.container.name()))
    }

    async fn probe(&self) -> anyhow::Result<()> {
        self.loader.probe(&self.container).await
    }

    async fn ensure_schema(&self, plan: &LoadPlan) -> anyhow::Result<()> {
        self.loader.ensure_schema(&self.container, plan).await
    }

    async fn reset_data(&self, plan: &LoadPlan) -> anyhow::Result<()> {
        self.loader.reset_data(&self.container, plan).await
    }

    async fn load(&self, entity: &EntitySpec, staged: &Path) -> anyhow::Result<Option<u64>> {
        let dest = container_path(self.kind(), &entity.name);
        self.container
            .upload(staged, &dest)
            .await
            .with_context(|| format!("cannot upload {} to {dest}", staged.display()))?;
        self.loader.load(&self.container, entity, &dest).await
    }

    async fn count(&self, entity: &EntitySpec) -> anyhow::Result<Option<u64>> {
        self.loader.count(&self.container, entity).await
    }
}
