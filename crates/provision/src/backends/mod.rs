//! Backend drivers: readiness probe, schema provisioning, bulk load and
//! count query of each backend family, all run through commands executed
//! inside the backend's container.

pub mod mongo;
pub mod neo4j;
pub mod postgres;

use polystore_config::BackendConfig;
use polystore_model::{BackendKind, EntitySpec, LoadPlan};

use crate::docker::Container;

pub use mongo::Mongo;
pub use neo4j::Neo4j;
pub use postgres::Postgres;

pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Succeeds once the backend executes application-level commands.
    fn probe<C: Container>(&self, container: &C) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Creates the database, tables or collections of `plan` when absent.
    fn ensure_schema<C: Container>(
        &self,
        container: &C,
        plan: &LoadPlan,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Empties everything `plan` manages.
    fn reset_data<C: Container>(
        &self,
        container: &C,
        plan: &LoadPlan,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Loads the artifact found at `file` inside the container. Returns the
    /// record count the backend reported, when it reports one.
    fn load<C: Container>(
        &self,
        container: &C,
        entity: &EntitySpec,
        file: &str,
    ) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;

    /// Records currently stored for `entity`, `None` when the backend has no
    /// way to count them.
    fn count<C: Container>(
        &self,
        container: &C,
        entity: &EntitySpec,
    ) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;
}

/// One driver per backend family, dispatched by kind.
#[derive(Debug, Clone)]
pub enum BulkLoader {
    Tabular(Postgres),
    Document(Mongo),
    Graph(Neo4j),
}

impl BulkLoader {
    pub fn new(kind: BackendKind, descriptor: &BackendConfig) -> Self {
        match kind {
            BackendKind::Tabular => BulkLoader::Tabular(Postgres::new(descriptor)),
            BackendKind::Document => BulkLoader::Document(Mongo::new(descriptor)),
            BackendKind::Graph => BulkLoader::Graph(Neo4j::new(descriptor)),
        }
    }
}

impl Backend for BulkLoader {
    fn kind(&self) -> BackendKind {
        match self {
            BulkLoader::Tabular(_) => BackendKind::Tabular,
            BulkLoader::Document(_) => BackendKind::Document,
            BulkLoader::Graph(_) => BackendKind::Graph,
        }
    }

    async fn probe<C: Container>(&self, container: &C) -> anyhow::Result<()> {
        match self {
            BulkLoader::Tabular(backend) => backend.probe(container).await,
            BulkLoader::Document(backend) => backend.probe(container).await,
            BulkLoader::Graph(backend) => backend.probe(container).await,
        }
    }

    async fn ensure_schema<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        match self {
            BulkLoader::Tabular(backend) => backend.ensure_schema(container, plan).await,
            BulkLoader::Document(backend) => backend.ensure_schema(container, plan).await,
            BulkLoader::Graph(backend) => backend.ensure_schema(container, plan).await,
        }
    }

    async fn reset_data<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        match self {
            BulkLoader::Tabular(backend) => backend.reset_data(container, plan).await,
            BulkLoader::Document(backend) => backend.reset_data(container, plan).await,
            BulkLoader::Graph(backend) => backend.reset_data(container, plan).await,
        }
    }

    async fn load<C: Container>(
        &self,
        container: &C,
        entity: &EntitySpec,
        file: &str,
    ) -> anyhow::Result<Option<u64>> {
        match self {
            BulkLoader::Tabular(backend) => backend.load(container, entity, file).await,
            BulkLoader::Document(backend) => backend.load(container, entity, file).await,
            BulkLoader::Graph(backend) => backend.load(container, entity, file).await,
        }
    }

    async fn count<C: Container>(&self, container: &C, entity: &EntitySpec) -> anyhow::Result<Option<u64>> {
        match self {
            BulkLoader::Tabular(backend) => backend.count(container, entity).await,
            BulkLoader::Document(backend) => backend.count(container, entity).await,
            BulkLoader::Graph(backend) => backend.count(container, entity).await,
        }
    }
}

/// Parses the single number a count query printed.
fn parse_count(output: &str) -> anyhow::Result<u64> {
    let Some(line) = output.lines().rev().map(str::trim).find(|line| !line.is_empty()) else {
        anyhow::bail!("count query printed nothing");
    };
    line.parse()
        .map_err(|err| anyhow::anyhow!("cannot parse count from `{line}`: {err}"))
}
