use polystore_config::BackendConfig;
use polystore_model::{BackendKind, EntitySpec, LoadPlan};

use crate::docker::{Command, Container};

/// Neo4j driven through `cypher-shell`. Loads are scripts, so the backend
/// only reports counts for entities declaring a node label.
#[derive(Debug, Clone)]
pub struct Neo4j {
    address: String,
    user: String,
    password: Option<String>,
    database: String,
    readiness_query: Option<String>,
}

impl Neo4j {
    const READINESS_QUERY: &str = "RETURN 1";
    const CLEAR: &str = "MATCH (n) DETACH DELETE n";

    pub fn new(descriptor: &BackendConfig) -> Self {
        Neo4j {
            address: format!(
                "neo4j://{}:{}",
                descriptor.host,
                descriptor.port_for(BackendKind::Graph)
            ),
            user: descriptor.user.clone().unwrap_or_else(|| "neo4j".to_owned()),
            password: descriptor.password.clone(),
            database: descriptor.database.clone(),
            readiness_query: descriptor.readiness_query.clone(),
        }
    }

    fn cypher_shell(&self) -> Command {
        let command = Command::new("cypher-shell")
            .args(["-a", self.address.as_str()])
            .args(["-u", self.user.as_str()])
            .args(["-d", self.database.as_str()])
            .args(["--format", "plain"]);
        match &self.password {
            Some(password) => command.env("NEO4J_PASSWORD", password),
            None => command,
        }
    }
}

impl super::Backend for Neo4j {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    async fn probe<C: Container>(&self, container: &C) -> anyhow::Result<()> {
        let query = self.readiness_query.as_deref().unwrap_or(Self::READINESS_QUERY);
        container.run_cmd(&self.cypher_shell().arg(query)).await?;
        Ok(())
    }

    async fn ensure_schema<C: Container>(&self, _container: &C, _plan: &LoadPlan) -> anyhow::Result<()> {
        tracing::debug!("graph backend is schema-less");
        Ok(())
    }

    /// Scripts create nodes and relationships across entities, so the whole
    /// database is cleared rather than per label.
    async fn reset_data<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        container.run_cmd(&self.cypher_shell().arg(Self::CLEAR)).await?;
        Ok(())
    }

    async fn load<C: Container>(
        &self,
        container: &C,
        _entity: &EntitySpec,
        file: &str,
    ) -> anyhow::Result<Option<u64>> {
        container.run_cmd(&self.cypher_shell().args(["-f", file])).await?;
        Ok(None)
    }

    async fn count<C: Container>(&self, container: &C, entity: &EntitySpec) -> anyhow::Result<Option<u64>> {
        let Some(label) = entity.graph.as_ref().and_then(|g| g.label.as_deref()) else {
            return Ok(None);
        };
        let query = format!("MATCH (n:`{label}`) RETURN count(n)");
        let output = container.run_cmd(&self.cypher_shell().arg(query)).await?;
        super::parse_count(&output.stdout).map(Some)
    }
}
