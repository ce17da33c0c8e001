use polystore_config::BackendConfig;
use polystore_model::{BackendKind, DocumentFormat, EntitySpec, LoadPlan};
use polystore_model::dataset::DocumentSpec;

use crate::docker::{Command, Container};

/// MongoDB driven through `mongosh` and `mongoimport`.
#[derive(Debug, Clone)]
pub struct Mongo {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    database: String,
    readiness_query: Option<String>,
}

impl Mongo {
    const PING: &str = "db.adminCommand({ ping: 1 }).ok";
    const AUTH_DB: &str = "admin";

    pub fn new(descriptor: &BackendConfig) -> Self {
        Mongo {
            host: descriptor.host.clone(),
            port: descriptor.port_for(BackendKind::Document),
            user: descriptor.user.clone(),
            password: descriptor.password.clone(),
            database: descriptor.database.clone(),
            readiness_query: descriptor.readiness_query.clone(),
        }
    }

    /// Connection and credential flags shared by both tools.
    fn connect(&self, program: &str) -> Command {
        let mut command = Command::new(program)
            .args(["--host", self.host.as_str()])
            .args(["--port", self.port.to_string().as_str()]);
        if let Some(user) = &self.user {
            command = command
                .args(["--username", user.as_str()])
                .args(["--authenticationDatabase", Self::AUTH_DB]);
        }
        if let Some(password) = &self.password {
            command = command.arg("--password").secret_arg(password);
        }
        command
    }

    fn eval(&self, script: &str) -> Command {
        self.connect("mongosh")
            .arg("--quiet")
            .arg(&self.database)
            .args(["--eval", script])
    }
}

impl super::Backend for Mongo {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn probe<C: Container>(&self, container: &C) -> anyhow::Result<()> {
        if let Some(script) = &self.readiness_query {
            container.run_cmd(&self.eval(script)).await?;
            return Ok(());
        }
        let output = container.run_cmd(&self.eval(Self::PING)).await?;
        match output.stdout.trim() {
            "1" => Ok(()),
            reply => anyhow::bail!("ping answered `{reply}`"),
        }
    }

    async fn ensure_schema<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        let collections = collection_list(plan)?;
        if collections == "[]" {
            return Ok(());
        }
        let script = format!(
            "const existing = db.getCollectionNames(); \
             for (const name of {collections}) {{ \
             if (!existing.includes(name)) {{ db.createCollection(name); }} }}"
        );
        container.run_cmd(&self.eval(&script)).await?;
        Ok(())
    }

    async fn reset_data<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        let collections = collection_list(plan)?;
        if collections == "[]" {
            return Ok(());
        }
        let script = format!("for (const name of {collections}) {{ db.getCollection(name).deleteMany({{}}); }}");
        container.run_cmd(&self.eval(&script)).await?;
        Ok(())
    }

    async fn load<C: Container>(
        &self,
        container: &C,
        entity: &EntitySpec,
        file: &str,
    ) -> anyhow::Result<Option<u64>> {
        let document = document(entity)?;
        let mut command = self
            .connect("mongoimport")
            .args(["--db", self.database.as_str()])
            .args(["--collection", document.collection.as_str()])
            .args(["--file", file])
            .arg("--drop");
        if document.format == DocumentFormat::JsonArray {
            command = command.arg("--jsonArray");
        }
        let output = container.run_cmd(&command).await?;
        // mongoimport logs its summary on stderr.
        Ok(imported(&output.stderr).or_else(|| imported(&output.stdout)))
    }

    async fn count<C: Container>(&self, container: &C, entity: &EntitySpec) -> anyhow::Result<Option<u64>> {
        let script = format!(
            "db.getCollection(\"{}\").countDocuments()",
            document(entity)?.collection
        );
        let output = container.run_cmd(&self.eval(&script)).await?;
        super::parse_count(&output.stdout).map(Some)
    }
}

fn document(entity: &EntitySpec) -> anyhow::Result<&DocumentSpec> {
    entity
        .document
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("entity `{}` has no document encoding", entity.name))
}

/// Collections of the plan as a JavaScript array literal.
fn collection_list(plan: &LoadPlan) -> anyhow::Result<String> {
    let names = plan
        .load_order()
        .map(|entity| document(entity).map(|d| format!("\"{}\"", d.collection)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(format!("[{}]", names.join(", ")))
}

/// Parses `<n> document(s) imported successfully`.
fn imported(log: &str) -> Option<u64> {
    log.lines().find_map(|line| {
        let (before, _) = line.split_once(" document(s) imported")?;
        before.split_whitespace().last()?.parse().ok()
    })
}
