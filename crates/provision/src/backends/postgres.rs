use polystore_config::BackendConfig;
use polystore_model::{BackendKind, EntitySpec, LoadPlan};
use polystore_model::dataset::TabularSpec;

use crate::docker::{Command, Container};

/// PostgreSQL driven through `psql`.
#[derive(Debug, Clone)]
pub struct Postgres {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    database: String,
    readiness_query: Option<String>,
}

impl Postgres {
    const MAINTENANCE_DB: &str = "postgres";
    const READINESS_QUERY: &str = "SELECT 1 FROM pg_catalog.pg_database LIMIT 1";

    pub fn new(descriptor: &BackendConfig) -> Self {
        Postgres {
            host: descriptor.host.clone(),
            port: descriptor.port_for(BackendKind::Tabular),
            user: descriptor.user.clone().unwrap_or_else(|| "postgres".to_owned()),
            password: descriptor.password.clone(),
            database: descriptor.database.clone(),
            readiness_query: descriptor.readiness_query.clone(),
        }
    }

    fn psql(&self, database: &str) -> Command {
        let command = Command::new("psql")
            .args(["-X", "-v", "ON_ERROR_STOP=1"])
            .args(["-h", self.host.as_str()])
            .args(["-p", self.port.to_string().as_str()])
            .args(["-U", self.user.as_str()])
            .args(["-d", database]);
        match &self.password {
            Some(password) => command.env("PGPASSWORD", password),
            None => command,
        }
    }

    /// Unaligned, tuples-only query.
    fn query(&self, database: &str, sql: &str) -> Command {
        self.psql(database).args(["-t", "-A", "-c", sql])
    }

    async fn database_exists<C: Container>(&self, container: &C) -> anyhow::Result<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_catalog.pg_database WHERE datname = {}",
            quote_literal(&self.database)
        );
        let output = container.run_cmd(&self.query(Self::MAINTENANCE_DB, &sql)).await?;
        Ok(output.stdout.trim() == "1")
    }
}

impl super::Backend for Postgres {
    fn kind(&self) -> BackendKind {
        BackendKind::Tabular
    }

    async fn probe<C: Container>(&self, container: &C) -> anyhow::Result<()> {
        let sql = self.readiness_query.as_deref().unwrap_or(Self::READINESS_QUERY);
        container.run_cmd(&self.query(Self::MAINTENANCE_DB, sql)).await?;
        Ok(())
    }

    async fn ensure_schema<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        if !self.database_exists(container).await? {
            tracing::info!(database = %self.database, "creating database");
            let sql = format!("CREATE DATABASE {}", quote_ident(&self.database));
            container.run_cmd(&self.query(Self::MAINTENANCE_DB, &sql)).await?;
        }
        if plan.is_empty() {
            return Ok(());
        }

        let mut command = self.psql(&self.database);
        for entity in plan.load_order() {
            command = command.args(["-c", create_table(entity, plan)?.as_str()]);
        }
        container.run_cmd(&command).await?;
        Ok(())
    }

    async fn reset_data<C: Container>(&self, container: &C, plan: &LoadPlan) -> anyhow::Result<()> {
        let mut command = self.psql(&self.database);
        let mut tables = 0;
        for entity in plan.reset_order() {
            let table = tabular(entity)?;
            let sql = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", quote_ident(&table.table));
            command = command.args(["-c", sql.as_str()]);
            tables += 1;
        }
        if tables > 0 {
            container.run_cmd(&command).await?;
        }
        Ok(())
    }

    async fn load<C: Container>(
        &self,
        container: &C,
        entity: &EntitySpec,
        file: &str,
    ) -> anyhow::Result<Option<u64>> {
        let sql = copy_from(tabular(entity)?, file);
        let output = container.run_cmd(&self.psql(&self.database).args(["-c", sql.as_str()])).await?;
        let copied = output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix("COPY "))
            .and_then(|count| count.trim().parse().ok());
        if copied.is_none() {
            tracing::warn!(entity = %entity.name, stdout = %output.stdout.trim(), "psql reported no COPY count");
        }
        Ok(copied)
    }

    async fn count<C: Container>(&self, container: &C, entity: &EntitySpec) -> anyhow::Result<Option<u64>> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(&tabular(entity)?.table));
        let output = container.run_cmd(&self.query(&self.database, &sql)).await?;
        super::parse_count(&output.stdout).map(Some)
    }
}

fn tabular(entity: &EntitySpec) -> anyhow::Result<&TabularSpec> {
    entity
        .tabular
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("entity `{}` has no tabular encoding", entity.name))
}

fn create_table(entity: &EntitySpec, plan: &LoadPlan) -> anyhow::Result<String> {
    let table = tabular(entity)?;
    let mut definitions: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let not_null = if column.nullable { "" } else { " NOT NULL" };
            format!("{} {}{not_null}", quote_ident(&column.name), column.sql_type)
        })
        .collect();
    if !table.primary_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", ident_list(&table.primary_key)));
    }
    for fk in &table.foreign_keys {
        let Some(parent) = plan.find(&fk.references).and_then(|p| p.tabular.as_ref()) else {
            anyhow::bail!(
                "`{}` references `{}` which is not a tabular entity of this load",
                entity.name,
                fk.references
            );
        };
        definitions.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            ident_list(&fk.columns),
            quote_ident(&parent.table),
            ident_list(&fk.referenced_columns)
        ));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.table),
        definitions.join(", ")
    ))
}

/// Server-side `COPY` of a staged file already inside the container.
fn copy_from(table: &TabularSpec, file: &str) -> String {
    let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    format!(
        "COPY {} ({}) FROM {} WITH (FORMAT csv, HEADER {}, DELIMITER {}, NULL {})",
        quote_ident(&table.table),
        ident_list(&columns),
        quote_literal(file),
        table.header,
        quote_literal(&table.delimiter.to_string()),
        quote_literal(&table.null_token)
    )
}

fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|name| quote_ident(name.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
