//! Orchestrator configuration: staging area, readiness policy, backend
//! connection descriptors and the dataset specification.
//!
//! Loaded from a TOML file, then overridden by `POLYSTORE__`-prefixed
//! environment variables (`POLYSTORE__BACKENDS__TABULAR__PASSWORD=...`).

mod serde_duration;

use polystore_model::{BackendKind, EntitySpec, PlanError};

pub const ENV_PREFIX: &str = "POLYSTORE";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub staging: StagingConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    pub backends: Backends,
    #[serde(rename = "entity", default)]
    pub entities: Vec<EntitySpec>,
}

impl Config {
    pub fn from_file(config_file: &std::path::Path) -> Result<Self, ConfigError> {
        let environment = config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR);
        Self::from_sources(config_file, environment)
    }

    fn from_sources(
        config_file: &std::path::Path,
        environment: config::Environment,
    ) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(config_file).format(config::FileFormat::Toml))
            .add_source(environment)
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(invalid("no [[entity]] declared"));
        }
        if self.readiness.max_attempts == 0 {
            return Err(invalid("readiness.max_attempts must be at least 1"));
        }

        for entity in &self.entities {
            check_name("entity name", &entity.name)?;
            if !BackendKind::ALL.iter().any(|kind| entity.has_encoding(*kind)) {
                return Err(invalid(format!("entity `{}` has no backend encoding", entity.name)));
            }
            for kind in BackendKind::ALL {
                if entity.has_encoding(kind) && self.backends.get(kind).is_none() {
                    return Err(invalid(format!(
                        "entity `{}` has a {kind} encoding but [backends.{kind}] is not configured",
                        entity.name
                    )));
                }
                if let Some(source) = entity.source(kind) {
                    if source.is_tar_archive() && source.archive_member.is_none() {
                        return Err(invalid(format!(
                            "entity `{}`: {kind} source {} is a tar archive and needs an archive_member",
                            entity.name, source.url
                        )));
                    }
                }
            }
            if let Some(tabular) = &entity.tabular {
                check_name("table", &tabular.table)?;
                if !tabular.delimiter.is_ascii() {
                    return Err(invalid(format!(
                        "entity `{}`: delimiter must be a single ascii character",
                        entity.name
                    )));
                }
                if tabular.columns.is_empty() {
                    return Err(invalid(format!("entity `{}` declares no columns", entity.name)));
                }
                for fk in &tabular.foreign_keys {
                    if fk.columns.is_empty() || fk.columns.len() != fk.referenced_columns.len() {
                        return Err(invalid(format!(
                            "entity `{}`: foreign key to `{}` must pair each column with a referenced column",
                            entity.name, fk.references
                        )));
                    }
                    let parent = self.entities.iter().find(|e| e.name == fk.references);
                    if parent.is_some_and(|p| p.tabular.is_none()) {
                        return Err(invalid(format!(
                            "entity `{}` references `{}` which has no tabular encoding",
                            entity.name, fk.references
                        )));
                    }
                }
            }
            if let Some(document) = &entity.document {
                check_name("collection", &document.collection)?;
            }
            if let Some(label) = entity.graph.as_ref().and_then(|g| g.label.as_deref()) {
                check_name("graph label", label)?;
            }
        }

        polystore_model::plan::dependency_order(&self.entities)?;
        Ok(())
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_owned(),
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct StagingConfig {
    pub dir: std::path::PathBuf,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "serde_duration::deserialize")]
    pub interval: std::time::Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig {
            max_attempts: 30,
            interval: std::time::Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct Backends {
    #[serde(default)]
    pub tabular: Option<BackendConfig>,
    #[serde(default)]
    pub document: Option<BackendConfig>,
    #[serde(default)]
    pub graph: Option<BackendConfig>,
}

impl Backends {
    /// Descriptor of an enabled backend.
    pub fn get(&self, kind: BackendKind) -> Option<&BackendConfig> {
        let backend = match kind {
            BackendKind::Tabular => self.tabular.as_ref(),
            BackendKind::Document => self.document.as_ref(),
            BackendKind::Graph => self.graph.as_ref(),
        };
        backend.filter(|b| b.enabled)
    }
}

/// Connection descriptor of one backend and the container hosting it.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub container: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    /// `host:container` port bindings used when the container is created.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
    /// Replaces the built-in readiness probe.
    #[serde(default)]
    pub readiness_query: Option<String>,
}

impl BackendConfig {
    pub fn port_for(&self, kind: BackendKind) -> u16 {
        self.port.unwrap_or(match kind {
            BackendKind::Tabular => 5432,
            BackendKind::Document => 27017,
            BackendKind::Graph => 7687,
        })
    }
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Names end up inside SQL, JavaScript and Cypher text.
fn check_name(what: &str, name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(invalid(format!("{what} `{name}` must match [A-Za-z_][A-Za-z0-9_]*")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[staging]
dir = "/tmp/polystore-staging"

[readiness]
max_attempts = 5
interval = "250ms"

[backends.tabular]
container = "polystore-postgres"
image = "postgres:16"
env = ["POSTGRES_PASSWORD=postgres"]
ports = ["5432:5432"]
user = "postgres"
password = "postgres"
database = "northwind"

[backends.document]
container = "polystore-mongo"
image = "mongo:7"
database = "northwind"

[[entity]]
name = "customers"

[entity.tabular]
table = "customers"
source = { url = "https://example.com/customers.csv" }
columns = [
    { name = "customer_id", type = "text", nullable = false },
    { name = "company_name", type = "text" },
]
primary_key = ["customer_id"]

[entity.document]
collection = "customers"
format = "json-array"
source = { url = "https://example.com/customers.json" }

[[entity]]
name = "orders"

[entity.tabular]
table = "orders"
delimiter = ";"
null_token = "NULL"
source = { url = "archive.tar.gz", archive_member = "orders.csv" }
columns = [{ name = "order_id", type = "integer", nullable = false }]
foreign_keys = [{ columns = ["customer_id"], references = "customers", referenced_columns = ["customer_id"] }]
"#;

    fn write_config(content: &str) -> anyhow::Result<tempfile::NamedTempFile> {
        let file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        std::fs::write(file.path(), content)?;
        Ok(file)
    }

    fn no_env() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .source(Some(Default::default()))
    }

    #[test]
    fn reads_full_config() -> anyhow::Result<()> {
        let file = write_config(CONFIG)?;
        let config = Config::from_sources(file.path(), no_env())?;

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.readiness.max_attempts, 5);
        assert_eq!(config.readiness.interval, std::time::Duration::from_millis(250));
        assert_eq!(config.entities.len(), 2);

        let tabular = config.backends.get(BackendKind::Tabular).expect("tabular backend");
        assert_eq!(tabular.host, "localhost");
        assert_eq!(tabular.port_for(BackendKind::Tabular), 5432);
        assert!(config.backends.get(BackendKind::Graph).is_none());

        let orders = config.entities[1].tabular.as_ref().expect("orders table");
        assert_eq!(orders.delimiter, ';');
        assert_eq!(orders.null_token, "NULL");
        assert_eq!(orders.source.archive_member.as_deref(), Some("orders.csv"));
        Ok(())
    }

    #[test]
    fn environment_overrides_file() -> anyhow::Result<()> {
        let file = write_config(CONFIG)?;
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .source(Some(
                [(
                    "POLYSTORE__BACKENDS__TABULAR__PASSWORD".to_owned(),
                    "s3cret".to_owned(),
                )]
                .into_iter()
                .collect(),
            ));
        let config = Config::from_sources(file.path(), env)?;
        let tabular = config.backends.get(BackendKind::Tabular).expect("tabular backend");
        assert_eq!(tabular.password.as_deref(), Some("s3cret"));
        Ok(())
    }

    #[test]
    fn rejects_encoding_without_backend() -> anyhow::Result<()> {
        let content = CONFIG.replace(
            "[[entity]]\nname = \"orders\"",
            "[[entity]]\nname = \"orders\"\n\n[entity.graph]\nsource = { url = \"orders.cypher\" }",
        );
        let file = write_config(&content)?;
        let err = Config::from_sources(file.path(), no_env()).expect_err("graph backend missing");
        assert!(err.to_string().contains("[backends.graph]"), "{err}");
        Ok(())
    }

    #[test]
    fn rejects_tarball_without_member() -> anyhow::Result<()> {
        let content = CONFIG.replace(
            "{ url = \"archive.tar.gz\", archive_member = \"orders.csv\" }",
            "{ url = \"archive.tar.gz\" }",
        );
        let file = write_config(&content)?;
        let err = Config::from_sources(file.path(), no_env()).expect_err("member missing");
        assert!(err.to_string().contains("needs an archive_member"), "{err}");
        Ok(())
    }

    #[test]
    fn rejects_unknown_foreign_key_target() -> anyhow::Result<()> {
        let content = CONFIG.replace("references = \"customers\"", "references = \"clients\"");
        let file = write_config(&content)?;
        let err = Config::from_sources(file.path(), no_env()).expect_err("unknown reference");
        assert!(matches!(err, ConfigError::Plan(PlanError::UnknownReference { .. })), "{err}");
        Ok(())
    }

    #[test]
    fn sample_config_is_valid() -> anyhow::Result<()> {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../polystore.toml");
        let config = Config::from_sources(&path, no_env())?;
        assert_eq!(config.entities.len(), 4);
        assert!(BackendKind::ALL.iter().all(|kind| config.backends.get(*kind).is_some()));

        let order = polystore_model::plan::dependency_order(&config.entities)?;
        let names: Vec<_> = order.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "products", "orders", "order_details"]);
        Ok(())
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(check_name("table", "order_details").is_ok());
        assert!(check_name("table", "_x1").is_ok());
        assert!(check_name("table", "1x").is_err());
        assert!(check_name("table", "x; DROP TABLE y").is_err());
        assert!(check_name("table", "").is_err());
    }
}
