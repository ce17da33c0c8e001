//! Declarative dataset specification.
//!
//! One [`EntitySpec`] describes a logical entity together with the physical
//! encodings it has for each backend family. Every encoding is optional; an
//! entity only takes part in the pipelines it declares an encoding for.

/// Backend family a staged artifact or load job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Tabular,
    Document,
    Graph,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Tabular, BackendKind::Document, BackendKind::Graph];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Tabular => "tabular",
            BackendKind::Document => "document",
            BackendKind::Graph => "graph",
        }
    }

    /// Extension of the staged artifact for this family.
    pub fn staged_extension(&self) -> &'static str {
        match self {
            BackendKind::Tabular => "csv",
            BackendKind::Document => "json",
            BackendKind::Graph => "cypher",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tabular" => Ok(BackendKind::Tabular),
            "document" => Ok(BackendKind::Document),
            "graph" => Ok(BackendKind::Graph),
            _ => anyhow::bail!("unknown backend: {s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default)]
    pub tabular: Option<TabularSpec>,
    #[serde(default)]
    pub document: Option<DocumentSpec>,
    #[serde(default)]
    pub graph: Option<GraphSpec>,
}

impl EntitySpec {
    pub fn has_encoding(&self, kind: BackendKind) -> bool {
        self.source(kind).is_some()
    }

    /// Where the raw artifact for `kind` comes from, if the entity has one.
    pub fn source(&self, kind: BackendKind) -> Option<&SourceSpec> {
        match kind {
            BackendKind::Tabular => self.tabular.as_ref().map(|t| &t.source),
            BackendKind::Document => self.document.as_ref().map(|d| &d.source),
            BackendKind::Graph => self.graph.as_ref().map(|g| &g.source),
        }
    }

    /// Normalization rules applied while staging the artifact for `kind`.
    pub fn normalization(&self, kind: BackendKind) -> Option<crate::normalize::Normalization> {
        let source = self.source(kind)?;
        let delimiter = match kind {
            BackendKind::Tabular => self.tabular.as_ref().map(|t| t.delimiter as u8),
            _ => None,
        };
        Some(source.normalize.rules(delimiter))
    }

    /// Entities this one references through tabular foreign keys.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.tabular
            .iter()
            .flat_map(|t| t.foreign_keys.iter())
            .map(|fk| fk.references.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct SourceSpec {
    /// `http(s)://` URL, `file://` URL or a plain filesystem path.
    pub url: String,
    /// File to extract when `url` points at a tar archive.
    #[serde(default)]
    pub archive_member: Option<String>,
    #[serde(default)]
    pub normalize: NormalizeSpec,
}

impl SourceSpec {
    /// Whether `url` names a tar archive, compressed or not.
    pub fn is_tar_archive(&self) -> bool {
        let name = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct NormalizeSpec {
    #[serde(default = "default_true")]
    pub strip_carriage_returns: bool,
    #[serde(default = "default_true")]
    pub strip_trailing_delimiter: bool,
}

impl Default for NormalizeSpec {
    fn default() -> Self {
        NormalizeSpec {
            strip_carriage_returns: true,
            strip_trailing_delimiter: true,
        }
    }
}

impl NormalizeSpec {
    fn rules(&self, delimiter: Option<u8>) -> crate::normalize::Normalization {
        crate::normalize::Normalization {
            strip_carriage_returns: self.strip_carriage_returns,
            trailing_delimiter: delimiter.filter(|_| self.strip_trailing_delimiter),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct TabularSpec {
    pub source: SourceSpec,
    pub table: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub null_token: String,
    #[serde(default = "default_true")]
    pub header: bool,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ForeignKeySpec {
    pub columns: Vec<String>,
    /// Name of the referenced entity.
    pub references: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentFormat {
    #[default]
    JsonLines,
    JsonArray,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DocumentSpec {
    pub source: SourceSpec,
    pub collection: String,
    #[serde(default)]
    pub format: DocumentFormat,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct GraphSpec {
    pub source: SourceSpec,
    /// Node label counted after the script ran.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> char {
    ','
}
