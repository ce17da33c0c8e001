use std::path::{Path, PathBuf};

use crate::dataset::{BackendKind, DocumentFormat, EntitySpec};

/// Directory tree holding one normalized artifact per entity and backend
/// family: `<root>/<family>/<entity>.<ext>`.
#[derive(Debug, Clone)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StagingLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn family_dir(&self, kind: BackendKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    pub fn path(&self, kind: BackendKind, entity: &str) -> PathBuf {
        self.family_dir(kind)
            .join(entity)
            .with_extension(kind.staged_extension())
    }

    /// Staged artifact if it has been published. Publication is atomic, so
    /// an existing file is always complete.
    pub fn staged(&self, kind: BackendKind, entity: &str) -> Option<PathBuf> {
        let path = self.path(kind, entity);
        path.is_file().then_some(path)
    }

    /// Staged artifacts of one family, sorted by entity name.
    pub fn list_staged(&self, kind: BackendKind) -> anyhow::Result<Vec<(String, PathBuf)>> {
        let dir = self.family_dir(kind);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        // Walk the whole directory so that io errors surface instead of
        // being skipped.
        let mut staged = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(kind.staged_extension()) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                anyhow::bail!("non utf-8 staged file name: {}", path.display());
            };
            staged.push((stem.to_owned(), path));
        }
        staged.sort();
        Ok(staged)
    }
}

/// Number of data records in a staged delimited file, honouring quoting.
pub fn count_delimited(path: &Path, delimiter: u8, header: bool) -> anyhow::Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(header)
        .flexible(true)
        .from_path(path)?;
    let mut records = 0;
    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        records += 1;
    }
    Ok(records)
}

/// Number of documents in a staged structured-record file.
pub fn count_documents(path: &Path, format: DocumentFormat) -> anyhow::Result<u64> {
    match format {
        DocumentFormat::JsonArray => {
            let file = std::io::BufReader::new(std::fs::File::open(path)?);
            let documents: Vec<serde::de::IgnoredAny> = serde_json::from_reader(file)?;
            Ok(documents.len() as u64)
        }
        DocumentFormat::JsonLines => {
            let file = std::io::BufReader::new(std::fs::File::open(path)?);
            let mut documents = 0;
            for (n, line) in std::io::BufRead::lines(file).enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(err) = serde_json::from_str::<serde::de::IgnoredAny>(&line) {
                    anyhow::bail!("{}:{}: invalid document: {err}", path.display(), n + 1);
                }
                documents += 1;
            }
            Ok(documents)
        }
    }
}

/// Record count of the staged artifact of `entity` for `kind`, when the
/// artifact is a per-record format.
pub fn expected_records(
    layout: &StagingLayout,
    entity: &EntitySpec,
    kind: BackendKind,
) -> anyhow::Result<Option<u64>> {
    match kind {
        BackendKind::Tabular => {
            let Some(tabular) = &entity.tabular else {
                return Ok(None);
            };
            let path = layout.path(kind, &entity.name);
            let count = count_delimited(&path, tabular.delimiter as u8, tabular.header)?;
            Ok(Some(count))
        }
        BackendKind::Document => {
            let Some(document) = &entity.document else {
                return Ok(None);
            };
            let path = layout.path(kind, &entity.name);
            Ok(Some(count_documents(&path, document.format)?))
        }
        // Scripts carry no record structure; graph nodes are checked against
        // the cardinality of the entity's record encodings.
        BackendKind::Graph => {
            if entity.graph.as_ref().and_then(|g| g.label.as_ref()).is_none() {
                return Ok(None);
            }
            if entity.tabular.is_some() && layout.staged(BackendKind::Tabular, &entity.name).is_some() {
                return expected_records(layout, entity, BackendKind::Tabular);
            }
            if entity.document.is_some() && layout.staged(BackendKind::Document, &entity.name).is_some() {
                return expected_records(layout, entity, BackendKind::Document);
            }
            Ok(None)
        }
    }
}
