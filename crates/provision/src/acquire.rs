//! Fetches raw source datasets into the staging layout.
//!
//! A staged artifact is either complete or absent: sources are downloaded to
//! a scratch file, unpacked and normalized into a temporary file next to the
//! final path, and only then renamed into place.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use polystore_model::{BackendKind, EntitySpec, Normalization, StagingLayout};
use tokio::io::AsyncWriteExt;

use crate::error::AcquisitionError;

pub struct Acquirer {
    client: reqwest::Client,
    layout: StagingLayout,
}

impl Acquirer {
    pub fn new(layout: StagingLayout) -> Self {
        Acquirer {
            client: reqwest::Client::new(),
            layout,
        }
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Stages the `kind` artifact of `entity` unless it already is.
    pub async fn acquire(&self, entity: &EntitySpec, kind: BackendKind) -> Result<PathBuf, AcquisitionError> {
        let url = entity.source(kind).map(|s| s.url.as_str()).unwrap_or_default();
        if let Some(staged) = self.layout.staged(kind, &entity.name) {
            tracing::debug!(entity = %entity.name, backend = %kind, path = %staged.display(), "already staged");
            return Ok(staged);
        }
        tracing::info!(entity = %entity.name, backend = %kind, url, "acquiring");
        let records = self.stage(entity, kind).await.map_err(|cause| AcquisitionError {
            entity: entity.name.clone(),
            backend: kind,
            url: url.to_owned(),
            cause,
        })?;
        tracing::info!(entity = %entity.name, backend = %kind, lines = records, "staged");
        Ok(self.layout.path(kind, &entity.name))
    }

    /// Staged artifact of `entity`, without fetching anything.
    pub fn require_staged(&self, entity: &EntitySpec, kind: BackendKind) -> Result<PathBuf, AcquisitionError> {
        self.layout.staged(kind, &entity.name).ok_or_else(|| AcquisitionError {
            entity: entity.name.clone(),
            backend: kind,
            url: entity.source(kind).map(|s| s.url.clone()).unwrap_or_default(),
            cause: anyhow::anyhow!(
                "not staged at {} and acquisition is skipped",
                self.layout.path(kind, &entity.name).display()
            ),
        })
    }

    async fn stage(&self, entity: &EntitySpec, kind: BackendKind) -> anyhow::Result<u64> {
        let (Some(source), Some(rules)) = (entity.source(kind), entity.normalization(kind)) else {
            anyhow::bail!("entity has no {kind} encoding");
        };
        if source.is_tar_archive() && source.archive_member.is_none() {
            anyhow::bail!("{} is a tar archive but no archive_member is given", source.url);
        }
        let dir = self.layout.family_dir(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;

        let raw = tempfile::NamedTempFile::new_in(&dir)?;
        self.fetch(&source.url, raw.path()).await?;

        let url = source.url.clone();
        let member = source.archive_member.clone();
        let dest = self.layout.path(kind, &entity.name);
        tokio::task::spawn_blocking(move || publish(raw, &url, member.as_deref(), rules, &dest)).await?
    }

    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let mut response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .with_context(|| format!("GET {url}"))?;
            let mut file = tokio::fs::File::create(dest).await?;
            while let Some(chunk) = response.chunk().await.with_context(|| format!("GET {url}"))? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            tokio::fs::copy(path, dest)
                .await
                .with_context(|| format!("cannot copy {path}"))?;
        }
        Ok(())
    }
}

/// Unpacks and normalizes `raw` into a sibling temporary file, then renames
/// it onto `dest`.
fn publish(
    raw: tempfile::NamedTempFile,
    url: &str,
    member: Option<&str>,
    rules: Normalization,
    dest: &Path,
) -> anyhow::Result<u64> {
    let dir = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("staging path {} has no parent", dest.display()))?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    let source = std::fs::File::open(raw.path())?;

    let name = url.split(['?', '#']).next().unwrap_or(url);
    let lines = match (member, Compression::of(name)) {
        (Some(member), Compression::Gzip) => {
            extract_member(flate2::read::GzDecoder::new(source), member, &rules, staged.as_file_mut())?
        }
        (Some(member), _) => extract_member(source, member, &rules, staged.as_file_mut())?,
        (None, Compression::Gzip) => rules.apply(
            BufReader::new(flate2::read::GzDecoder::new(source)),
            std::io::BufWriter::new(staged.as_file_mut()),
        )?,
        (None, Compression::None) => {
            rules.apply(BufReader::new(source), std::io::BufWriter::new(staged.as_file_mut()))?
        }
    };

    staged.as_file().sync_all()?;
    staged
        .persist(dest)
        .with_context(|| format!("cannot publish {}", dest.display()))?;
    Ok(lines)
}

enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn of(name: &str) -> Self {
        if name.ends_with(".gz") || name.ends_with(".tgz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

fn extract_member<R: std::io::Read>(
    reader: R,
    member: &str,
    rules: &Normalization,
    writer: &mut std::fs::File,
) -> anyhow::Result<u64> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let entry = entry?;
        let found = {
            let path = entry.path()?;
            path.strip_prefix("./").unwrap_or(path.as_ref()) == Path::new(member)
        };
        if found {
            return rules.apply(BufReader::new(entry), std::io::BufWriter::new(writer));
        }
    }
    anyhow::bail!("archive has no member `{member}`")
}
