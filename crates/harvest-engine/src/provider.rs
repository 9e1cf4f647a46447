//! Seam between the external per-source scraping adapters and the run
//! coordinator. Adapters deliver normalized [`PostingDraft`] batches;
//! everything about how they are produced stays outside this workspace.

use std::path::PathBuf;

use async_trait::async_trait;
use harvest_core::{PostingDraft, Source};
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct PageWindow {
    pub offset: u32,
    pub count: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network/proxy is down. Fatal to the current run; propagated without
    /// retries at this layer.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait BatchProvider: Send + Sync {
    /// Configuration labels expected for a source under a country; the
    /// denominator of the coverage signal.
    fn configurations(&self, source: Source, country: Option<&str>) -> Vec<String>;

    async fn fetch(
        &self,
        keyword: &str,
        source: Source,
        configuration: &str,
        page: &PageWindow,
    ) -> Result<Vec<PostingDraft>, FetchError>;
}

/// Loads draft batches from per-source JSON fixture files, so extraction can
/// run end-to-end without live adapters. Layout:
/// `<root>/<source>/<keyword-slug>.json` holding a `Vec<PostingDraft>`.
pub struct FixtureBatchProvider {
    root: PathBuf,
}

impl FixtureBatchProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn keyword_slug(keyword: &str) -> String {
        keyword
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .trim_matches('-')
            .to_string()
    }
}

#[async_trait]
impl BatchProvider for FixtureBatchProvider {
    fn configurations(&self, source: Source, country: Option<&str>) -> Vec<String> {
        vec![format!("{}-{}", source, country.unwrap_or("any"))]
    }

    async fn fetch(
        &self,
        keyword: &str,
        source: Source,
        _configuration: &str,
        _page: &PageWindow,
    ) -> Result<Vec<PostingDraft>, FetchError> {
        let path = self
            .root
            .join(source.as_str())
            .join(format!("{}.json", Self::keyword_slug(keyword)));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            // A missing fixture is an empty batch, not an error.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(FetchError::Other(anyhow::Error::new(err).context(format!(
                    "reading fixture {}",
                    path.display()
                ))))
            }
        };
        let drafts: Vec<PostingDraft> = serde_json::from_str(&text).map_err(|err| {
            FetchError::Other(anyhow::Error::new(err).context(format!(
                "parsing fixture {}",
                path.display()
            )))
        })?;
        Ok(drafts)
    }
}
