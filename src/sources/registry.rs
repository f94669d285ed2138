use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Deserialize;
use tracing::debug;

use super::{
    Candidate, ContentStore, Enumerated, FetchError, FetchedManifest, HttpFetcher,
    SourceDiagnostic, SourceKind, SourceProbe, capped, read_local_manifest,
};
use crate::config::RegistryEndpoint;

/// Response of `GET {endpoint}/search?q=`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub plugins: Vec<RegistryHit>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHit {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub download_url: String,
    /// blake3 of the archive, hex encoded.
    #[serde(default)]
    pub digest: Option<String>,
}

/// Searches a remote plugin registry.
///
/// Hits become candidates whose locator is the archive download URL; nothing
/// is downloaded until [`SourceProbe::fetch_manifest`].
pub struct RegistryProbe {
    endpoint: RegistryEndpoint,
    http: HttpFetcher,
    store: ContentStore,
    max_candidates: usize,
}

impl RegistryProbe {
    pub fn new(
        endpoint: RegistryEndpoint,
        http: HttpFetcher,
        store: ContentStore,
        max_candidates: usize,
    ) -> Self {
        Self {
            endpoint,
            http,
            store,
            max_candidates,
        }
    }

    pub fn search_url(&self) -> Result<url::Url, FetchError> {
        let base = format!("{}/search", self.endpoint.url.trim_end_matches('/'));
        let mut url = url::Url::parse(&base)
            .map_err(|e| FetchError::Unsupported(format!("{}: {e}", self.endpoint.url)))?;
        url.query_pairs_mut()
            .append_pair("q", self.endpoint.query.as_deref().unwrap_or(""));
        Ok(url)
    }

    async fn search(&self) -> Result<Vec<RegistryHit>, FetchError> {
        let url = self.search_url()?;
        let response: SearchResponse = self
            .http
            .get_json(url.as_str(), self.endpoint.auth_token.as_ref())
            .await?;
        debug!(
            registry = %self.endpoint.url,
            hits = response.plugins.len(),
            "Registry search complete"
        );
        Ok(response.plugins)
    }
}

#[async_trait]
impl SourceProbe for RegistryProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    fn describe(&self) -> String {
        format!("registry {}", self.endpoint.url)
    }

    fn enumerate(&self) -> BoxStream<'_, Enumerated> {
        let hits = stream::once(self.search())
            .flat_map(|result| {
                let items: Vec<Enumerated> = match result {
                    Ok(hits) => hits
                        .into_iter()
                        .map(|hit| {
                            Ok(Candidate::new(SourceKind::Registry, hit.download_url)
                                .with_digest(hit.digest))
                        })
                        .collect(),
                    Err(e) => vec![Err(SourceDiagnostic::new(
                        SourceKind::Registry,
                        self.endpoint.url.clone(),
                        e,
                    ))],
                };
                stream::iter(items)
            })
            .boxed();
        capped(hits, SourceKind::Registry, self.max_candidates)
    }

    async fn fetch_manifest(&self, candidate: &Candidate) -> Result<FetchedManifest, FetchError> {
        let root = self
            .store
            .fetch_archive(&self.http, &candidate.locator, candidate.digest.as_deref())
            .await?;
        read_local_manifest(root).await
    }
}
