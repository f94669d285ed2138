use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use super::{
    Candidate, ContentStore, Enumerated, FetchError, FetchedManifest, HttpFetcher, SourceKind,
    SourceProbe, read_local_manifest,
};
use crate::manifest::{MAX_MANIFEST_SIZE, PLUGIN_CONFIG_DIR, manifest_path};

/// A single explicitly configured manifest location.
///
/// `file://` URLs and opaque share paths may point at a manifest file or at a
/// plugin root. `http(s)://` URLs name the manifest itself; its root is a
/// staging directory holding only that manifest.
pub struct DirectUrlProbe {
    locator: String,
    http: HttpFetcher,
    store: ContentStore,
}

#[derive(Debug, PartialEq, Eq)]
enum Target {
    Local(PathBuf),
    Remote(String),
}

impl DirectUrlProbe {
    pub fn new(locator: impl Into<String>, http: HttpFetcher, store: ContentStore) -> Self {
        Self {
            locator: locator.into(),
            http,
            store,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    fn target(locator: &str) -> Result<Target, FetchError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Ok(Target::Remote(locator.to_string()));
        }
        if locator.starts_with("file://") {
            let url = url::Url::parse(locator)
                .map_err(|e| FetchError::Unsupported(format!("{locator}: {e}")))?;
            let path = url
                .to_file_path()
                .map_err(|_| FetchError::Unsupported(format!("not a local file URL: {locator}")))?;
            return Ok(Target::Local(path));
        }
        if let Some((scheme, _)) = locator.split_once("://") {
            return Err(FetchError::Unsupported(format!("scheme '{scheme}' in {locator}")));
        }
        Ok(Target::Local(PathBuf::from(locator)))
    }

    async fn fetch_remote(&self, url: &str) -> Result<FetchedManifest, FetchError> {
        let bytes = self
            .http
            .get_bytes(url, None, MAX_MANIFEST_SIZE as u64 * 4)
            .await?;

        let root = self.store.direct_dir(url);
        let path = manifest_path(&root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        Ok(FetchedManifest { bytes, root })
    }
}

/// Root directory for a local manifest file or plugin directory.
fn local_root(path: &Path) -> PathBuf {
    if path.is_dir() {
        return path.to_path_buf();
    }
    let parent = path.parent().unwrap_or(Path::new("."));
    if parent.file_name().is_some_and(|n| n == PLUGIN_CONFIG_DIR) {
        parent.parent().unwrap_or(parent).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

#[async_trait]
impl SourceProbe for DirectUrlProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::DirectUrl
    }

    fn describe(&self) -> String {
        format!("manifest {}", self.locator)
    }

    fn enumerate(&self) -> BoxStream<'_, Enumerated> {
        stream::iter([Ok(Candidate::new(SourceKind::DirectUrl, self.locator.clone()))]).boxed()
    }

    async fn fetch_manifest(&self, candidate: &Candidate) -> Result<FetchedManifest, FetchError> {
        match Self::target(&candidate.locator)? {
            Target::Remote(url) => self.fetch_remote(&url).await,
            Target::Local(path) if path.is_dir() => read_local_manifest(path).await,
            Target::Local(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        FetchError::NotFound(path.display().to_string())
                    } else {
                        FetchError::Io(e)
                    }
                })?;
                Ok(FetchedManifest {
                    bytes: Bytes::from(bytes),
                    root: local_root(&path),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::RetryPolicy;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn probe(locator: &str, store: &Path) -> DirectUrlProbe {
        DirectUrlProbe::new(
            locator,
            HttpFetcher::new(RetryPolicy::default()).unwrap(),
            ContentStore::new(store),
        )
    }

    fn write_plugin(root: &Path) -> PathBuf {
        let manifest = manifest_path(root);
        std::fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        std::fs::write(&manifest, r#"{"name":"direct","version":"1.0.0"}"#).unwrap();
        manifest
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            DirectUrlProbe::target("https://x.example/plugin.json").unwrap(),
            Target::Remote("https://x.example/plugin.json".into())
        );
        assert_eq!(
            DirectUrlProbe::target("file:///srv/plugins/a").unwrap(),
            Target::Local(PathBuf::from("/srv/plugins/a"))
        );
        assert_eq!(
            DirectUrlProbe::target("//share/plugins/a").unwrap(),
            Target::Local(PathBuf::from("//share/plugins/a"))
        );
        assert!(DirectUrlProbe::target("ftp://x/plugin.json").is_err());
    }

    #[tokio::test]
    async fn test_single_candidate() {
        let dir = tempdir().unwrap();
        let probe = probe("file:///tmp/x", dir.path());
        let items: Vec<_> = probe.enumerate().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().source_kind, SourceKind::DirectUrl);
    }

    #[tokio::test]
    async fn test_file_url_to_manifest() {
        let dir = tempdir().unwrap();
        let plugin = dir.path().join("direct");
        let manifest = write_plugin(&plugin);

        let locator = url::Url::from_file_path(&manifest).unwrap().to_string();
        let probe = probe(&locator, dir.path());
        let fetched = probe
            .fetch_manifest(&Candidate::new(SourceKind::DirectUrl, locator))
            .await
            .unwrap();
        assert_eq!(fetched.root, plugin);
    }

    #[tokio::test]
    async fn test_share_path_to_root() {
        let dir = tempdir().unwrap();
        let plugin = dir.path().join("direct");
        write_plugin(&plugin);

        let locator = plugin.display().to_string();
        let probe = probe(&locator, dir.path());
        let fetched = probe
            .fetch_manifest(&Candidate::new(SourceKind::DirectUrl, locator))
            .await
            .unwrap();
        assert_eq!(fetched.root, plugin);
    }

    #[tokio::test]
    async fn test_http_manifest_is_staged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plugin.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"name":"remote","version":"0.1.0"}"#),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let locator = format!("{}/plugin.json", server.uri());
        let probe = probe(&locator, dir.path());
        let fetched = probe
            .fetch_manifest(&Candidate::new(SourceKind::DirectUrl, locator))
            .await
            .unwrap();

        assert!(fetched.root.starts_with(dir.path()));
        let staged = std::fs::read(manifest_path(&fetched.root)).unwrap();
        assert_eq!(staged, fetched.bytes.to_vec());
    }
}
