use super::{Plugin, PluginError, PluginManifest};
use crate::openapi::OpenApiDoc;
use moka::future::Cache;
use reqwest::{Client, StatusCode, header};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const CACHE_CAPACITY: u64 = 256;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
struct CachedPlugin {
    plugin: Arc<Plugin>,
    etag: Option<String>,
}

/// Loads plugins from a manifest URL or a local manifest file.
///
/// Remote manifests are cached by URL and revalidated with `If-None-Match`.
#[derive(Clone)]
pub struct PluginLoader {
    client: Client,
    cache: Cache<String, CachedPlugin>,
}

impl PluginLoader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    #[tracing::instrument(name = "plugin_load", skip(self))]
    pub async fn load(&self, source: &str) -> Result<Arc<Plugin>, PluginError> {
        if is_remote(source) {
            self.load_remote(source).await
        } else {
            self.load_local(Path::new(source)).await.map(Arc::new)
        }
    }

    async fn load_remote(&self, manifest_url: &str) -> Result<Arc<Plugin>, PluginError> {
        let cached = self.cache.get(manifest_url).await;

        let mut request = self.client.get(manifest_url);
        if let Some(etag) = cached.as_ref().and_then(|c| c.etag.as_deref()) {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        let resp = request.send().await.map_err(|e| PluginError::Fetch {
            url: manifest_url.to_string(),
            reason: format!("{e}"),
        })?;

        if resp.status() == StatusCode::NOT_MODIFIED {
            if let Some(cached) = cached {
                debug!(manifest_url, "manifest not modified, using cache");
                return Ok(cached.plugin);
            }
            warn!(manifest_url, "got 304 without a cached manifest");
        }
        if !resp.status().is_success() {
            return Err(PluginError::Status {
                url: manifest_url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp.text().await.map_err(|e| PluginError::Fetch {
            url: manifest_url.to_string(),
            reason: format!("{e}"),
        })?;
        let manifest: PluginManifest =
            serde_json::from_str(&text).map_err(|e| PluginError::Manifest(format!("{e}")))?;

        let doc_url = resolve_doc_url(manifest_url, &manifest.openapi_doc_url)?;
        let doc_text = self.fetch_text(&doc_url).await?;
        let doc = OpenApiDoc::parse(&doc_text)?;

        let plugin = Arc::new(Plugin::from_manifest(manifest, doc, Some(manifest_url.to_string()))?);
        info!(plugin = %plugin.name, manifest_url, "plugin loaded");
        self.cache
            .insert(
                manifest_url.to_string(),
                CachedPlugin {
                    plugin: plugin.clone(),
                    etag,
                },
            )
            .await;
        Ok(plugin)
    }

    async fn fetch_text(&self, url: &str) -> Result<String, PluginError> {
        let resp = self.client.get(url).send().await.map_err(|e| PluginError::Fetch {
            url: url.to_string(),
            reason: format!("{e}"),
        })?;
        if !resp.status().is_success() {
            return Err(PluginError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        resp.text().await.map_err(|e| PluginError::Fetch {
            url: url.to_string(),
            reason: format!("{e}"),
        })
    }

    /// Read a manifest from disk. A relative `openapi_doc_url` is resolved
    /// against the manifest's directory, an absolute one is fetched.
    pub async fn load_local(&self, manifest_path: &Path) -> Result<Plugin, PluginError> {
        let text = read_to_string(manifest_path).await?;
        let manifest: PluginManifest =
            serde_json::from_str(&text).map_err(|e| PluginError::Manifest(format!("{e}")))?;

        let doc_text = if is_remote(&manifest.openapi_doc_url) {
            self.fetch_text(&manifest.openapi_doc_url).await?
        } else {
            let doc_path: PathBuf = manifest_path
                .parent()
                .map(|dir| dir.join(&manifest.openapi_doc_url))
                .unwrap_or_else(|| PathBuf::from(&manifest.openapi_doc_url));
            read_to_string(&doc_path).await?
        };
        let doc = OpenApiDoc::parse(&doc_text)?;

        let plugin = Plugin::from_manifest(manifest, doc, Some(manifest_path.display().to_string()))?;
        info!(plugin = %plugin.name, path = %manifest_path.display(), "plugin loaded from disk");
        Ok(plugin)
    }

    pub async fn invalidate(&self, manifest_url: &str) {
        self.cache.invalidate(manifest_url).await;
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn resolve_doc_url(manifest_url: &str, doc_url: &str) -> Result<String, PluginError> {
    let base = Url::parse(manifest_url).map_err(|_| PluginError::InvalidUrl(manifest_url.to_string()))?;
    base.join(doc_url)
        .map(|u| u.to_string())
        .map_err(|_| PluginError::InvalidUrl(doc_url.to_string()))
}

async fn read_to_string(path: &Path) -> Result<String, PluginError> {
    tokio::fs::read_to_string(path).await.map_err(|source| PluginError::Io {
        path: path.display().to_string(),
        source,
    })
}
