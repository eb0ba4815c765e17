//! On-disk HTTP response cache
//!
//! Only successful GET responses that explicitly allow caching through
//! `Cache-Control: max-age` are stored. Each entry is a body file
//! `{sha256(url)}.cache` plus a JSON sidecar `{sha256(url)}.meta`.
//! The directory is kept under a byte budget by dropping the oldest entries.

use crate::core::error::Result;
use crate::network::http_client::HttpResponse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    /// Requested URL, the cache key
    url: String,
    /// Final URL after redirects
    #[serde(default)]
    response_url: Option<String>,
    status: u16,
    headers: HashMap<String, String>,
    stored_at: i64,
    max_age_secs: u64,
}

#[derive(Debug)]
struct EntryInfo {
    body_path: PathBuf,
    meta_path: PathBuf,
    size: u64,
    stored_at: i64,
}

/// Freshness lifetime granted by a `Cache-Control` header value
pub fn cache_max_age(cache_control: &str) -> Option<u64> {
    let directives: Vec<String> = cache_control
        .split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .collect();

    if directives
        .iter()
        .any(|d| d == "no-store" || d == "no-cache" || d == "private")
    {
        return None;
    }

    directives
        .iter()
        .find_map(|d| d.strip_prefix("max-age=").and_then(|v| v.trim_matches('"').parse().ok()))
        .filter(|age: &u64| *age > 0)
}

pub struct ResponseCache {
    cache_dir: PathBuf,
    max_bytes: u64,
}

impl ResponseCache {
    /// Create the cache, making sure its directory exists
    pub fn new(cache_dir: PathBuf, max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            max_bytes,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let hash = format!("{:x}", Sha256::digest(url.as_bytes()));
        (
            self.cache_dir.join(format!("{}.cache", hash)),
            self.cache_dir.join(format!("{}.meta", hash)),
        )
    }

    /// Fresh cached response for `url`, if any
    pub async fn get(&self, url: &str) -> Option<HttpResponse> {
        let (body_path, meta_path) = self.entry_paths(url);

        let meta_raw = tokio::fs::read(&meta_path).await.ok()?;
        let meta: EntryMeta = match serde_json::from_slice(&meta_raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(url = %url, error = %e, "Dropping unreadable cache entry");
                self.remove_paths(&body_path, &meta_path).await;
                return None;
            }
        };

        // Hash collisions are not worth serving
        if meta.url != url {
            return None;
        }

        let age_ms = chrono::Utc::now().timestamp_millis() - meta.stored_at;
        if age_ms < 0 || age_ms as u64 >= meta.max_age_secs.saturating_mul(1000) {
            debug!(url = %url, "Cache entry expired");
            self.remove_paths(&body_path, &meta_path).await;
            return None;
        }

        let body = tokio::fs::read(&body_path).await.ok()?;
        Some(HttpResponse {
            url: meta.response_url.unwrap_or(meta.url),
            status: meta.status,
            headers: meta.headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Store a response when its headers allow it
    ///
    /// Entries are keyed on the requested `url` so redirected responses are
    /// found again. Returns whether the response was written.
    pub async fn put(&self, url: &str, response: &HttpResponse) -> Result<bool> {
        if response.status != 200 {
            return Ok(false);
        }
        let Some(max_age_secs) = response.header("cache-control").and_then(cache_max_age) else {
            return Ok(false);
        };
        if response.body.len() as u64 > self.max_bytes {
            return Ok(false);
        }

        let (body_path, meta_path) = self.entry_paths(url);
        let meta = EntryMeta {
            url: url.to_string(),
            response_url: (response.url != url).then(|| response.url.clone()),
            status: response.status,
            headers: response.headers.clone(),
            stored_at: chrono::Utc::now().timestamp_millis(),
            max_age_secs,
        };

        tokio::fs::write(&body_path, response.body.as_bytes()).await?;
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;

        self.enforce_limits().await?;
        Ok(true)
    }

    async fn remove_paths(&self, body_path: &Path, meta_path: &Path) {
        let _ = tokio::fs::remove_file(body_path).await;
        let _ = tokio::fs::remove_file(meta_path).await;
    }

    async fn list_entries(&self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.cache_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let body_path = entry.path();
            if body_path.extension().and_then(|s| s.to_str()) != Some("cache") {
                continue;
            }
            let meta_path = body_path.with_extension("meta");

            let body_size = entry.metadata().await?.len();
            let (meta_size, stored_at) = match tokio::fs::read(&meta_path).await {
                Ok(raw) => {
                    let stored_at = serde_json::from_slice::<EntryMeta>(&raw)
                        .map(|m| m.stored_at)
                        .unwrap_or(0);
                    (raw.len() as u64, stored_at)
                }
                Err(_) => (0, 0),
            };

            entries.push(EntryInfo {
                body_path,
                meta_path,
                size: body_size + meta_size,
                stored_at,
            });
        }

        Ok(entries)
    }

    /// Total bytes held by cache entries
    pub async fn size_bytes(&self) -> Result<u64> {
        Ok(self.list_entries().await?.iter().map(|e| e.size).sum())
    }

    /// Remove oldest entries until the byte budget is respected
    pub async fn enforce_limits(&self) -> Result<usize> {
        let mut entries = self.list_entries().await?;
        entries.sort_by_key(|e| e.stored_at);

        let mut current_size: u64 = entries.iter().map(|e| e.size).sum();
        if current_size <= self.max_bytes {
            return Ok(0);
        }

        info!(
            size = current_size,
            budget = self.max_bytes,
            "Response cache over budget, evicting oldest entries"
        );

        let mut removed = 0;
        for entry in entries {
            if current_size <= self.max_bytes {
                break;
            }
            if let Err(e) = tokio::fs::remove_file(&entry.body_path).await {
                warn!("Failed to delete cache file {}: {}", entry.body_path.display(), e);
                continue;
            }
            let _ = tokio::fs::remove_file(&entry.meta_path).await;

            current_size = current_size.saturating_sub(entry.size);
            removed += 1;
        }

        debug!(removed, "Response cache cleanup complete");
        Ok(removed)
    }

    /// Drop every entry
    pub async fn clear(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.list_entries().await? {
            self.remove_paths(&entry.body_path, &entry.meta_path).await;
            count += 1;
        }
        Ok(count)
    }
}
