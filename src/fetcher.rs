use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;
use crate::index::DiscoveredLink;

/// Anything that can hand back the bytes behind a URL.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| TransportError::Http {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let http = |source| TransportError::Http {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(http)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(http)?;
        Ok(bytes.to_vec())
    }
}

pub fn resolve(base: &Url, href: &str) -> Result<Url, TransportError> {
    base.join(href.trim()).map_err(|source| TransportError::InvalidUrl {
        url: href.to_string(),
        source,
    })
}

/// Date-partitioned document directory: `root/YYYY-MM-DD/<file>`.
///
/// Each stored file has a `<file>.src` marker holding the URL it came from.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, date: NaiveDate, url: &Url) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(file_name(url))
    }

    /// Where `url` is kept for `date`: the plain file name, unless a different
    /// URL already owns it, then the name gets a short hash of the URL.
    pub async fn locate(&self, date: NaiveDate, url: &Url) -> Result<PathBuf, TransportError> {
        let plain = self.path_for(date, url);
        let marker = source_marker(&plain);
        match tokio::fs::read_to_string(&marker).await {
            Ok(owner) if owner.trim() != url.as_str() => Ok(hashed_path(&plain, url)),
            Ok(_) => Ok(plain),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(plain),
            Err(source) => Err(TransportError::Io { path: marker, source }),
        }
    }

    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, TransportError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TransportError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write through a `.part` file so a half-written download never looks present.
    async fn write(&self, path: &Path, url: &Url, bytes: &[u8]) -> Result<(), TransportError> {
        let io = |source| TransportError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io)?;
        }
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, bytes).await.map_err(io)?;
        tokio::fs::rename(&partial, path).await.map_err(io)?;
        tokio::fs::write(source_marker(path), url.as_str()).await.map_err(io)?;
        Ok(())
    }
}

fn source_marker(path: &Path) -> PathBuf {
    let mut marker = path.as_os_str().to_owned();
    marker.push(".src");
    PathBuf::from(marker)
}

/// `name.pdf` → `name-1a2b3c4d.pdf`, keyed on the full URL.
fn hashed_path(plain: &Path, url: &Url) -> PathBuf {
    let digest = hex::encode(Sha256::digest(url.as_str().as_bytes()));
    let stem = plain.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match plain.extension() {
        Some(ext) => format!("{}-{}.{}", stem, &digest[..8], ext.to_string_lossy()),
        None => format!("{}-{}", stem, &digest[..8]),
    };
    plain.with_file_name(name)
}

/// Last path segment, or a stable fallback for bare hosts.
fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.replace(['/', '\\'], "_"))
        .unwrap_or_else(|| "document".to_string())
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: String,
    pub effective_date: NaiveDate,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub from_cache: bool,
}

impl FetchedDocument {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string())
    }
}

/// Fetch stats returned after a mirror pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub total: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub errors: usize,
}

pub struct Fetcher {
    base: Url,
    source: Arc<dyn DocumentSource>,
    store: DocumentStore,
}

impl Fetcher {
    pub fn new(base: Url, source: Arc<dyn DocumentSource>, store: DocumentStore) -> Self {
        Self { base, source, store }
    }

    /// Return the document's bytes, downloading only if it is not stored yet.
    pub async fn fetch(&self, date: NaiveDate, href: &str) -> Result<FetchedDocument, TransportError> {
        let url = resolve(&self.base, href)?;
        let path = self.store.locate(date, &url).await?;

        if let Some(bytes) = self.store.read(&path).await? {
            debug!(url = %url, path = ?path, "Already stored, skipping download");
            return Ok(FetchedDocument {
                url: url.to_string(),
                effective_date: date,
                path,
                bytes,
                from_cache: true,
            });
        }

        info!("Downloading {} for {}", url, date);
        let bytes = self.source.get(url.as_str()).await?;
        self.store.write(&path, &url, &bytes).await?;
        Ok(FetchedDocument {
            url: url.to_string(),
            effective_date: date,
            path,
            bytes,
            from_cache: false,
        })
    }

    /// Store every (date, url) pair. Failures are logged and counted, never fatal.
    pub async fn mirror(self: Arc<Self>, links: Vec<DiscoveredLink>, concurrency: usize) -> FetchStats {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let total = links.len();

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        let (tx, mut rx) =
            tokio::sync::mpsc::channel::<(DiscoveredLink, Result<bool, TransportError>)>(concurrency.max(1) * 2);

        for link in links {
            let fetcher = Arc::clone(&self);
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                let result = fetcher
                    .fetch(link.effective_date, &link.url)
                    .await
                    .map(|doc| doc.from_cache);
                let _ = tx.send((link, result)).await;
            });
        }

        // Drop our copy of tx so rx closes when all spawned tasks finish
        drop(tx);

        let mut stats = FetchStats {
            total,
            ..FetchStats::default()
        };
        while let Some((link, result)) = rx.recv().await {
            match result {
                Ok(true) => stats.cached += 1,
                Ok(false) => stats.downloaded += 1,
                Err(e) => {
                    warn!(url = %link.url, date = %link.effective_date, error = %e, "Failed to download");
                    stats.errors += 1;
                }
            }
            pb.inc(1);
        }

        pb.finish_and_clear();
        info!(
            "Fetched {} documents ({} downloaded, {} already stored, {} errors)",
            stats.total, stats.downloaded, stats.cached, stats.errors
        );
        stats
    }
}
