use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::db::{self, LoadOutcome, PolicyMetadata, RunRow};
use crate::error::{ConfigError, DocumentError, LoadError, TransportError};
use crate::extract::json::isolate_json;
use crate::extract::{ExtractionResult, ExtractionService};
use crate::fetcher::{DocumentSource, DocumentStore, Fetcher};
use crate::index::WorkItem;
use crate::normalize::{normalize, Normalized};

/// Batch totals reported at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn print(&self) {
        println!(
            "Run {}: {} attempted, {} inserted, {} skipped (already stored), {} failed.",
            self.run_id, self.attempted, self.succeeded, self.skipped, self.failed
        );
    }
}

pub fn new_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S"))
}

/// A document that went through fetch/extract/normalize, ready to load.
struct Finished {
    item: WorkItem,
    outcome: Result<Normalized, DocumentError>,
}

pub struct Pipeline {
    settings: Arc<Settings>,
    fetcher: Arc<Fetcher>,
    extractor: Arc<dyn ExtractionService>,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        settings: Arc<Settings>,
        source: Arc<dyn DocumentSource>,
        extractor: Arc<dyn ExtractionService>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ConfigError> {
        let base = Url::parse(&settings.base_url).map_err(|e| ConfigError::Invalid {
            key: "base_url",
            reason: e.to_string(),
        })?;
        let store = DocumentStore::new(settings.store_dir.clone());
        Ok(Self {
            fetcher: Arc::new(Fetcher::new(base, source, store)),
            settings,
            extractor,
            stop,
        })
    }

    /// Drop documents already loaded or already found to be duplicates, then apply `limit`.
    pub fn plan(
        &self,
        conn: &Connection,
        items: Vec<WorkItem>,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, LoadError> {
        let mut todo = Vec::with_capacity(items.len());
        let mut known = 0usize;
        for item in items {
            if self.settings.track_provenance && db::is_known_url(conn, &item.url)? {
                known += 1;
                continue;
            }
            todo.push(item);
        }
        if let Some(n) = limit {
            todo.truncate(n);
        }
        info!("Planned {} documents ({} already stored)", todo.len(), known);
        Ok(todo)
    }

    /// Push every item through fetch → extract → parse → normalize → load.
    ///
    /// Workers run under a semaphore. Each dispatch after the first waits for a
    /// free slot and then the pacing delay, so with one slot documents are
    /// spaced `pacing_ms` apart from the end of the previous one. Loading
    /// happens here, on the one storage connection. One document's failure is
    /// logged and recorded, never propagated.
    pub async fn run(&self, conn: &Connection, items: Vec<WorkItem>) -> RunSummary {
        let run_id = new_run_id();
        let total = items.len();
        let concurrency = self.settings.concurrency.max(1);

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        // Channel: workers send results, this loop loads them
        let (tx, mut rx) = mpsc::channel::<Finished>(concurrency * 2);
        let dispatcher = tokio::spawn(dispatch(
            items,
            tx,
            Arc::clone(&self.settings),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.extractor),
            Arc::clone(&self.stop),
        ));

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            ..RunSummary::default()
        };

        while let Some(done) = rx.recv().await {
            summary.attempted += 1;
            match done.outcome {
                Ok(normalized) => {
                    for warning in &normalized.warnings {
                        warn!(url = %done.item.url, policy_id = %normalized.record.policy_id, "{}", warning);
                    }
                    match db::insert_policy(conn, &normalized.record) {
                        Ok(LoadOutcome::Inserted) => {
                            summary.succeeded += 1;
                            info!("Inserted policy {} from {}", normalized.record.policy_id, done.item.url);
                        }
                        Ok(LoadOutcome::Skipped) => {
                            summary.skipped += 1;
                            info!("Skipped: policy {} already exists", normalized.record.policy_id);
                            if let Err(e) = db::record_skip(conn, &run_id, &done.item.url, &normalized.record.policy_id) {
                                warn!(url = %done.item.url, error = %e, "Could not record skip");
                            }
                        }
                        Err(e) => self.fail(conn, &run_id, &done.item, &DocumentError::Load(e), &mut summary),
                    }
                }
                Err(e) => self.fail(conn, &run_id, &done.item, &e, &mut summary),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        match dispatcher.await {
            Ok(undispatched) if undispatched > 0 => {
                warn!("Stopped early; {} documents were not dispatched", undispatched)
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dispatcher task failed"),
        }

        let row = RunRow {
            run_id: &summary.run_id,
            attempted: summary.attempted,
            succeeded: summary.succeeded,
            skipped: summary.skipped,
            failed: summary.failed,
        };
        if let Err(e) = db::record_run(conn, &row) {
            warn!(error = %e, "Could not record run summary");
        }
        info!(
            run_id = %summary.run_id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Run finished"
        );
        summary
    }

    fn fail(
        &self,
        conn: &Connection,
        run_id: &str,
        item: &WorkItem,
        err: &DocumentError,
        summary: &mut RunSummary,
    ) {
        summary.failed += 1;
        let date = item.bucket().format("%Y-%m-%d").to_string();
        let stage = err.stage();
        warn!(url = %item.url, date = %date, stage = %stage, error = %err, "Document failed");
        if let Err(e) = db::record_failure(conn, run_id, &item.url, Some(&date), stage.as_str(), &err.to_string()) {
            warn!(url = %item.url, error = %e, "Could not record failure");
        }
    }
}

/// Spawn one worker per item. Returns how many items were left when `stop` was raised.
async fn dispatch(
    items: Vec<WorkItem>,
    tx: mpsc::Sender<Finished>,
    settings: Arc<Settings>,
    fetcher: Arc<Fetcher>,
    extractor: Arc<dyn ExtractionService>,
    stop: Arc<AtomicBool>,
) -> usize {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let pacing = settings.pacing();
    let total = items.len();

    for (i, item) in items.into_iter().enumerate() {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            return total - i;
        };
        if i > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        if stop.load(Ordering::Acquire) {
            return total - i;
        }

        let tx = tx.clone();
        let settings = Arc::clone(&settings);
        let fetcher = Arc::clone(&fetcher);
        let extractor = Arc::clone(&extractor);
        tokio::spawn(async move {
            let outcome = process(&settings, &fetcher, extractor.as_ref(), &item).await;
            let _ = tx.send(Finished { item, outcome }).await;
            drop(permit);
        });
    }
    0
}

async fn process(
    settings: &Settings,
    fetcher: &Fetcher,
    extractor: &dyn ExtractionService,
    item: &WorkItem,
) -> Result<Normalized, DocumentError> {
    let doc = fetcher.fetch(item.bucket(), &item.url).await?;
    debug!(url = %doc.url, date = %doc.effective_date, bytes = doc.bytes.len(), cached = doc.from_cache, "Fetched");

    let file_name = doc.file_name();
    let reply = ExtractionResult {
        raw_text: extractor.extract(&file_name, doc.bytes).await?,
        source_url: doc.url,
    };
    let normalized = to_record(settings, reply, Some(doc.effective_date))?;
    require_policy_id(settings, &normalized.record)?;
    Ok(normalized)
}

/// Isolate and normalize one reply, attaching provenance when tracked.
fn to_record(
    settings: &Settings,
    reply: ExtractionResult,
    listed: Option<NaiveDate>,
) -> Result<Normalized, DocumentError> {
    debug!(url = %reply.source_url, "Raw metadata:\n{}", reply.raw_text);
    let value = isolate_json(&reply.raw_text)?;
    let mut normalized = normalize(&value, Utc::now().date_naive(), listed)?;
    if settings.track_provenance && !reply.source_url.is_empty() {
        normalized.record.source_url = Some(reply.source_url);
    }
    Ok(normalized)
}

fn require_policy_id(settings: &Settings, record: &PolicyMetadata) -> Result<(), DocumentError> {
    if record.has_sentinel_id() && !settings.allow_unknown_policy_id {
        return Err(DocumentError::MissingPolicyId);
    }
    Ok(())
}

/// Extract a file already on disk. `source_url` is kept as provenance if given.
pub async fn extract_local(
    settings: &Settings,
    extractor: &dyn ExtractionService,
    path: &Path,
    source_url: Option<String>,
) -> Result<Normalized, DocumentError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| TransportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    let reply = ExtractionResult {
        raw_text: extractor.extract(&file_name, bytes).await?,
        source_url: source_url.unwrap_or_default(),
    };
    to_record(settings, reply, None)
}

/// Load one record outside a batch, under the same policy_id rule as `run`.
pub fn load_record(
    conn: &Connection,
    settings: &Settings,
    record: &PolicyMetadata,
) -> Result<LoadOutcome, DocumentError> {
    require_policy_id(settings, record)?;
    let outcome = db::insert_policy(conn, record)?;
    match outcome {
        LoadOutcome::Inserted => info!("Inserted policy {}", record.policy_id),
        LoadOutcome::Skipped => info!("Skipped: policy {} already exists", record.policy_id),
    }
    Ok(outcome)
}
