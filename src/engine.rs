//! Message traversal engine.
//!
//! Walks the chat history in ascending id order from the persisted cursor,
//! one message at a time:
//!
//! 1. **Resuming**: load the state, then re-attempt every id in the retry
//!    set before anything new is looked at.
//! 2. **Scanning**: fetch batches strictly after the cursor, filter, handle,
//!    and persist the new cursor after every message.
//! 3. **Draining**: history exhausted, cap reached, or cancelled.
//!
//! The cursor only moves once a message is fully resolved and the state
//! holding it is on disk, so a restart never skips an unresolved id.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::download::{paths, DownloadOrchestrator, DownloadOutcome, FailureKind};
use crate::export::{ExportError, MessageExporter};
use crate::filter::{self, FilterCriteria, SkipReason, Verdict};
use crate::progress::{ItemResolved, NullProgress, ProgressSink, Resolution, RunningTotals};
use crate::source::{Message, MessageSource, SourceError};
use crate::state::{ExportState, ItemRecord, Ledger, RunStats, StateError, StateStore};
use crate::types::MessageId;

/// Conditions that abort a run. The persisted state stays a valid resume
/// point in every case.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Message source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resuming,
    Scanning,
    Draining,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pagination_limit: usize,
    /// Filter and log only: no downloads, no state or export writes.
    pub dry_run: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pagination_limit: 100,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: ExportState,
    pub totals: RunningTotals,
    pub interrupted: bool,
    /// Items that failed for good this run, with the reason.
    pub permanent_failures: Vec<(MessageId, String)>,
    pub elapsed: Duration,
}

enum Handled {
    Resolved(Resolution),
    /// Media passed every other check but the run already accepted
    /// `max_messages` items.
    CapReached,
}

pub struct ExportEngine<'a> {
    source: &'a dyn MessageSource,
    store: &'a dyn StateStore,
    orchestrator: DownloadOrchestrator<'a>,
    criteria: FilterCriteria,
    options: EngineOptions,
    ledger: Option<&'a dyn Ledger>,
    exporter: Option<MessageExporter>,
    progress: &'a dyn ProgressSink,

    state: ExportState,
    totals: RunningTotals,
    accepted: usize,
    interrupted: bool,
    permanent_failures: Vec<(MessageId, String)>,
}

impl<'a> ExportEngine<'a> {
    pub fn new(
        source: &'a dyn MessageSource,
        store: &'a dyn StateStore,
        orchestrator: DownloadOrchestrator<'a>,
        criteria: FilterCriteria,
        options: EngineOptions,
    ) -> Self {
        Self {
            source,
            store,
            orchestrator,
            criteria,
            options,
            ledger: None,
            exporter: None,
            progress: &NullProgress,
            state: ExportState::default(),
            totals: RunningTotals::default(),
            accepted: 0,
            interrupted: false,
            permanent_failures: Vec::new(),
        }
    }

    pub fn with_ledger(mut self, ledger: &'a dyn Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_exporter(mut self, exporter: MessageExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Run the export to completion, cancellation, or a fatal error.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let run_id = match self.ledger {
            Some(ledger) if !self.options.dry_run => match ledger.start_run().await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("Ledger unavailable, run not recorded: {}", e);
                    None
                }
            },
            _ => None,
        };

        let result = self.traverse(cancel).await;

        if let (Some(ledger), Some(run_id)) = (self.ledger, run_id) {
            let stats = RunStats {
                scanned: self.totals.scanned,
                downloaded: self.totals.downloaded,
                deferred: self.totals.deferred,
                failed: self.totals.failed,
                skipped: self.totals.skipped,
                exported: self.totals.exported,
                bytes: self.totals.bytes,
                interrupted: self.interrupted || result.is_err(),
            };
            if let Err(e) = ledger.complete_run(run_id, &stats).await {
                tracing::warn!("Failed to record run in ledger: {}", e);
            }
        }
        self.progress.finish();
        result?;

        Ok(RunReport {
            state: self.state,
            totals: self.totals,
            interrupted: self.interrupted,
            permanent_failures: self.permanent_failures,
            elapsed: started.elapsed(),
        })
    }

    async fn traverse(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut phase = Phase::Resuming;
        loop {
            tracing::debug!(?phase, cursor = self.state.cursor, "Export phase");
            phase = match phase {
                Phase::Resuming => {
                    self.state = self.store.load().await?;
                    tracing::info!(
                        "Resuming after message {} with {} pending retries",
                        self.state.cursor,
                        self.state.retry_set.len()
                    );
                    self.drain_retry_set(cancel).await?;
                    if self.interrupted {
                        Phase::Draining
                    } else {
                        Phase::Scanning
                    }
                }
                Phase::Scanning => {
                    self.scan(cancel).await?;
                    Phase::Draining
                }
                Phase::Draining => return Ok(()),
            };
        }
    }

    /// Re-attempt every deferred id, oldest first. Each entry is removed or
    /// kept, and the state saved, before the next one starts.
    async fn drain_retry_set(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let pending: Vec<MessageId> = self.state.retry_set.iter().copied().collect();
        for id in pending {
            if cancel.is_cancelled() {
                self.interrupted = true;
                return Ok(());
            }

            let message = self
                .source
                .fetch_message(id)
                .await
                .map_err(EngineError::SourceUnavailable)?;
            let Some(message) = message else {
                self.progress.suspend(&mut || {
                    tracing::warn!(message_id = id, "Deferred message no longer exists, dropping it")
                });
                self.state.retry_set.remove(&id);
                self.persist().await?;
                self.notify(
                    id,
                    Resolution::Dropped {
                        reason: "message no longer exists",
                    },
                );
                continue;
            };

            let resolution = match self.handle(&message).await? {
                Handled::CapReached => {
                    tracing::info!("max_messages reached while draining the retry set");
                    return Ok(());
                }
                Handled::Resolved(resolution) => resolution,
            };
            self.totals.scanned += 1;

            match &resolution {
                Resolution::Deferred { .. } => {}
                Resolution::Skipped { reason } => {
                    tracing::info!(message_id = id, "Dropping from retry set: {}", reason);
                    self.state.retry_set.remove(&id);
                }
                _ => {
                    self.state.retry_set.remove(&id);
                }
            }
            self.persist().await?;
            self.notify(id, resolution);
        }
        Ok(())
    }

    async fn scan(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let limit = self.options.pagination_limit.max(1);
        loop {
            if cancel.is_cancelled() {
                self.interrupted = true;
                return Ok(());
            }

            let batch = self
                .source
                .fetch_messages_after(self.state.cursor, limit)
                .await
                .map_err(EngineError::SourceUnavailable)?;
            if batch.is_empty() {
                tracing::debug!("No messages after {}", self.state.cursor);
                return Ok(());
            }
            if batch.iter().all(|m| m.id <= self.state.cursor) {
                tracing::warn!(
                    "Source returned {} messages none of which are after {}, stopping scan",
                    batch.len(),
                    self.state.cursor
                );
                return Ok(());
            }

            for message in &batch {
                if message.id <= self.state.cursor {
                    continue;
                }
                if cancel.is_cancelled() {
                    self.interrupted = true;
                    return Ok(());
                }

                let resolution = match self.handle(message).await? {
                    Handled::CapReached => {
                        tracing::info!(
                            "Reached max_messages ({}), stopping before message {}",
                            self.accepted,
                            message.id
                        );
                        return Ok(());
                    }
                    Handled::Resolved(resolution) => resolution,
                };
                self.totals.scanned += 1;

                if matches!(resolution, Resolution::Deferred { .. }) {
                    self.state.retry_set.insert(message.id);
                } else {
                    self.state.retry_set.remove(&message.id);
                }
                self.state.cursor = message.id;
                self.persist().await?;
                self.notify(message.id, resolution);
            }
        }
    }

    /// Filter one message and carry out whatever it needs: export,
    /// download, or nothing.
    async fn handle(&mut self, message: &Message) -> Result<Handled, EngineError> {
        let media = match filter::evaluate(message, &self.criteria, self.accepted) {
            Verdict::Skip(SkipReason::CountCap) => return Ok(Handled::CapReached),
            Verdict::Skip(reason) => {
                tracing::debug!(message_id = message.id, "Skipped: {}", reason.as_str());
                return Ok(Handled::Resolved(Resolution::Skipped {
                    reason: reason.as_str(),
                }));
            }
            Verdict::ExportOnly => {
                self.export(message).await?;
                return Ok(Handled::Resolved(Resolution::Exported));
            }
            Verdict::Download => match &message.media {
                Some(media) => media,
                None => {
                    return Ok(Handled::Resolved(Resolution::Skipped {
                        reason: SkipReason::NoMedia.as_str(),
                    }))
                }
            },
        };

        self.accepted += 1;
        self.export(message).await?;

        let format = media.effective_format();
        let dest = paths::resolve(
            &self.orchestrator.settings().directory,
            media.kind,
            media.file_name.as_deref(),
            message.id,
            format.as_deref(),
        );

        if self.options.dry_run {
            tracing::info!("[DRY RUN] Would download {}", dest.display());
            return Ok(Handled::Resolved(Resolution::WouldDownload));
        }

        let outcome = self.orchestrator.download(message, &dest).await;
        let resolution = match outcome {
            DownloadOutcome::Succeeded {
                path,
                bytes,
                sha256,
                attempts,
                deduplicated,
            } => {
                tracing::debug!(message_id = message.id, attempts, "Downloaded {}", path.display());
                self.record(ItemRecord::downloaded(
                    message.id,
                    media.kind,
                    message.date,
                    path,
                    bytes,
                    sha256,
                    attempts,
                ))
                .await;
                Resolution::Downloaded {
                    bytes,
                    deduplicated,
                }
            }
            DownloadOutcome::Failed {
                reason,
                kind: FailureKind::Permanent,
                attempts,
            } => {
                self.progress.suspend(&mut || {
                    tracing::error!(message_id = message.id, "Download failed permanently: {}", reason)
                });
                self.permanent_failures.push((message.id, reason.clone()));
                self.record(ItemRecord::failed(
                    message.id,
                    media.kind,
                    message.date,
                    file_name_of(&dest),
                    reason.clone(),
                    attempts,
                    false,
                ))
                .await;
                Resolution::Failed { reason }
            }
            DownloadOutcome::Failed {
                reason,
                kind,
                attempts,
            } => {
                self.progress.suspend(&mut || {
                    tracing::warn!(
                        message_id = message.id,
                        attempts,
                        "Deferring after {} failure: {}",
                        kind.as_str(),
                        reason
                    )
                });
                self.record(ItemRecord::failed(
                    message.id,
                    media.kind,
                    message.date,
                    file_name_of(&dest),
                    reason.clone(),
                    attempts,
                    true,
                ))
                .await;
                Resolution::Deferred { reason }
            }
        };
        Ok(Handled::Resolved(resolution))
    }

    async fn export(&mut self, message: &Message) -> Result<(), EngineError> {
        if self.options.dry_run {
            return Ok(());
        }
        if let Some(exporter) = self.exporter.as_mut() {
            if exporter.record(message).await? {
                self.totals.exported += 1;
            }
        }
        Ok(())
    }

    /// Ledger writes are informational; a failure is logged and ignored.
    async fn record(&self, record: ItemRecord) {
        if let Some(ledger) = self.ledger {
            if let Err(e) = ledger.upsert_item(&record).await {
                tracing::warn!(message_id = record.message_id, "Ledger update failed: {}", e);
            }
        }
    }

    async fn persist(&self) -> Result<(), EngineError> {
        if self.options.dry_run {
            return Ok(());
        }
        self.store.save(&self.state).await?;
        Ok(())
    }

    fn notify(&mut self, message_id: MessageId, resolution: Resolution) {
        self.totals.apply(&resolution);
        self.progress.on_item_resolved(
            &ItemResolved {
                message_id,
                resolution,
            },
            &self.totals,
        );
    }
}

fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
