//! Offline queue sync orchestrator.
//!
//! # Responsibility
//! - Drain the local queue through an injected `RecordSubmitter`.
//! - Apply the retry cap and exponential backoff between failures.
//! - Publish lifecycle events to subscribers.
//!
//! # Invariants
//! - Records are submitted one at a time, oldest first.
//! - At most one non-forced pass runs at a time per orchestrator.
//! - Synced records are purged from the queue at the end of every pass.
//! - Every failure is retried identically; no error classification.
//! - A record discarded or claimed elsewhere mid-pass is skipped; the pass
//!   still completes.

use crate::config::SyncPolicy;
use crate::model::now_epoch_ms;
use crate::model::queued_record::{EntryDraft, LocalId, QueuedRecord, SyncStatus};
use crate::queue::{LocalQueue, QueueError, QueueResult};
use crate::repo::kv_store::KeyValueStore;
use crate::sync::backoff::Backoff;
use crate::sync::events::{EventBus, Subscription, SyncEvent, SyncReport};
use crate::sync::submit::{RecordSubmitter, SubmitError};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Blocking wait used between failed submissions.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// `Sleeper` backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Options for `SyncOrchestrator::run_sync`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Run even if another pass holds the single-flight guard.
    pub force: bool,
}

/// Result of submitting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Synced { remote_id: String },
    Failed { retry_count: u32, exhausted: bool },
    /// The record was discarded or moved by someone else before it could be
    /// settled; nothing was recorded for it.
    Skipped,
}

/// Queue drainer with retry, backoff and events.
pub struct SyncOrchestrator<K: KeyValueStore> {
    queue: LocalQueue<K>,
    backoff: Backoff,
    events: EventBus,
    sleeper: Box<dyn Sleeper>,
    running: AtomicBool,
}

/// Clears the single-flight flag when a pass ends, including on early return.
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<K: KeyValueStore> SyncOrchestrator<K> {
    /// Builds an orchestrator over `store`, sleeping on the current thread.
    pub fn new(store: K, policy: &SyncPolicy) -> Self {
        Self::with_sleeper(store, policy, Box::new(ThreadSleeper))
    }

    pub fn with_sleeper(store: K, policy: &SyncPolicy, sleeper: Box<dyn Sleeper>) -> Self {
        Self {
            queue: LocalQueue::new(store, policy.max_retries),
            backoff: Backoff::from_policy(policy),
            events: EventBus::new(),
            sleeper,
            running: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &LocalQueue<K> {
        &self.queue
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(listener)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stores an entry captured offline and emits `queued`.
    pub fn enqueue(&self, payload: EntryDraft) -> QueueResult<QueuedRecord> {
        let record = self.queue.enqueue(payload)?;
        self.events.emit(&SyncEvent::Queued {
            local_id: record.local_id,
        });
        Ok(record)
    }

    /// Entries not yet on the server (pending or in flight).
    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// Current status of one record, if it is still queued.
    pub fn status_of(&self, local_id: LocalId) -> Option<SyncStatus> {
        self.queue.get(local_id).map(|record| record.status())
    }

    /// Records that exhausted their retries and need manual action.
    pub fn failed_records(&self) -> Vec<QueuedRecord> {
        self.queue.list_failed()
    }

    /// Submits every eligible pending record once.
    ///
    /// Returns a report with `skipped = true` when another pass is running and
    /// `options.force` is not set.
    pub fn run_sync<S>(&self, submitter: &S, options: SyncOptions) -> QueueResult<SyncReport>
    where
        S: RecordSubmitter + ?Sized,
    {
        let guard = match self.acquire_single_flight() {
            Some(guard) => Some(guard),
            None if options.force => {
                info!("event=sync_pass module=sync status=forced reason=already_running");
                None
            }
            None => {
                info!("event=sync_pass module=sync status=skipped reason=already_running");
                return Ok(SyncReport {
                    skipped: true,
                    ..SyncReport::default()
                });
            }
        };

        // A forced pass may overlap a running one whose records are
        // legitimately `syncing`; only the guard holder recovers.
        if guard.is_some() {
            self.queue.recover_interrupted()?;
        }
        let pending = self.queue.list_pending(self.queue.max_retries());
        self.run_pass(submitter, pending)
    }

    /// Manually retries one record regardless of its retry budget.
    ///
    /// The record's retry count is reset first; no backoff is applied.
    pub fn retry_one<S>(&self, local_id: LocalId, submitter: &S) -> QueueResult<AttemptOutcome>
    where
        S: RecordSubmitter + ?Sized,
    {
        self.queue.reset_for_retry(local_id)?;
        let record = self
            .queue
            .get(local_id)
            .ok_or(QueueError::NotFound(local_id))?;
        let outcome = self.attempt(&record, submitter)?;
        self.queue.clear_synced()?;
        Ok(outcome)
    }

    /// Resets and resubmits every `failed` record as one pass.
    ///
    /// Shares the single-flight guard with `run_sync`.
    pub fn retry_all_failed<S>(&self, submitter: &S) -> QueueResult<SyncReport>
    where
        S: RecordSubmitter + ?Sized,
    {
        let Some(_guard) = self.acquire_single_flight() else {
            info!("event=sync_retry_failed module=sync status=skipped reason=already_running");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };

        let failed = self.queue.list_failed();
        let mut retried = Vec::with_capacity(failed.len());
        for record in failed {
            self.queue.reset_for_retry(record.local_id)?;
            if let Some(reset) = self.queue.get(record.local_id) {
                retried.push(reset);
            }
        }
        self.run_pass(submitter, retried)
    }

    /// Permanently removes a record without submitting it.
    pub fn discard(&self, local_id: LocalId) -> QueueResult<bool> {
        let removed = self.queue.remove(local_id)?;
        if removed {
            info!("event=queue_discard module=sync status=ok local_id={local_id}");
            self.events.emit(&SyncEvent::EntryDiscarded { local_id });
        }
        Ok(removed)
    }

    fn acquire_single_flight(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                flag: &self.running,
            })
    }

    fn run_pass<S>(&self, submitter: &S, records: Vec<QueuedRecord>) -> QueueResult<SyncReport>
    where
        S: RecordSubmitter + ?Sized,
    {
        let started_at = Instant::now();
        let mut meta = self.queue.meta();
        meta.last_sync_started_at_ms = Some(now_epoch_ms());
        self.queue.set_meta(&meta)?;

        info!(
            "event=sync_pass module=sync status=start pending={}",
            records.len()
        );
        self.events.emit(&SyncEvent::SyncStarted {
            pending: records.len(),
        });

        let mut report = SyncReport::default();
        for (index, record) in records.iter().enumerate() {
            match self.attempt(record, submitter)? {
                AttemptOutcome::Skipped => report.skipped_records += 1,
                AttemptOutcome::Synced { .. } => {
                    report.attempted += 1;
                    report.synced += 1;
                }
                AttemptOutcome::Failed { .. } => {
                    report.attempted += 1;
                    report.failed += 1;
                    if index + 1 < records.len() {
                        // Backoff uses the count this attempt was made with.
                        let delay = self
                            .backoff
                            .delay_with_jitter(record.retry_count, &mut rand::thread_rng());
                        self.sleeper.sleep(delay);
                    }
                }
            }
        }

        let purged = self.queue.clear_synced()?;
        meta.last_sync_completed_at_ms = Some(now_epoch_ms());
        meta.last_synced_count = report.synced;
        meta.last_failed_count = report.failed;
        self.queue.set_meta(&meta)?;

        info!(
            "event=sync_pass module=sync status=ok attempted={} synced={} failed={} skipped={} purged={} duration_ms={}",
            report.attempted,
            report.synced,
            report.failed,
            report.skipped_records,
            purged,
            started_at.elapsed().as_millis()
        );
        self.events.emit(&SyncEvent::SyncCompleted {
            report: report.clone(),
        });
        Ok(report)
    }

    fn attempt<S>(&self, record: &QueuedRecord, submitter: &S) -> QueueResult<AttemptOutcome>
    where
        S: RecordSubmitter + ?Sized,
    {
        let local_id = record.local_id;
        if settle(local_id, self.queue.mark_syncing(local_id))?.is_none() {
            return Ok(AttemptOutcome::Skipped);
        }

        let result = submitter.submit(record).and_then(|receipt| {
            match receipt.id.filter(|id| !id.trim().is_empty()) {
                Some(id) => Ok((id, receipt.derived)),
                None => Err(SubmitError::new("submission returned no remote id")),
            }
        });

        match result {
            Ok((remote_id, derived)) => {
                let marked = self.queue.mark_synced(local_id, remote_id.clone(), derived);
                if settle(local_id, marked)?.is_none() {
                    return Ok(AttemptOutcome::Skipped);
                }
                info!("event=entry_sync module=sync status=ok local_id={local_id}");
                self.events.emit(&SyncEvent::EntrySynced {
                    local_id,
                    remote_id: remote_id.clone(),
                });
                Ok(AttemptOutcome::Synced { remote_id })
            }
            Err(err) => {
                let marked = self.queue.mark_failed(local_id, err.message.clone());
                let Some(mark) = settle(local_id, marked)? else {
                    return Ok(AttemptOutcome::Skipped);
                };
                warn!(
                    "event=entry_sync module=sync status=error local_id={} retry_count={} exhausted={} error={}",
                    local_id,
                    mark.retry_count,
                    mark.exhausted,
                    crate::logging::truncate_single_line(&err.message, 160)
                );
                self.events.emit(&SyncEvent::EntryFailed {
                    local_id,
                    error: err.message,
                    retry_count: mark.retry_count,
                    exhausted: mark.exhausted,
                });
                Ok(AttemptOutcome::Failed {
                    retry_count: mark.retry_count,
                    exhausted: mark.exhausted,
                })
            }
        }
    }
}

/// Maps "record gone or no longer ours" to `None` so one concurrent discard or
/// manual retry does not end the whole pass.
fn settle<T>(local_id: LocalId, result: QueueResult<T>) -> QueueResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err @ (QueueError::NotFound(_) | QueueError::InvalidTransition { .. })) => {
            warn!("event=entry_sync module=sync status=skipped local_id={local_id} reason={err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
