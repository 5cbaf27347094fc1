use journal_core::db::open_db_in_memory;
use journal_core::service::extraction_version::ENTRIES_COLLECTION;
use journal_core::{
    BackgroundEnrichment, Document, DocumentStore, EditOutcome, EditPipeline, EditPolicy,
    ExtractionError, Sentiment, SignalDraft, SignalExtractor, SignalKind, SignalStatus,
    SignalStore, SignalStoreError, SqliteDocumentStore, StoreResult, VersionCounter,
    VersionError, WriteOp,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn shared_store() -> Arc<dyn DocumentStore> {
    Arc::new(SqliteDocumentStore::new(open_db_in_memory().unwrap()))
}

fn seed_entry(store: &dyn DocumentStore, entry_id: &str) {
    store
        .set(ENTRIES_COLLECTION, entry_id, &json!({"content": "seed"}))
        .unwrap();
}

fn draft(target_date: &str, kind: SignalKind, sentiment: Sentiment) -> SignalDraft {
    SignalDraft {
        target_date: target_date.to_string(),
        kind,
        content: format!("{kind:?} on {target_date}"),
        sentiment,
        confidence: 0.8,
    }
}

struct StaticExtractor(Vec<SignalDraft>);

impl SignalExtractor for StaticExtractor {
    fn extract(&self, _entry_id: &str, _text: &str) -> Result<Vec<SignalDraft>, ExtractionError> {
        Ok(self.0.clone())
    }
}

struct FailingExtractor;

impl SignalExtractor for FailingExtractor {
    fn extract(&self, _entry_id: &str, _text: &str) -> Result<Vec<SignalDraft>, ExtractionError> {
        Err(ExtractionError::new("model unavailable"))
    }
}

/// Rewrites the document underneath the first `races` transactions.
struct RacingStore {
    inner: SqliteDocumentStore,
    races: AtomicU32,
}

impl RacingStore {
    fn new(races: u32) -> Self {
        Self {
            inner: SqliteDocumentStore::new(open_db_in_memory().unwrap()),
            races: AtomicU32::new(races),
        }
    }
}

impl DocumentStore for RacingStore {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        self.inner.get(collection, id)
    }

    fn set(&self, collection: &str, id: &str, data: &Value) -> StoreResult<()> {
        self.inner.set(collection, id, data)
    }

    fn update(&self, collection: &str, id: &str, patch: &Map<String, Value>) -> StoreResult<()> {
        self.inner.update(collection, id, patch)
    }

    fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        self.inner.delete(collection, id)
    }

    fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<Document>> {
        self.inner.query_eq(collection, field, value)
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()> {
        self.inner.commit_batch(ops)
    }

    fn transact(
        &self,
        collection: &str,
        id: &str,
        compute: &mut dyn FnMut(Option<&Value>) -> StoreResult<Value>,
    ) -> StoreResult<Value> {
        self.inner.transact(collection, id, &mut |current| {
            let next = compute(current)?;
            let raced = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if let (true, Some(current)) = (raced, current) {
                self.inner.set(collection, id, current)?;
            }
            Ok(next)
        })
    }
}

type Interleaved = Box<dyn FnOnce() + Send>;

/// Runs `interleaved` once, right after the first query has been read.
struct InterleavingStore {
    inner: Arc<dyn DocumentStore>,
    interleaved: Mutex<Option<Interleaved>>,
}

impl DocumentStore for InterleavingStore {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        self.inner.get(collection, id)
    }

    fn set(&self, collection: &str, id: &str, data: &Value) -> StoreResult<()> {
        self.inner.set(collection, id, data)
    }

    fn update(&self, collection: &str, id: &str, patch: &Map<String, Value>) -> StoreResult<()> {
        self.inner.update(collection, id, patch)
    }

    fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        self.inner.delete(collection, id)
    }

    fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<Document>> {
        let answer = self.inner.query_eq(collection, field, value);
        let interleaved = self.interleaved.lock().unwrap().take();
        if let Some(run) = interleaved {
            run();
        }
        answer
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()> {
        self.inner.commit_batch(ops)
    }

    fn transact(
        &self,
        collection: &str,
        id: &str,
        compute: &mut dyn FnMut(Option<&Value>) -> StoreResult<Value>,
    ) -> StoreResult<Value> {
        self.inner.transact(collection, id, compute)
    }
}

#[test]
fn overlapping_older_save_is_superseded() {
    let inner = shared_store();
    let newer = SignalStore::new(Arc::clone(&inner));
    let store: Arc<dyn DocumentStore> = Arc::new(InterleavingStore {
        inner,
        interleaved: Mutex::new(Some(Box::new(move || {
            newer
                .save_with_version_check(
                    &[draft("2024-03-11", SignalKind::Observation, Sentiment::Excited)],
                    "entry-1",
                    2,
                )
                .unwrap();
        }))),
    });
    let signals = SignalStore::new(store);

    let late = signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Observation, Sentiment::Anxious)],
            "entry-1",
            1,
        )
        .unwrap();

    assert_eq!(late.superseded_by, Some(2));
    assert!(late.written.is_empty());
    let versions: Vec<u32> = signals
        .signals_for_record("entry-1")
        .unwrap()
        .iter()
        .map(|signal| signal.extraction_version)
        .collect();
    assert_eq!(versions, vec![2]);
}

#[test]
fn overlapping_newer_save_replaces_the_older_one() {
    let inner = shared_store();
    let older = SignalStore::new(Arc::clone(&inner));
    let store: Arc<dyn DocumentStore> = Arc::new(InterleavingStore {
        inner,
        interleaved: Mutex::new(Some(Box::new(move || {
            older
                .save_with_version_check(
                    &[draft("2024-03-11", SignalKind::Observation, Sentiment::Anxious)],
                    "entry-1",
                    1,
                )
                .unwrap();
        }))),
    });
    let signals = SignalStore::new(store);

    let saved = signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Observation, Sentiment::Excited)],
            "entry-1",
            2,
        )
        .unwrap();

    assert_eq!(saved.superseded_by, None);
    assert_eq!(saved.deleted, 1);
    let stored = signals.signals_for_record("entry-1").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].extraction_version, 2);
}

#[test]
fn stale_revision_check_fails_the_whole_batch() {
    let store = shared_store();
    store.set("signal_sources", "entry-1", &json!({"latestVersion": 1})).unwrap();
    let ops = vec![
        WriteOp::Set {
            collection: "signals".to_string(),
            id: "s-1".to_string(),
            data: json!({"sourceRecordId": "entry-1"}),
        },
        WriteOp::Check {
            collection: "signal_sources".to_string(),
            id: "entry-1".to_string(),
            revision: None,
        },
    ];

    let err = store.commit_batch(&ops).unwrap_err();
    assert!(matches!(err, journal_core::StoreError::Conflict { .. }));
    assert!(store.get("signals", "s-1").unwrap().is_none());
}

#[test]
fn newer_version_replaces_older_signals() {
    let signals = SignalStore::new(shared_store());
    let first = signals
        .save_with_version_check(
            &[
                draft("2024-03-11", SignalKind::Plan, Sentiment::Hopeful),
                draft("2024-03-12", SignalKind::Observation, Sentiment::Anxious),
            ],
            "entry-1",
            1,
        )
        .unwrap();
    assert_eq!(first.written.len(), 2);
    assert_eq!(first.deleted, 0);

    let second = signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Plan, Sentiment::Excited)],
            "entry-1",
            2,
        )
        .unwrap();
    assert_eq!(second.deleted, 2);
    assert_eq!(second.superseded_by, None);

    let stored = signals.signals_for_record("entry-1").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].extraction_version, 2);
    assert_eq!(stored[0].sentiment, Sentiment::Excited);
    assert_eq!(stored[0].status, SignalStatus::Active);
}

#[test]
fn late_older_version_writes_nothing() {
    let signals = SignalStore::new(shared_store());
    signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Observation, Sentiment::Positive)],
            "entry-1",
            2,
        )
        .unwrap();

    let late = signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Observation, Sentiment::Negative)],
            "entry-1",
            1,
        )
        .unwrap();

    assert_eq!(late.superseded_by, Some(2));
    assert!(late.written.is_empty());
    let stored = signals.signals_for_record("entry-1").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sentiment, Sentiment::Positive);
}

#[test]
fn same_version_save_keeps_existing_signals() {
    let signals = SignalStore::new(shared_store());
    let one = [draft("2024-03-11", SignalKind::Observation, Sentiment::Neutral)];
    signals.save_with_version_check(&one, "entry-1", 1).unwrap();
    let again = signals.save_with_version_check(&one, "entry-1", 1).unwrap();

    assert_eq!(again.deleted, 0);
    assert_eq!(signals.signals_for_record("entry-1").unwrap().len(), 2);
}

#[test]
fn version_zero_is_rejected() {
    let signals = SignalStore::new(shared_store());
    let err = signals
        .save_with_version_check(&[], "entry-1", 0)
        .unwrap_err();
    assert!(matches!(err, SignalStoreError::InvalidVersion(0)));
}

#[test]
fn saves_do_not_touch_other_entries() {
    let signals = SignalStore::new(shared_store());
    signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Observation, Sentiment::Hopeful)],
            "entry-a",
            1,
        )
        .unwrap();
    signals
        .save_with_version_check(
            &[draft("2024-03-11", SignalKind::Reference, Sentiment::Neutral)],
            "entry-b",
            3,
        )
        .unwrap();

    assert_eq!(signals.signals_for_record("entry-a").unwrap().len(), 1);
    assert_eq!(signals.signals_for_date("2024-03-11").unwrap().len(), 2);
    assert!(signals.signals_for_date("2024-03-12").unwrap().is_empty());
}

#[test]
fn confidence_is_clamped_on_save() {
    let signals = SignalStore::new(shared_store());
    let mut overconfident = draft("2024-03-11", SignalKind::Observation, Sentiment::Excited);
    overconfident.confidence = 1.7;

    let saved = signals
        .save_with_version_check(&[overconfident], "entry-1", 1)
        .unwrap();
    assert_eq!(saved.written[0].confidence, 1.0);
}

#[test]
fn review_transitions_are_terminal() {
    let signals = SignalStore::new(shared_store());
    let saved = signals
        .save_with_version_check(
            &[
                draft("2024-03-11", SignalKind::Plan, Sentiment::Hopeful),
                draft("2024-03-12", SignalKind::Plan, Sentiment::Dreading),
            ],
            "entry-1",
            1,
        )
        .unwrap();
    let verify_id = saved.written[0].id.clone();
    let dismiss_id = saved.written[1].id.clone();

    let verified = signals
        .update_status(&verify_id, SignalStatus::Verified)
        .unwrap();
    assert_eq!(verified.status, SignalStatus::Verified);
    // Repeating the same review is a no-op.
    signals
        .update_status(&verify_id, SignalStatus::Verified)
        .unwrap();

    let err = signals
        .update_status(&verify_id, SignalStatus::Dismissed)
        .unwrap_err();
    assert!(matches!(
        err,
        SignalStoreError::InvalidTransition {
            from: SignalStatus::Verified,
            to: SignalStatus::Dismissed,
            ..
        }
    ));

    let err = signals
        .update_status(&dismiss_id, SignalStatus::Active)
        .unwrap_err();
    assert!(matches!(err, SignalStoreError::InvalidTransition { .. }));

    let err = signals
        .update_status("missing", SignalStatus::Dismissed)
        .unwrap_err();
    assert!(matches!(err, SignalStoreError::NotFound(id) if id == "missing"));
}

#[test]
fn batch_review_is_all_or_nothing() {
    let signals = SignalStore::new(shared_store());
    let saved = signals
        .save_with_version_check(
            &[
                draft("2024-03-11", SignalKind::Observation, Sentiment::Hopeful),
                draft("2024-03-12", SignalKind::Observation, Sentiment::Anxious),
                draft("2024-03-13", SignalKind::Observation, Sentiment::Neutral),
            ],
            "entry-1",
            1,
        )
        .unwrap();
    let ids: Vec<String> = saved.written.iter().map(|s| s.id.clone()).collect();

    signals
        .update_status(&ids[2], SignalStatus::Verified)
        .unwrap();
    let err = signals
        .batch_update_status(&ids, SignalStatus::Dismissed)
        .unwrap_err();
    assert!(matches!(err, SignalStoreError::InvalidTransition { .. }));
    assert_eq!(
        signals.get(&ids[0]).unwrap().unwrap().status,
        SignalStatus::Active
    );

    let changed = signals
        .batch_update_status(&ids[..2], SignalStatus::Dismissed)
        .unwrap();
    assert_eq!(changed, 2);
    assert_eq!(
        signals
            .batch_update_status(&ids[..2], SignalStatus::Dismissed)
            .unwrap(),
        0
    );
    assert_eq!(
        signals.get(&ids[1]).unwrap().unwrap().status,
        SignalStatus::Dismissed
    );
}

#[test]
fn version_counter_increments_existing_entries_only() {
    let store = shared_store();
    seed_entry(store.as_ref(), "entry-1");
    let versions = VersionCounter::new(Arc::clone(&store));

    assert_eq!(versions.current("entry-1").unwrap(), 0);
    assert_eq!(versions.increment("entry-1").unwrap(), 1);
    assert_eq!(versions.increment("entry-1").unwrap(), 2);
    assert_eq!(versions.current("entry-1").unwrap(), 2);

    let doc = store.get(ENTRIES_COLLECTION, "entry-1").unwrap().unwrap();
    assert_eq!(doc.data["content"], "seed");

    assert!(matches!(
        versions.increment("missing").unwrap_err(),
        VersionError::EntryNotFound(id) if id == "missing"
    ));
}

#[test]
fn version_counter_surfaces_conflicts() {
    let store: Arc<dyn DocumentStore> = Arc::new(RacingStore::new(1));
    seed_entry(store.as_ref(), "entry-1");
    let versions = VersionCounter::new(Arc::clone(&store));

    assert!(matches!(
        versions.increment("entry-1").unwrap_err(),
        VersionError::Conflict { .. }
    ));
    assert_eq!(versions.increment("entry-1").unwrap(), 1);
}

#[test]
fn pipeline_retries_version_conflicts() {
    let store: Arc<dyn DocumentStore> = Arc::new(RacingStore::new(2));
    seed_entry(store.as_ref(), "entry-1");
    let pipeline = EditPipeline::new(
        store,
        Arc::new(StaticExtractor(vec![draft(
            "2024-03-11",
            SignalKind::Observation,
            Sentiment::Hopeful,
        )])),
        EditPolicy::default(),
    );

    let outcome = pipeline.on_entry_saved("entry-1", "busy week").unwrap();
    assert_eq!(
        outcome,
        EditOutcome::Extracted {
            version: 1,
            written: 1,
            deleted: 0
        }
    );
}

#[test]
fn pipeline_gives_up_after_conflict_budget() {
    let store: Arc<dyn DocumentStore> = Arc::new(RacingStore::new(10));
    seed_entry(store.as_ref(), "entry-1");
    let policy = EditPolicy {
        max_conflict_retries: 3,
        ..EditPolicy::default()
    };
    let pipeline = EditPipeline::new(store, Arc::new(StaticExtractor(Vec::new())), policy);

    let err = pipeline.on_entry_saved("entry-1", "busy week").unwrap_err();
    assert!(matches!(
        err,
        VersionError::Conflict { attempts: 3, .. }
    ));
}

#[test]
fn cosmetic_edit_skips_extraction() {
    let store = shared_store();
    seed_entry(store.as_ref(), "entry-1");
    let pipeline = EditPipeline::new(
        store,
        Arc::new(StaticExtractor(vec![draft(
            "2024-03-11",
            SignalKind::Plan,
            Sentiment::Neutral,
        )])),
        EditPolicy::default(),
    );
    pipeline
        .on_entry_saved("entry-1", "Meeting with Sam on Friday")
        .unwrap();

    let outcome = pipeline
        .on_entry_edited(
            "entry-1",
            "Meeting with Sam on Friday",
            "Meeting with Sam on Friday!",
        )
        .unwrap();
    assert!(matches!(outcome, EditOutcome::Unchanged { .. }));
    assert_eq!(pipeline.versions().current("entry-1").unwrap(), 1);

    let outcome = pipeline
        .on_entry_edited(
            "entry-1",
            "Meeting with Sam on Friday",
            "Meeting with Sam moved to next Tuesday morning",
        )
        .unwrap();
    assert_eq!(
        outcome,
        EditOutcome::Extracted {
            version: 2,
            written: 1,
            deleted: 1
        }
    );
    let stored = pipeline.signals().signals_for_record("entry-1").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].extraction_version, 2);
}

#[test]
fn extraction_failure_does_not_fail_the_save() {
    let store = shared_store();
    seed_entry(store.as_ref(), "entry-1");
    let pipeline = EditPipeline::new(store, Arc::new(FailingExtractor), EditPolicy::default());

    let outcome = pipeline.on_entry_saved("entry-1", "anything").unwrap();
    assert_eq!(
        outcome,
        EditOutcome::ExtractionFailed {
            version: 1,
            error: "model unavailable".to_string()
        }
    );
    assert!(pipeline
        .signals()
        .signals_for_record("entry-1")
        .unwrap()
        .is_empty());
}

#[test]
fn background_enrichment_reports_failures_on_channel() {
    let store = shared_store();
    seed_entry(store.as_ref(), "entry-1");
    let pipeline = Arc::new(EditPipeline::new(
        store,
        Arc::new(FailingExtractor),
        EditPolicy::default(),
    ));
    let enrichment = BackgroundEnrichment::new(pipeline);
    let failures = enrichment.failures();

    let outcome = enrichment
        .spawn_saved("entry-1".to_string(), "text".to_string())
        .join()
        .unwrap();
    assert!(matches!(outcome, EditOutcome::ExtractionFailed { version: 1, .. }));

    let missing = enrichment
        .spawn_saved("missing".to_string(), "text".to_string())
        .join()
        .unwrap();
    assert!(matches!(missing, EditOutcome::ExtractionFailed { version: 0, .. }));

    let first = failures.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = failures.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.entry_id, "entry-1");
    assert_eq!(first.error, "model unavailable");
    assert_eq!(second.entry_id, "missing");
    assert!(failures.try_recv().is_err());
}

#[test]
fn background_enrichment_succeeds_quietly() {
    let store = shared_store();
    seed_entry(store.as_ref(), "entry-1");
    let pipeline = Arc::new(EditPipeline::new(
        store,
        Arc::new(StaticExtractor(vec![draft(
            "2024-03-11",
            SignalKind::Observation,
            Sentiment::Positive,
        )])),
        EditPolicy::default(),
    ));
    let enrichment = BackgroundEnrichment::new(Arc::clone(&pipeline));
    let failures = enrichment.failures();

    let outcome = enrichment
        .spawn_saved("entry-1".to_string(), "great day".to_string())
        .join()
        .unwrap();
    assert!(matches!(outcome, EditOutcome::Extracted { version: 1, .. }));
    assert!(failures.try_recv().is_err());
    assert_eq!(
        pipeline.signals().signals_for_date("2024-03-11").unwrap().len(),
        1
    );
}

#[test]
fn undrained_failures_are_capped_by_backlog() {
    let store = shared_store();
    let pipeline = Arc::new(EditPipeline::new(
        store,
        Arc::new(FailingExtractor),
        EditPolicy::default(),
    ));
    let enrichment = BackgroundEnrichment::with_backlog(pipeline, 1);
    let failures = enrichment.failures();

    for entry_id in ["missing-1", "missing-2", "missing-3"] {
        let outcome = enrichment
            .spawn_saved(entry_id.to_string(), "text".to_string())
            .join()
            .unwrap();
        assert!(matches!(outcome, EditOutcome::ExtractionFailed { version: 0, .. }));
    }

    assert_eq!(failures.try_recv().unwrap().entry_id, "missing-1");
    assert!(failures.try_recv().is_err());
}
