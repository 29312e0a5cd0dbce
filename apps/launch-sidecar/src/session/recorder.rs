use super::store::{format_session_date, SampleRecord, SessionRecord, SessionStore};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// Builds session documents in memory and writes the full document on every
/// change. A failed write leaves the draft dirty; it is retried on the next
/// change or tick, so the store catches up once it is reachable again.
/// A new draft is not written until the stored record under its id has been
/// read and merged in.
pub struct SessionRecorder<S> {
    store: S,
    drafts: HashMap<i64, SessionRecord>,
    dirty: BTreeSet<i64>,
    unloaded: BTreeSet<i64>,
    persist_failures: u64,
}

impl<S> SessionRecorder<S>
where
    S: SessionStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            drafts: HashMap::new(),
            dirty: BTreeSet::new(),
            unloaded: BTreeSet::new(),
            persist_failures: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn draft(&self, session_id: i64) -> Option<&SessionRecord> {
        self.drafts.get(&session_id)
    }

    pub fn pending_writes(&self) -> usize {
        self.dirty.len()
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    pub async fn on_start(&mut self, session_id: i64, at: DateTime<Utc>, reopened: bool) {
        if let Some(draft) = self.drafts.get_mut(&session_id) {
            if let Some(end_date) = draft.end_date.take() {
                warn_reused(session_id, &end_date);
            }
            self.persist(session_id).await;
            return;
        }

        let mut draft = SessionRecord::new(session_id);
        draft.start_date = Some(format_session_date(at));
        self.drafts.insert(session_id, draft);
        self.unloaded.insert(session_id);
        tracing::info!(session_id, reopened, "session started");
        self.persist(session_id).await;
    }

    pub async fn on_sample(&mut self, session_id: i64, sample: SampleRecord) {
        self.drafts
            .entry(session_id)
            .or_insert_with(|| {
                self.unloaded.insert(session_id);
                SessionRecord::new(session_id)
            })
            .variables
            .push(sample);
        self.persist(session_id).await;
    }

    pub async fn on_end(&mut self, session_id: i64, at: DateTime<Utc>) {
        let Some(draft) = self.drafts.get_mut(&session_id) else {
            tracing::debug!(session_id, "end for session without a draft");
            return;
        };
        draft.end_date = Some(format_session_date(at));
        tracing::info!(
            session_id,
            samples = draft.variables.len(),
            end_date = ?draft.end_date,
            "session ended"
        );
        self.persist(session_id).await;
    }

    /// Writes every draft whose last write failed.
    pub async fn retry_dirty(&mut self) {
        let pending: Vec<i64> = self.dirty.iter().copied().collect();
        for session_id in pending {
            self.persist(session_id).await;
        }
    }

    async fn persist(&mut self, session_id: i64) {
        if self.unloaded.contains(&session_id) {
            if let Err(err) = self.load_stored(session_id).await {
                self.persist_failures += 1;
                self.dirty.insert(session_id);
                tracing::error!(
                    error = %err,
                    session_id,
                    "could not load stored session; holding writes until it loads"
                );
                return;
            }
        }
        let Some(record) = self.drafts.get(&session_id) else {
            self.dirty.remove(&session_id);
            return;
        };
        match self.store.upsert(record).await {
            Ok(()) => {
                self.dirty.remove(&session_id);
                if record.end_date.is_some() {
                    self.drafts.remove(&session_id);
                }
            }
            Err(err) => {
                self.persist_failures += 1;
                self.dirty.insert(session_id);
                tracing::error!(
                    error = %err,
                    session_id,
                    samples = record.variables.len(),
                    "failed to persist session; will retry"
                );
            }
        }
    }

    /// Folds the draft into whatever is already stored under its id.
    async fn load_stored(&mut self, session_id: i64) -> Result<(), StoreError> {
        let stored = self.store.get(session_id).await?;
        self.unloaded.remove(&session_id);
        let Some(mut record) = stored else {
            return Ok(());
        };
        let Some(draft) = self.drafts.remove(&session_id) else {
            return Ok(());
        };
        if let Some(end_date) = record.end_date.take() {
            warn_reused(session_id, &end_date);
        }
        if record.start_date.is_none() {
            record.start_date = draft.start_date;
        }
        record.end_date = draft.end_date;
        record.variables.extend(draft.variables);
        tracing::info!(session_id, samples = record.variables.len(), "loaded stored session");
        self.drafts.insert(session_id, record);
        Ok(())
    }
}

fn warn_reused(session_id: i64, end_date: &str) {
    tracing::warn!(
        session_id,
        end_date,
        "session id reused after it ended; appending to the existing record"
    );
}
