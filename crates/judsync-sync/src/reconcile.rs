use std::sync::Arc;

use chrono::{DateTime, Utc};
use judsync_core::{ItemOutcome, JudgmentRecord, ParsedJudgment};
use judsync_storage::{JudgmentStore, StoreError};

use crate::risk::classify_risk;

/// Insert-or-update of parsed judgments keyed by JID.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn JudgmentStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JudgmentStore>) -> Self {
        Self { store }
    }

    /// Reports [`ItemOutcome::New`] or [`ItemOutcome::Updated`]. Risk is
    /// recomputed from the incoming text every time.
    pub async fn reconcile(&self, parsed: ParsedJudgment, now: DateTime<Utc>) -> Result<ItemOutcome, StoreError> {
        let risk = classify_risk(parsed.full_text.as_deref().unwrap_or_default());
        match self.store.get_judgment(&parsed.jid).await? {
            Some(mut existing) => {
                existing.apply_update(parsed, risk, now);
                self.store.update_judgment(&existing).await?;
                Ok(ItemOutcome::Updated)
            }
            None => {
                let record = JudgmentRecord::from_parsed(parsed, risk, now);
                self.store.insert_judgment(&record).await?;
                Ok(ItemOutcome::New)
            }
        }
    }
}
