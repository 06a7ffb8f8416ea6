//! Sub-phase state tracker.
//!
//! Decides whether a processing step must run for an item and performs the
//! flag transitions. Every write to an item's flags happens under that
//! item's lock, so concurrent retries of the same item cannot race.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{ItemLocks, SubPhaseStatus};
use crate::core::{ContentItem, ItemUpdate, ProcessingStep};
use crate::errors::{PipelineError, Result};
use crate::ports::Store;

/// Returns true if `step` has to run for `item`.
///
/// True when forced, when the flag is false, or when the step's input
/// fingerprint changed since the flag was set.
#[must_use]
pub fn needs_processing(
    item: &ContentItem,
    status: &SubPhaseStatus,
    step: ProcessingStep,
    force: bool,
) -> bool {
    if force || !status.flag(step) {
        return true;
    }
    status
        .step_fingerprints
        .get(&step)
        .map_or(true, |stored| *stored != item.step_fingerprint(step))
}

/// Reads and writes [`SubPhaseStatus`] records through the store.
#[derive(Clone)]
pub struct SubPhaseTracker {
    store: Arc<dyn Store>,
    locks: ItemLocks,
}

impl std::fmt::Debug for SubPhaseTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubPhaseTracker")
            .field("held_locks", &self.locks.held())
            .finish_non_exhaustive()
    }
}

impl SubPhaseTracker {
    /// Creates a tracker over a store with its own lock table.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_locks(store, ItemLocks::new())
    }

    /// Creates a tracker sharing an existing lock table.
    #[must_use]
    pub fn with_locks(store: Arc<dyn Store>, locks: ItemLocks) -> Self {
        Self { store, locks }
    }

    /// The lock table.
    #[must_use]
    pub fn locks(&self) -> &ItemLocks {
        &self.locks
    }

    /// Loads an item's status, or a blank one if none is stored.
    pub async fn status(&self, item_id: &str) -> Result<SubPhaseStatus> {
        Ok(self
            .store
            .get_status(item_id)
            .await?
            .unwrap_or_else(|| SubPhaseStatus::new(item_id)))
    }

    /// Store-backed form of [`needs_processing`].
    pub async fn needs_processing(
        &self,
        item: &ContentItem,
        step: ProcessingStep,
        force: bool,
    ) -> Result<bool> {
        let status = self.status(&item.source_id).await?;
        Ok(needs_processing(item, &status, step, force))
    }

    /// Sets a flag and refreshes its stored fingerprint.
    ///
    /// Fails with [`PipelineError::OrderingViolation`] if a prerequisite
    /// flag is false.
    pub async fn mark_complete(
        &self,
        item: &ContentItem,
        step: ProcessingStep,
    ) -> Result<SubPhaseStatus> {
        let _guard = self.locks.acquire(&item.source_id).await;
        let mut status = self.status(&item.source_id).await?;
        Self::set_complete(&mut status, item, step)?;
        self.store.put_status(&status).await?;
        Ok(status)
    }

    /// Writes a step's output and sets its flag as one unit.
    ///
    /// The item is re-read under the lock so fields written by other
    /// steps are never clobbered. Nothing is written if the ordering
    /// check fails.
    pub async fn commit(&self, item_id: &str, update: ItemUpdate) -> Result<ContentItem> {
        let step = update.step();
        let _guard = self.locks.acquire(item_id).await;

        let mut item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::storage(format!("item '{item_id}' not found")))?;
        let mut status = self.status(item_id).await?;
        if let Some(missing) = status.missing_prerequisite(step) {
            return Err(PipelineError::OrderingViolation {
                item_id: item_id.to_string(),
                step,
                missing,
            });
        }

        update.apply(&mut item);
        Self::set_complete(&mut status, &item, step)?;
        self.store.put_item(&item).await?;
        self.store.put_status(&status).await?;
        debug!(item_id = %item_id, step = %step, "Step committed");
        Ok(item)
    }

    /// Clears the given flags and every flag downstream of them.
    pub async fn reset(&self, item_id: &str, steps: &[ProcessingStep]) -> Result<SubPhaseStatus> {
        let _guard = self.locks.acquire(item_id).await;
        let mut status = self.status(item_id).await?;
        let Some(earliest) = steps.iter().copied().min() else {
            return Ok(status);
        };
        for step in earliest.and_downstream() {
            status.set_flag(*step, false);
        }
        status.needs_review = false;
        self.store.put_status(&status).await?;
        debug!(item_id = %item_id, from = %earliest, "Flags reset");
        Ok(status)
    }

    /// Records a failed attempt at `step`; the flag is left untouched.
    pub async fn record_failure(
        &self,
        item_id: &str,
        step: ProcessingStep,
        error: &PipelineError,
    ) -> Result<()> {
        let _guard = self.locks.acquire(item_id).await;
        let mut status = self.status(item_id).await?;
        status.push_error(step, error);
        if status.needs_review {
            warn!(item_id = %item_id, step = %step, error = %error, "Item flagged for review");
        }
        self.store.put_status(&status).await
    }

    /// Creates the status record for a freshly ingested item.
    pub async fn initialize(&self, item: &ContentItem) -> Result<SubPhaseStatus> {
        let _guard = self.locks.acquire(&item.source_id).await;
        let mut status = self.status(&item.source_id).await?;
        status.content_fingerprint = item.content_fingerprint();
        self.store.put_status(&status).await?;
        Ok(status)
    }

    fn set_complete(
        status: &mut SubPhaseStatus,
        item: &ContentItem,
        step: ProcessingStep,
    ) -> Result<()> {
        if let Some(missing) = status.missing_prerequisite(step) {
            return Err(PipelineError::OrderingViolation {
                item_id: item.source_id.clone(),
                step,
                missing,
            });
        }
        status.set_flag(step, true);
        status
            .step_fingerprints
            .insert(step, item.step_fingerprint(step));
        status.content_fingerprint = item.content_fingerprint();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;
    use crate::core::ModelSelector;
    use crate::ports::InMemoryStore;

    async fn setup() -> (SubPhaseTracker, Arc<InMemoryStore>, ContentItem) {
        let store = Arc::new(InMemoryStore::new());
        let item = ContentItem::from_raw(raw("1", "alice", 0, None));
        store.put_item(&item).await.unwrap();
        let tracker = SubPhaseTracker::new(store.clone());
        tracker.initialize(&item).await.unwrap();
        (tracker, store, item)
    }

    fn cached() -> ItemUpdate {
        ItemUpdate::Cached {
            links: vec![],
            hashtags: vec![],
        }
    }

    async fn complete_all(tracker: &SubPhaseTracker) -> ContentItem {
        let model = ModelSelector::new("local", "m");
        tracker.commit("1", cached()).await.unwrap();
        tracker
            .commit(
                "1",
                ItemUpdate::MediaAnalyzed {
                    descriptions: vec![],
                    model: None,
                },
            )
            .await
            .unwrap();
        tracker
            .commit(
                "1",
                ItemUpdate::Understood {
                    summary: "s".into(),
                    model: model.clone(),
                },
            )
            .await
            .unwrap();
        tracker
            .commit(
                "1",
                ItemUpdate::Categorized {
                    main_category: "Rust".into(),
                    sub_category: "Async".into(),
                    item_name: "n".into(),
                    model,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_item_needs_every_step() {
        let (tracker, _, item) = setup().await;
        for step in ProcessingStep::ALL {
            assert!(tracker.needs_processing(&item, step, false).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_completed_step_is_skipped_unless_forced() {
        let (tracker, _, _) = setup().await;
        let item = tracker.commit("1", cached()).await.unwrap();
        assert!(!tracker
            .needs_processing(&item, ProcessingStep::Cache, false)
            .await
            .unwrap());
        assert!(tracker
            .needs_processing(&item, ProcessingStep::Cache, true)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ordering_violation_writes_nothing() {
        let (tracker, store, _) = setup().await;
        let err = tracker
            .commit(
                "1",
                ItemUpdate::Understood {
                    summary: "s".into(),
                    model: ModelSelector::new("a", "b"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OrderingViolation {
                missing: ProcessingStep::Cache,
                ..
            }
        ));
        assert!(store.get_item("1").await.unwrap().unwrap().summary.is_none());
    }

    #[tokio::test]
    async fn test_mark_complete_checks_prerequisites() {
        let (tracker, _, item) = setup().await;
        assert!(tracker
            .mark_complete(&item, ProcessingStep::MediaAnalysis)
            .await
            .unwrap_err()
            .is_fatal());
        tracker.mark_complete(&item, ProcessingStep::Cache).await.unwrap();
        let status = tracker
            .mark_complete(&item, ProcessingStep::MediaAnalysis)
            .await
            .unwrap();
        assert!(status.media_analyzed);
    }

    #[tokio::test]
    async fn test_content_change_invalidates_categorization() {
        let (tracker, store, _) = setup().await;
        let mut item = complete_all(&tracker).await;
        assert!(!tracker
            .needs_processing(&item, ProcessingStep::Categorization, false)
            .await
            .unwrap());

        let mut edited = raw("1", "alice", 0, None);
        edited.text = "completely different".into();
        item.apply_raw(edited);
        store.put_item(&item).await.unwrap();

        assert!(tracker
            .needs_processing(&item, ProcessingStep::Categorization, false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reset_cascades_downstream_only() {
        let (tracker, _, _) = setup().await;
        complete_all(&tracker).await;

        let status = tracker
            .reset("1", &[ProcessingStep::ContentUnderstanding])
            .await
            .unwrap();
        assert!(status.cached);
        assert!(status.media_analyzed);
        assert!(!status.content_understood);
        assert!(!status.categorized);
    }

    #[tokio::test]
    async fn test_record_failure_keeps_flag() {
        let (tracker, _, _) = setup().await;
        tracker.commit("1", cached()).await.unwrap();
        tracker
            .record_failure(
                "1",
                ProcessingStep::MediaAnalysis,
                &PipelineError::validation("1", "bad"),
            )
            .await
            .unwrap();
        let status = tracker.status("1").await.unwrap();
        assert!(status.cached);
        assert!(!status.media_analyzed);
        assert!(status.needs_review);
        assert_eq!(status.errors.len(), 1);
    }
}
