//! Persistence collaborator.
//!
//! Phase executors only rely on atomic per-record reads and writes and on
//! an "items matching predicate" query. [`InMemoryStore`] is the bundled
//! implementation; anything durable plugs in behind the same trait.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{CategoryKey, ContentItem, IndexDocument, IndexScope, ModelPhase, ModelSelector, SynthesisDocument};
use crate::errors::{PipelineError, Result};
use crate::pipeline::PipelineExecution;
use crate::state::SubPhaseStatus;
use crate::threads::Thread;

/// Predicate for [`Store::query_items`].
#[derive(Clone, Default)]
pub enum ItemQuery {
    /// Every item.
    #[default]
    All,
    /// Items with one of these ids.
    Ids(Vec<String>),
    /// Items in one category pair.
    Category(CategoryKey),
    /// Items in one thread.
    Thread(String),
    /// Arbitrary predicate.
    Custom(Arc<dyn Fn(&ContentItem) -> bool + Send + Sync>),
}

impl fmt::Debug for ItemQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Ids(ids) => f.debug_tuple("Ids").field(ids).finish(),
            Self::Category(key) => f.debug_tuple("Category").field(key).finish(),
            Self::Thread(id) => f.debug_tuple("Thread").field(id).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ItemQuery {
    /// Returns true if `item` matches.
    #[must_use]
    pub fn matches(&self, item: &ContentItem) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.iter().any(|id| *id == item.source_id),
            Self::Category(key) => item.category_key().as_ref() == Some(key),
            Self::Thread(id) => item.thread_id.as_deref() == Some(id.as_str()),
            Self::Custom(predicate) => predicate(item),
        }
    }
}

/// Record storage used by every phase.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails if the store cannot serve requests.
    async fn health_check(&self) -> Result<()>;

    /// Reads one item.
    async fn get_item(&self, id: &str) -> Result<Option<ContentItem>>;
    /// Writes one item.
    async fn put_item(&self, item: &ContentItem) -> Result<()>;
    /// Deletes an item and its status; returns whether it existed.
    async fn delete_item(&self, id: &str) -> Result<bool>;
    /// Items matching a predicate, sorted by id.
    async fn query_items(&self, query: &ItemQuery) -> Result<Vec<ContentItem>>;

    /// Reads an item's status.
    async fn get_status(&self, item_id: &str) -> Result<Option<SubPhaseStatus>>;
    /// Writes an item's status.
    async fn put_status(&self, status: &SubPhaseStatus) -> Result<()>;
    /// Every stored status.
    async fn list_statuses(&self) -> Result<Vec<SubPhaseStatus>>;

    /// Reads a thread.
    async fn get_thread(&self, id: &str) -> Result<Option<Thread>>;
    /// Writes a thread.
    async fn put_thread(&self, thread: &Thread) -> Result<()>;
    /// Every stored thread.
    async fn list_threads(&self) -> Result<Vec<Thread>>;

    /// Reads the synthesis document for a category pair.
    async fn get_synthesis(&self, key: &CategoryKey) -> Result<Option<SynthesisDocument>>;
    /// Writes a synthesis document.
    async fn put_synthesis(&self, doc: &SynthesisDocument) -> Result<()>;
    /// Every stored synthesis document.
    async fn list_synthesis(&self) -> Result<Vec<SynthesisDocument>>;

    /// Writes an index, replacing the one with the same scope.
    async fn put_index(&self, index: &IndexDocument) -> Result<()>;
    /// Every stored index.
    async fn list_indexes(&self) -> Result<Vec<IndexDocument>>;

    /// Reads an execution record.
    async fn get_execution(&self, id: Uuid) -> Result<Option<PipelineExecution>>;
    /// Writes an execution record.
    async fn put_execution(&self, execution: &PipelineExecution) -> Result<()>;

    /// Persisted default model per model phase.
    async fn model_defaults(&self) -> Result<HashMap<ModelPhase, ModelSelector>>;
    /// Persists the default model for a model phase.
    async fn put_model_default(&self, phase: ModelPhase, selector: &ModelSelector) -> Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
    items: BTreeMap<String, ContentItem>,
    statuses: BTreeMap<String, SubPhaseStatus>,
    threads: BTreeMap<String, Thread>,
    synthesis: BTreeMap<CategoryKey, SynthesisDocument>,
    indexes: BTreeMap<IndexScope, IndexDocument>,
    executions: HashMap<Uuid, PipelineExecution>,
    model_defaults: HashMap<ModelPhase, ModelSelector>,
}

/// A [`Store`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a storage error until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.tables.read().items.len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::storage("store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn health_check(&self) -> Result<()> {
        self.check()
    }

    async fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        self.check()?;
        Ok(self.tables.read().items.get(id).cloned())
    }

    async fn put_item(&self, item: &ContentItem) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .items
            .insert(item.source_id.clone(), item.clone());
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.statuses.remove(id);
        Ok(tables.items.remove(id).is_some())
    }

    async fn query_items(&self, query: &ItemQuery) -> Result<Vec<ContentItem>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .items
            .values()
            .filter(|item| query.matches(item))
            .cloned()
            .collect())
    }

    async fn get_status(&self, item_id: &str) -> Result<Option<SubPhaseStatus>> {
        self.check()?;
        Ok(self.tables.read().statuses.get(item_id).cloned())
    }

    async fn put_status(&self, status: &SubPhaseStatus) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .statuses
            .insert(status.item_id.clone(), status.clone());
        Ok(())
    }

    async fn list_statuses(&self) -> Result<Vec<SubPhaseStatus>> {
        self.check()?;
        Ok(self.tables.read().statuses.values().cloned().collect())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        self.check()?;
        Ok(self.tables.read().threads.get(id).cloned())
    }

    async fn put_thread(&self, thread: &Thread) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .threads
            .insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        self.check()?;
        Ok(self.tables.read().threads.values().cloned().collect())
    }

    async fn get_synthesis(&self, key: &CategoryKey) -> Result<Option<SynthesisDocument>> {
        self.check()?;
        Ok(self.tables.read().synthesis.get(key).cloned())
    }

    async fn put_synthesis(&self, doc: &SynthesisDocument) -> Result<()> {
        self.check()?;
        self.tables.write().synthesis.insert(doc.key(), doc.clone());
        Ok(())
    }

    async fn list_synthesis(&self) -> Result<Vec<SynthesisDocument>> {
        self.check()?;
        Ok(self.tables.read().synthesis.values().cloned().collect())
    }

    async fn put_index(&self, index: &IndexDocument) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .indexes
            .insert(index.scope.clone(), index.clone());
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<IndexDocument>> {
        self.check()?;
        Ok(self.tables.read().indexes.values().cloned().collect())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PipelineExecution>> {
        self.check()?;
        Ok(self.tables.read().executions.get(&id).cloned())
    }

    async fn put_execution(&self, execution: &PipelineExecution) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn model_defaults(&self) -> Result<HashMap<ModelPhase, ModelSelector>> {
        self.check()?;
        Ok(self.tables.read().model_defaults.clone())
    }

    async fn put_model_default(&self, phase: ModelPhase, selector: &ModelSelector) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .model_defaults
            .insert(phase, selector.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::tests::raw;

    #[tokio::test]
    async fn test_item_round_trip_and_delete() {
        let store = InMemoryStore::new();
        let item = ContentItem::from_raw(raw("1", "alice", 0, None));
        store.put_item(&item).await.unwrap();
        store.put_status(&SubPhaseStatus::new("1")).await.unwrap();

        assert_eq!(store.get_item("1").await.unwrap(), Some(item));
        assert!(store.delete_item("1").await.unwrap());
        assert!(store.get_status("1").await.unwrap().is_none());
        assert!(!store.delete_item("1").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_predicates() {
        let store = InMemoryStore::new();
        for (id, main) in [("1", "Rust"), ("2", "Rust"), ("3", "Go")] {
            let mut item = ContentItem::from_raw(raw(id, "alice", 0, None));
            item.main_category = Some(main.into());
            item.sub_category = Some("General".into());
            store.put_item(&item).await.unwrap();
        }

        let rust = store
            .query_items(&ItemQuery::Category(CategoryKey::new("Rust", "General")))
            .await
            .unwrap();
        assert_eq!(rust.len(), 2);

        let ids = store
            .query_items(&ItemQuery::Ids(vec!["3".into()]))
            .await
            .unwrap();
        assert_eq!(ids[0].source_id, "3");

        let custom = store
            .query_items(&ItemQuery::Custom(Arc::new(|i| i.source_id != "1")))
            .await
            .unwrap();
        assert_eq!(custom.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_with_storage_error() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.health_check().await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Storage);
        assert!(store.get_item("1").await.is_err());

        store.set_unavailable(false);
        assert!(store.health_check().await.is_ok());
    }
}
