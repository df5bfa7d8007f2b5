//! Table metadata cache.
//!
//! `get` never calls the warehouse; `refresh` always does and overwrites the
//! entry. The estimate flow uses [`MetadataFetcher`] to fill in missing
//! entries without holding the cache across the network call.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{GuardError, Result};
use crate::persistence::{table_cache, StateDb};
use crate::warehouse::{Partitioning, TableMetadata, TableRef, WarehouseClient};

/// Fetches table metadata from the warehouse.
#[derive(Clone)]
pub struct MetadataFetcher {
    client: Arc<dyn WarehouseClient>,
}

impl MetadataFetcher {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, table: &TableRef) -> Result<TableMetadata> {
        self.client
            .table_metadata(table)
            .await
            .map_err(|cause| {
                warn!(%table, error = %cause, "Metadata fetch failed");
                GuardError::MetadataFetch {
                    table: table.clone(),
                    cause,
                }
            })
    }

    /// Fetches each table in turn. Failures are returned alongside the
    /// successes rather than aborting the batch.
    pub async fn fetch_all(&self, tables: &[TableRef]) -> (Vec<TableMetadata>, Vec<GuardError>) {
        let mut fetched = Vec::new();
        let mut errors = Vec::new();
        for table in tables {
            match self.fetch(table).await {
                Ok(metadata) => fetched.push(metadata),
                Err(e) => errors.push(e),
            }
        }
        (fetched, errors)
    }
}

/// Session-lifetime cache of table metadata, keyed by table.
pub struct MetadataCache {
    entries: HashMap<TableRef, TableMetadata>,
    fetcher: MetadataFetcher,
    store: Option<Arc<StateDb>>,
}

impl MetadataCache {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self {
            entries: HashMap::new(),
            fetcher: MetadataFetcher::new(client),
            store: None,
        }
    }

    /// Persists entries to the state database and reloads what it holds.
    pub async fn with_store(mut self, db: Arc<StateDb>) -> Self {
        match table_cache::load_tables(db.pool()).await {
            Ok(tables) => {
                debug!(count = tables.len(), "Loaded cached table metadata");
                self.load(tables);
            }
            Err(e) => warn!(error = %e, "Could not load cached table metadata"),
        }
        self.store = Some(db);
        self
    }

    pub fn fetcher(&self) -> MetadataFetcher {
        self.fetcher.clone()
    }

    /// Cached metadata for `table`. Never calls the warehouse.
    pub fn get(&self, table: &TableRef) -> Option<&TableMetadata> {
        self.entries.get(table)
    }

    pub fn partitioning(&self, table: &TableRef) -> Option<Partitioning> {
        self.get(table).map(|m| m.partitioning.clone())
    }

    /// Fetches `table` and overwrites its entry.
    ///
    /// On failure the previous entry, if any, is kept.
    pub async fn refresh(&mut self, table: &TableRef) -> Result<&TableMetadata> {
        let metadata = self.fetcher.fetch(table).await?;
        self.insert(metadata).await;
        self.entries
            .get(table)
            .ok_or_else(|| GuardError::internal(format!("metadata for {table} vanished")))
    }

    /// Tables among `tables` with no cached entry, in the given order.
    pub fn missing(&self, tables: &[TableRef]) -> Vec<TableRef> {
        let mut missing: Vec<TableRef> = Vec::new();
        for table in tables {
            if !self.entries.contains_key(table) && !missing.contains(table) {
                missing.push(table.clone());
            }
        }
        missing
    }

    /// Stores an entry fetched elsewhere.
    pub async fn insert(&mut self, metadata: TableMetadata) {
        if let Some(db) = &self.store {
            if let Err(e) = table_cache::save_table(db.pool(), &metadata).await {
                warn!(table = %metadata.table, error = %e, "Could not persist table metadata");
            }
        }
        self.entries.insert(metadata.table.clone(), metadata);
    }

    /// Fetches only the tables that are not cached yet.
    pub async fn ensure(&mut self, tables: &[TableRef]) -> Vec<GuardError> {
        let missing = self.missing(tables);
        if missing.is_empty() {
            return Vec::new();
        }
        let (fetched, errors) = self.fetcher.fetch_all(&missing).await;
        for metadata in fetched {
            self.insert(metadata).await;
        }
        errors
    }

    /// Drops every entry, including the persisted ones.
    pub async fn clear(&mut self) {
        self.entries.clear();
        if let Some(db) = &self.store {
            if let Err(e) = table_cache::clear_tables(db.pool()).await {
                warn!(error = %e, "Could not clear persisted table metadata");
            }
        }
    }

    pub fn load(&mut self, tables: impl IntoIterator<Item = TableMetadata>) {
        for metadata in tables {
            self.entries.insert(metadata.table.clone(), metadata);
        }
    }

    /// Cached entries ordered by table name.
    pub fn entries(&self) -> Vec<&TableMetadata> {
        let mut entries: Vec<&TableMetadata> = self.entries.values().collect();
        entries.sort_by(|a, b| a.table.cmp(&b.table));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.entries.len())
            .field("persisted", &self.store.is_some())
            .finish()
    }
}
