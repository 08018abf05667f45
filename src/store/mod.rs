//! Persistence boundary. The engine only ever talks to [`EntityStore`]; the
//! bundled [`MemStore`] keeps records in memory and can optionally log every
//! accepted write to a WAL.

mod memory;
mod wal;

pub use memory::MemStore;
pub use wal::Wal;

use async_trait::async_trait;

use crate::model::{Entity, Filter, Kind, Record};

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    Wal(String),
    KeyMismatch { expected: String, next: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::Wal(msg) => write!(f, "WAL error: {msg}"),
            StoreError::KeyMismatch { expected, next } => {
                write!(f, "compare-and-swap key mismatch: {expected} vs {next}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// What [`EntityStore::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Updated {
    /// Nothing is stored under the key.
    Missing,
    /// The callback declined to write.
    Kept,
    Written,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Record>, StoreError>;

    async fn query(&self, kind: Kind, filter: &Filter) -> Result<Vec<Record>, StoreError>;

    /// Unconditional write (last writer wins).
    async fn put(&self, record: Record) -> Result<Record, StoreError>;

    /// Replace the record at `next`'s key only if it currently equals `expected`.
    /// `expected = None` means "only if absent". Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        expected: Option<&Record>,
        next: Record,
    ) -> Result<bool, StoreError>;

    /// Read, decide and write one record while holding it exclusively.
    ///
    /// `apply` sees the current value and returns its successor, or `None` to
    /// leave it alone. Writers to the same key queue behind each other, so
    /// contention never turns into a failed write. `apply` must not call back
    /// into the store.
    async fn update(
        &self,
        kind: Kind,
        key: &str,
        apply: &mut (dyn for<'r> FnMut(&'r Record) -> Option<Record> + Send),
    ) -> Result<Updated, StoreError>;
}

// ── Typed helpers ────────────────────────────────────────────────

pub async fn fetch<E: Entity>(store: &dyn EntityStore, key: &str) -> Result<Option<E>, StoreError> {
    Ok(store.get(E::KIND, key).await?.and_then(E::from_record))
}

pub async fn fetch_all<E: Entity>(
    store: &dyn EntityStore,
    filter: &Filter,
) -> Result<Vec<E>, StoreError> {
    Ok(store
        .query(E::KIND, filter)
        .await?
        .into_iter()
        .filter_map(E::from_record)
        .collect())
}

pub async fn save<E: Entity>(store: &dyn EntityStore, entity: E) -> Result<E, StoreError> {
    store.put(entity.clone().into_record()).await?;
    Ok(entity)
}

pub async fn swap<E: Entity>(
    store: &dyn EntityStore,
    expected: Option<&E>,
    next: &E,
) -> Result<bool, StoreError> {
    let expected = expected.cloned().map(Entity::into_record);
    store
        .compare_and_swap(expected.as_ref(), next.clone().into_record())
        .await
}
