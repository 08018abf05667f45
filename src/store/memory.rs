use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::{Filter, Kind, Record};

use super::wal::{Wal, WalHandle};
use super::{EntityStore, StoreError, Updated};

type RecordKey = (Kind, String);

/// `None` marks a key that has been reserved for a create-if-absent swap.
type SharedRecord = Arc<RwLock<Option<Record>>>;

/// In-process store: one lock per record key, no global write lock.
///
/// When opened on a path every accepted write is appended to the WAL before
/// it becomes visible, so `open` after a crash restores the last accepted value
/// of every key.
pub struct MemStore {
    records: DashMap<RecordKey, SharedRecord>,
    wal: Option<WalHandle>,
    /// Writers share it; compaction takes it exclusively so the snapshot
    /// can't miss a write that lands in the old log.
    gate: RwLock<()>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Volatile store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            wal: None,
            gate: RwLock::new(()),
        }
    }

    /// Durable store backed by the WAL at `path`. Must be called inside a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replayed = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let records = DashMap::new();
        let count = replayed.len();
        for record in replayed {
            let key = (record.kind(), record.key());
            records.insert(key, Arc::new(RwLock::new(Some(record))));
        }
        tracing::info!("replayed {count} WAL frames into {} records", records.len());
        Ok(Self {
            records,
            wal: Some(WalHandle::spawn(wal)),
            gate: RwLock::new(()),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        match &self.wal {
            Some(wal) => wal.appends_since_compact().await,
            None => 0,
        }
    }

    /// Rewrite the WAL with one frame per live record. No-op for a volatile store.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let _gate = self.gate.write().await;
        let mut entries: Vec<(RecordKey, SharedRecord)> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut live = Vec::with_capacity(entries.len());
        for (_, slot) in entries {
            if let Some(record) = slot.read().await.as_ref() {
                live.push(record.clone());
            }
        }
        let count = live.len();
        wal.compact(live).await?;
        tracing::info!("compacted WAL to {count} records");
        Ok(())
    }

    fn slot(&self, key: &RecordKey) -> Option<SharedRecord> {
        self.records.get(key).map(|e| e.value().clone())
    }

    fn slot_or_reserve(&self, key: RecordKey) -> SharedRecord {
        self.records
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .value()
            .clone()
    }

    async fn log(&self, record: &Record) -> Result<(), StoreError> {
        match &self.wal {
            Some(wal) => wal.append(record).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EntityStore for MemStore {
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Record>, StoreError> {
        let Some(slot) = self.slot(&(kind, key.to_string())) else {
            return Ok(None);
        };
        let guard = slot.read().await;
        Ok(guard.clone())
    }

    async fn query(&self, kind: Kind, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        // Collect handles first: no DashMap shard lock may be held across an await.
        let mut slots: Vec<(String, SharedRecord)> = self
            .records
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        for (_, slot) in slots {
            let guard = slot.read().await;
            if let Some(record) = guard.as_ref()
                && filter.matches(record)
            {
                out.push(record.clone());
            }
        }
        Ok(out)
    }

    async fn put(&self, record: Record) -> Result<Record, StoreError> {
        let _gate = self.gate.read().await;
        let slot = self.slot_or_reserve((record.kind(), record.key()));
        let mut guard = slot.write().await;
        self.log(&record).await?;
        *guard = Some(record.clone());
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&Record>,
        next: Record,
    ) -> Result<bool, StoreError> {
        let key = (next.kind(), next.key());
        if let Some(exp) = expected
            && (exp.kind(), exp.key()) != key
        {
            return Err(StoreError::KeyMismatch {
                expected: format!("{}/{}", exp.kind().as_str(), exp.key()),
                next: format!("{}/{}", key.0.as_str(), key.1),
            });
        }

        let _gate = self.gate.read().await;
        let slot = match expected {
            Some(_) => match self.slot(&key) {
                Some(slot) => slot,
                None => return Ok(false),
            },
            None => self.slot_or_reserve(key),
        };
        let mut guard = slot.write().await;
        if guard.as_ref() != expected {
            return Ok(false);
        }
        self.log(&next).await?;
        *guard = Some(next);
        Ok(true)
    }

    async fn update(
        &self,
        kind: Kind,
        key: &str,
        apply: &mut (dyn for<'r> FnMut(&'r Record) -> Option<Record> + Send),
    ) -> Result<Updated, StoreError> {
        let _gate = self.gate.read().await;
        let Some(slot) = self.slot(&(kind, key.to_string())) else {
            return Ok(Updated::Missing);
        };
        // Held across the WAL append: the next writer reads what this one logged.
        let mut guard = slot.write().await;
        let Some(current) = guard.as_ref() else {
            return Ok(Updated::Missing);
        };
        let Some(next) = apply(current) else {
            return Ok(Updated::Kept);
        };
        if next.kind() != kind || next.key() != key {
            return Err(StoreError::KeyMismatch {
                expected: format!("{}/{key}", kind.as_str()),
                next: format!("{}/{}", next.kind().as_str(), next.key()),
            });
        }
        self.log(&next).await?;
        *guard = Some(next);
        Ok(Updated::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ambulance, UnitStatus};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("darshan_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn ambulance(id: &str, status: UnitStatus) -> Record {
        Record::Ambulance(Ambulance {
            id: id.into(),
            status,
            location: "Base".into(),
            crew: 2,
            assigned_case: None,
        })
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemStore::new();
        let rec = ambulance("amb-1", UnitStatus::Available);
        store.put(rec.clone()).await.unwrap();
        assert_eq!(store.get(Kind::Ambulance, "amb-1").await.unwrap(), Some(rec));
        assert_eq!(store.get(Kind::SecurityUnit, "amb-1").await.unwrap(), None);
        assert_eq!(store.get(Kind::Ambulance, "amb-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_requires_current_value() {
        let store = MemStore::new();
        let available = ambulance("amb-1", UnitStatus::Available);
        let busy = ambulance("amb-1", UnitStatus::Busy);
        store.put(available.clone()).await.unwrap();

        assert!(!store.compare_and_swap(Some(&busy), available.clone()).await.unwrap());
        assert!(store.compare_and_swap(Some(&available), busy.clone()).await.unwrap());
        assert!(!store.compare_and_swap(Some(&available), busy.clone()).await.unwrap());
        assert_eq!(store.get(Kind::Ambulance, "amb-1").await.unwrap(), Some(busy));
    }

    #[tokio::test]
    async fn cas_against_missing_key_fails() {
        let store = MemStore::new();
        let a = ambulance("ghost", UnitStatus::Available);
        assert!(!store.compare_and_swap(Some(&a), a.clone()).await.unwrap());
        assert_eq!(store.get(Kind::Ambulance, "ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_if_absent_only_once() {
        let store = MemStore::new();
        let first = ambulance("amb-1", UnitStatus::Available);
        let second = ambulance("amb-1", UnitStatus::Busy);
        assert!(store.compare_and_swap(None, first.clone()).await.unwrap());
        assert!(!store.compare_and_swap(None, second).await.unwrap());
        assert_eq!(store.get(Kind::Ambulance, "amb-1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn cas_rejects_mismatched_keys() {
        let store = MemStore::new();
        let a = ambulance("amb-1", UnitStatus::Available);
        let b = ambulance("amb-2", UnitStatus::Available);
        store.put(a.clone()).await.unwrap();
        let result = store.compare_and_swap(Some(&a), b).await;
        assert!(matches!(result, Err(StoreError::KeyMismatch { .. })));
    }

    #[tokio::test]
    async fn query_filters_by_kind_and_filter() {
        let store = MemStore::new();
        store.put(ambulance("amb-1", UnitStatus::Available)).await.unwrap();
        store.put(ambulance("amb-2", UnitStatus::Busy)).await.unwrap();
        store.put(ambulance("amb-3", UnitStatus::Available)).await.unwrap();

        let all = store.query(Kind::Ambulance, &Filter::All).await.unwrap();
        assert_eq!(all.len(), 3);
        let free = store
            .query(Kind::Ambulance, &Filter::UnitStatus(UnitStatus::Available))
            .await
            .unwrap();
        let keys: Vec<String> = free.iter().map(Record::key).collect();
        assert_eq!(keys, vec!["amb-1".to_string(), "amb-3".to_string()]);
        assert!(store.query(Kind::Slot, &Filter::All).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_has_single_winner() {
        let store = Arc::new(MemStore::new());
        let available = ambulance("amb-1", UnitStatus::Available);
        store.put(available.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let expected = available.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap(Some(&expected), ambulance("amb-1", UnitStatus::Busy))
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    fn crew_plus_one(record: &Record) -> Option<Record> {
        match record {
            Record::Ambulance(a) => Some(Record::Ambulance(Ambulance {
                crew: a.crew + 1,
                ..a.clone()
            })),
            _ => None,
        }
    }

    #[tokio::test]
    async fn update_reports_missing_kept_written() {
        let store = MemStore::new();
        assert_eq!(
            store.update(Kind::Ambulance, "amb-1", &mut crew_plus_one).await.unwrap(),
            Updated::Missing
        );
        store.put(ambulance("amb-1", UnitStatus::Available)).await.unwrap();
        let mut keep = |_: &Record| -> Option<Record> { None };
        assert_eq!(
            store.update(Kind::Ambulance, "amb-1", &mut keep).await.unwrap(),
            Updated::Kept
        );
        assert_eq!(
            store.update(Kind::Ambulance, "amb-1", &mut crew_plus_one).await.unwrap(),
            Updated::Written
        );
        let Some(Record::Ambulance(a)) = store.get(Kind::Ambulance, "amb-1").await.unwrap() else {
            panic!("ambulance missing");
        };
        assert_eq!(a.crew, 3);
    }

    #[tokio::test]
    async fn update_rejects_rekeyed_record() {
        let store = MemStore::new();
        store.put(ambulance("amb-1", UnitStatus::Available)).await.unwrap();
        let result = store
            .update(Kind::Ambulance, "amb-1", &mut |_: &Record| -> Option<Record> {
                Some(ambulance("amb-2", UnitStatus::Busy))
            })
            .await;
        assert!(matches!(result, Err(StoreError::KeyMismatch { .. })));
        assert_eq!(store.get(Kind::Ambulance, "amb-2").await.unwrap(), None);
    }

    async fn hammer(store: Arc<MemStore>, writers: usize) {
        store.put(ambulance("amb-1", UnitStatus::Available)).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..writers {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.update(Kind::Ambulance, "amb-1", &mut crew_plus_one).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), Updated::Written);
        }
        let Some(Record::Ambulance(a)) = store.get(Kind::Ambulance, "amb-1").await.unwrap() else {
            panic!("ambulance missing");
        };
        assert_eq!(a.crew as usize, 2 + writers);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn contended_updates_all_land() {
        hammer(Arc::new(MemStore::new()), 1000).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn contended_durable_updates_all_land() {
        let path = test_wal_path("contended_update.wal");
        hammer(Arc::new(MemStore::open(&path).unwrap()), 400).await;
        assert_eq!(Wal::replay(&path).unwrap().len(), 401);
    }

    #[tokio::test]
    async fn durable_store_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        {
            let store = MemStore::open(&path).unwrap();
            assert!(store.is_durable());
            let available = ambulance("amb-1", UnitStatus::Available);
            store.put(available.clone()).await.unwrap();
            store
                .compare_and_swap(Some(&available), ambulance("amb-1", UnitStatus::Busy))
                .await
                .unwrap();
            store.put(ambulance("amb-2", UnitStatus::Available)).await.unwrap();
            assert_eq!(store.wal_appends_since_compact().await, 3);
        }

        let reopened = MemStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(Kind::Ambulance, "amb-1").await.unwrap(),
            Some(ambulance("amb-1", UnitStatus::Busy))
        );
        assert_eq!(reopened.query(Kind::Ambulance, &Filter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_cas_is_not_logged() {
        let path = test_wal_path("failed_cas.wal");
        let store = MemStore::open(&path).unwrap();
        let busy = ambulance("amb-1", UnitStatus::Busy);
        store.put(ambulance("amb-1", UnitStatus::Available)).await.unwrap();
        assert!(!store.compare_and_swap(Some(&busy), busy.clone()).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn compaction_keeps_latest_values() {
        let path = test_wal_path("compact_store.wal");
        {
            let store = MemStore::open(&path).unwrap();
            for i in 0..10 {
                let status = if i % 2 == 0 { UnitStatus::Available } else { UnitStatus::Busy };
                store.put(ambulance("amb-1", status)).await.unwrap();
            }
            store.compact().await.unwrap();
            assert_eq!(store.wal_appends_since_compact().await, 0);
            store.put(ambulance("amb-2", UnitStatus::Available)).await.unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 2);
        let reopened = MemStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(Kind::Ambulance, "amb-1").await.unwrap(),
            Some(ambulance("amb-1", UnitStatus::Busy))
        );
    }

    #[tokio::test]
    async fn volatile_compact_is_noop() {
        let store = MemStore::new();
        store.put(ambulance("amb-1", UnitStatus::Available)).await.unwrap();
        store.compact().await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 0);
    }
}
