use {
    crate::{
        config::DEFAULT_RETENTION,
        record::LockRecord,
        store::{LockRecordStore, StoreError},
    },
    chrono::{DateTime, Utc},
    std::{sync::Arc, time::Duration},
    tracing::{debug, trace},
};

///
/// Maps the domain operations of the locking protocol onto a [`LockRecordStore`].
///
/// Holds no locking policy, except for the retention window used by [`LockRecordService::garbage_collect_default`].
///
#[derive(Clone)]
pub struct LockRecordService {
    store: Arc<dyn LockRecordStore>,
    retention: Duration,
}

impl LockRecordService {
    pub fn new(store: Arc<dyn LockRecordStore>) -> Self {
        Self::with_retention(store, DEFAULT_RETENTION)
    }

    pub fn with_retention(store: Arc<dyn LockRecordStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        self.store.find_by_name(name).await
    }

    pub async fn find_by_name_and_holder(
        &self,
        name: &str,
        holder_id: &str,
    ) -> Result<Option<LockRecord>, StoreError> {
        self.store.find_by_name_and_holder(name, holder_id).await
    }

    pub async fn insert_if_absent(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        self.store.insert_if_absent(name, holder_id).await
    }

    ///
    /// Hands `record` over to `new_holder_id`. Returns `false` if `record` is no longer the stored revision.
    ///
    pub async fn compare_and_swap(
        &self,
        record: &LockRecord,
        new_holder_id: &str,
    ) -> Result<bool, StoreError> {
        self.store.compare_and_swap(record, new_holder_id).await
    }

    ///
    /// Refreshes `record` for its own holder. Returns `false` if the record changed in the meantime.
    ///
    pub async fn heartbeat(&self, record: &LockRecord) -> Result<bool, StoreError> {
        self.store.compare_and_swap(record, &record.holder_id).await
    }

    pub async fn delete(&self, record: &LockRecord) -> Result<(), StoreError> {
        self.store.delete(record).await
    }

    ///
    /// Deletes every record whose heartbeat is missing or older than `now - older_than`.
    ///
    /// This is how locks of crashed holders eventually disappear.
    ///
    pub async fn garbage_collect(&self, older_than: Duration) -> Result<usize, StoreError> {
        let threshold = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|older_than| Utc::now().checked_sub_signed(older_than))
            .unwrap_or_else(|| {
                trace!("retention {older_than:?} reaches before any representable date");
                DateTime::<Utc>::MIN_UTC
            });
        let deleted = self.store.delete_older_than(threshold).await?;
        if deleted > 0 {
            debug!("garbage collected {deleted} stale lock record(s) older than {threshold}");
        }
        Ok(deleted)
    }

    pub async fn garbage_collect_default(&self) -> Result<usize, StoreError> {
        self.garbage_collect(self.retention).await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{record::RecordId, store::memory::InMemoryLockRecordStore},
    };

    fn service() -> (Arc<InMemoryLockRecordStore>, LockRecordService) {
        let store = Arc::new(InMemoryLockRecordStore::new());
        (store.clone(), LockRecordService::new(store))
    }

    #[tokio::test]
    async fn find_by_name_and_holder_ignores_other_holders() {
        let (_, service) = service();
        service.insert_if_absent("job-1", "a").await.expect("insert");

        assert!(service
            .find_by_name_and_holder("job-1", "a")
            .await
            .expect("find")
            .is_some());
        assert!(service
            .find_by_name_and_holder("job-1", "b")
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn heartbeat_keeps_holder_and_changes_version() {
        let (store, service) = service();
        service.insert_if_absent("job-1", "a").await.expect("insert");
        let before = store.get("job-1").expect("record");

        assert!(service.heartbeat(&before).await.expect("heartbeat"));

        let after = store.get("job-1").expect("record");
        assert_eq!(after.holder_id, "a");
        assert_ne!(after.version, before.version);
        // The previous snapshot is now stale.
        assert!(!service.heartbeat(&before).await.expect("heartbeat"));
    }

    #[tokio::test]
    async fn garbage_collect_uses_retention_window() {
        let (store, service) = service();
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::minutes(11)),
            ..LockRecord::new(RecordId(1), "abandoned", "a")
        });
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::minutes(9)),
            ..LockRecord::new(RecordId(2), "quiet", "a")
        });

        assert_eq!(service.garbage_collect_default().await.expect("gc"), 1);
        assert!(store.get("abandoned").is_none());
        assert!(store.get("quiet").is_some());
    }

    #[tokio::test]
    async fn garbage_collect_with_huge_window_only_deletes_missing_heartbeats() {
        let (store, service) = service();
        store.put(LockRecord {
            heartbeat: None,
            ..LockRecord::new(RecordId(1), "never", "a")
        });
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::days(3650)),
            ..LockRecord::new(RecordId(2), "ancient", "a")
        });

        assert_eq!(service.garbage_collect(Duration::MAX).await.expect("gc"), 1);
        assert!(store.get("never").is_none());
        assert!(store.get("ancient").is_some());
    }
}
