use {
    crate::{
        config::LockConfig,
        record_service::LockRecordService,
        store::{LockRecordStore, StoreError},
    },
    chrono::Utc,
    std::{sync::Arc, time::Duration},
    tracing::{info, trace, warn},
};

///
/// Lease acquisition, renewal and release over a [`LockRecordService`].
///
/// A lock is free when no record exists for its name, held when its record has a recent heartbeat,
/// and stale when the heartbeat is older than `staleness_multiplier * lease_duration`.
/// Stale locks are taken over with a compare-and-swap, so among concurrent callers at most one wins.
///
/// Losing a race or finding the lock busy is reported as `Ok(false)`, only store failures are errors.
///
#[derive(Clone)]
pub struct LockService {
    records: LockRecordService,
    staleness_multiplier: u32,
}

impl LockService {
    pub fn new(store: Arc<dyn LockRecordStore>, config: &LockConfig) -> Self {
        Self {
            records: LockRecordService::with_retention(store, config.retention),
            staleness_multiplier: config.staleness_multiplier,
        }
    }

    pub fn records(&self) -> &LockRecordService {
        &self.records
    }

    ///
    /// Tries to make `holder_id` the holder of `name`.
    ///
    /// Records older than the retention window are garbage collected first, for every name.
    /// Then the lock is inserted if free, or taken over if its holder stopped heartbeating for
    /// longer than `staleness_multiplier * lease_duration`.
    ///
    /// Without a `lease_duration`, an existing record can never be judged stale and acquisition fails.
    ///
    pub async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        lease_duration: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.records.garbage_collect_default().await?;

        trace!("Trying to lock {name} for {holder_id}...");
        let Some(record) = self.records.find_by_name(name).await? else {
            let inserted = self.records.insert_if_absent(name, holder_id).await?;
            if inserted {
                info!("Lock {name} acquired by {holder_id}");
            } else {
                trace!("Lost the race to insert lock {name}");
            }
            return Ok(inserted);
        };

        if record.is_alive(Utc::now(), lease_duration, self.staleness_multiplier) {
            trace!("Lock {name} is held by {}", record.holder_id);
            return Ok(false);
        }

        let transferred = self.records.compare_and_swap(&record, holder_id).await?;
        if transferred {
            info!(
                "Lock {name} reclaimed by {holder_id} from stale holder {}, last heartbeat: {:?}",
                record.holder_id, record.heartbeat
            );
        } else {
            trace!("Lost the race to reclaim stale lock {name}");
        }
        Ok(transferred)
    }

    ///
    /// Renews the lease of `holder_id` on `name`.
    ///
    /// Returns `Ok(false)`, without touching the store, when `holder_id` no longer holds the lock,
    /// for instance because it was reclaimed as stale.
    ///
    pub async fn heartbeat(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        match self.records.find_by_name_and_holder(name, holder_id).await? {
            Some(record) => self.records.heartbeat(&record).await,
            None => Ok(false),
        }
    }

    ///
    /// Best-effort release of `name` if still held by `holder_id`.
    ///
    /// Failures are logged and swallowed: release runs on exit paths where a more relevant
    /// outcome (or error) is already being returned.
    ///
    pub async fn release(&self, name: &str, holder_id: &str) {
        match self.delete_if_held(name, holder_id).await {
            Ok(true) => info!("Released lock {name} held by {holder_id}"),
            Ok(false) => trace!("Lock {name} was not held by {holder_id}, nothing to release"),
            Err(e) => warn!("Failed to release lock {name} held by {holder_id}: {e}"),
        }
    }

    async fn delete_if_held(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        match self.records.find_by_name_and_holder(name, holder_id).await? {
            Some(record) => {
                self.records.delete(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    ///
    /// Tells if `holder_id` currently owns a record for `name`.
    ///
    pub async fn is_held_by(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .find_by_name_and_holder(name, holder_id)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            record::{LockRecord, RecordId},
            store::memory::InMemoryLockRecordStore,
        },
    };

    const NAME: &str = "testing-lock";
    const HOLDER: &str = "holder";

    fn lock_service() -> (Arc<InMemoryLockRecordStore>, LockService) {
        let store = Arc::new(InMemoryLockRecordStore::new());
        let service = LockService::new(store.clone(), &LockConfig::default());
        (store, service)
    }

    #[tokio::test]
    async fn acquire_depends_on_lease_duration() {
        let (_, service) = lock_service();

        assert!(service.acquire(NAME, HOLDER, None).await.expect("acquire"));
        assert!(!service
            .acquire(NAME, HOLDER, Some(Duration::from_secs(60)))
            .await
            .expect("acquire"));
        assert!(service
            .acquire(NAME, HOLDER, Some(Duration::ZERO))
            .await
            .expect("acquire"));
    }

    #[tokio::test]
    async fn acquire_without_lease_never_reclaims_existing_record() {
        let (store, service) = lock_service();
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..LockRecord::new(RecordId(1), NAME, "dead-holder")
        });

        assert!(!service.acquire(NAME, HOLDER, None).await.expect("acquire"));
        assert_eq!(store.get(NAME).expect("record").holder_id, "dead-holder");
    }

    #[tokio::test]
    async fn stale_holder_is_replaced_with_a_new_version() {
        let (store, service) = lock_service();
        let stale = LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::seconds(61)),
            ..LockRecord::new(RecordId(1), NAME, "dead-holder")
        };
        store.put(stale.clone());

        assert!(service
            .acquire(NAME, HOLDER, Some(Duration::from_secs(30)))
            .await
            .expect("acquire"));

        let record = store.get(NAME).expect("record");
        assert_eq!(record.holder_id, HOLDER);
        assert_eq!(record.id, stale.id);
        assert_ne!(record.version, stale.version);
    }

    #[tokio::test]
    async fn live_holder_within_twice_the_lease_keeps_the_lock() {
        let (store, service) = lock_service();
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::seconds(45)),
            ..LockRecord::new(RecordId(1), NAME, "slow-holder")
        });

        assert!(!service
            .acquire(NAME, HOLDER, Some(Duration::from_secs(30)))
            .await
            .expect("acquire"));
        assert_eq!(store.get(NAME).expect("record").holder_id, "slow-holder");
    }

    #[tokio::test]
    async fn acquire_garbage_collects_abandoned_records_of_other_names() {
        let (store, service) = lock_service();
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::minutes(30)),
            ..LockRecord::new(RecordId(1), "abandoned", "dead-holder")
        });

        assert!(service.acquire(NAME, HOLDER, None).await.expect("acquire"));
        assert!(store.get("abandoned").is_none());
    }

    #[tokio::test]
    async fn heartbeat_changes_version() {
        let (store, service) = lock_service();
        service.acquire(NAME, HOLDER, None).await.expect("acquire");
        let version = store.get(NAME).expect("record").version;

        assert!(service.heartbeat(NAME, HOLDER).await.expect("heartbeat"));

        let next_version = store.get(NAME).expect("record").version;
        assert_ne!(version, next_version);
    }

    #[tokio::test]
    async fn heartbeat_on_reclaimed_lock_is_a_noop() {
        let (store, service) = lock_service();
        service.acquire(NAME, "first", None).await.expect("acquire");
        service
            .acquire(NAME, "second", Some(Duration::ZERO))
            .await
            .expect("acquire");
        let record = store.get(NAME).expect("record");

        assert!(!service.heartbeat(NAME, "first").await.expect("heartbeat"));
        assert_eq!(store.get(NAME), Some(record));
    }

    #[tokio::test]
    async fn release_deletes_own_record_only() {
        let (store, service) = lock_service();
        service.release(NAME, HOLDER).await;
        service.acquire(NAME, HOLDER, None).await.expect("acquire");

        service.release(NAME, "someone-else").await;
        assert!(store.get(NAME).is_some());

        service.release(NAME, HOLDER).await;
        assert!(store.get(NAME).is_none());
    }

    #[tokio::test]
    async fn release_swallows_store_failures() {
        let (store, service) = lock_service();
        service.acquire(NAME, HOLDER, None).await.expect("acquire");
        store.set_unavailable(true);

        service.release(NAME, HOLDER).await;

        store.set_unavailable(false);
        assert!(service.is_held_by(NAME, HOLDER).await.expect("lookup"));
    }

    #[tokio::test]
    async fn acquire_propagates_store_failures() {
        let (store, service) = lock_service();
        store.set_unavailable(true);

        let result = service.acquire(NAME, HOLDER, None).await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquisitions_have_a_single_winner() {
        let (_, service) = lock_service();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .acquire(NAME, &format!("holder-{i}"), Some(Duration::from_secs(30)))
                        .await
                        .expect("acquire")
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reclaims_of_a_stale_lock_have_a_single_winner() {
        let (store, service) = lock_service();
        store.put(LockRecord {
            heartbeat: Some(Utc::now() - chrono::Duration::seconds(120)),
            ..LockRecord::new(RecordId(1), NAME, "dead-holder")
        });

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .acquire(NAME, &format!("holder-{i}"), Some(Duration::from_secs(30)))
                        .await
                        .expect("acquire")
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_ne!(store.get(NAME).expect("record").holder_id, "dead-holder");
    }
}
