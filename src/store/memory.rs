use {
    super::{LockRecordStore, StoreError},
    crate::record::{LockRecord, RecordId},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    dashmap::{mapref::entry::Entry, DashMap},
    std::sync::atomic::{AtomicBool, AtomicI64, Ordering},
};

///
/// [`LockRecordStore`] kept in process memory.
///
/// Insert-if-absent and compare-and-swap hold the map entry of the record name for their whole
/// check-then-write, which makes them atomic.
/// Useful to coordinate tasks of a single process and to test the locking protocol without a server.
///
/// The store can be switched to an unavailable state, in which every operation fails with
/// [`StoreError::Unavailable`], to exercise infrastructure failure paths.
///
#[derive(Default)]
pub struct InMemoryLockRecordStore {
    records: DashMap<String, LockRecord>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl InMemoryLockRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    ///
    /// Returns the stored record for `name`, bypassing availability checks.
    ///
    pub fn get(&self, name: &str) -> Option<LockRecord> {
        self.records.get(name).map(|record| record.value().clone())
    }

    ///
    /// Overwrites the record stored under `record.name` without any concurrency check.
    ///
    /// Meant for fixtures, e.g. planting a record left behind by a crashed holder.
    ///
    pub fn put(&self, record: LockRecord) {
        self.next_id.fetch_max(record.id.0.saturating_add(1), Ordering::AcqRel);
        self.records.insert(record.name.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockRecordStore for InMemoryLockRecordStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        self.check_available()?;
        Ok(self.get(name))
    }

    async fn insert_if_absent(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        match self.records.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let id = RecordId(self.next_id.fetch_add(1, Ordering::AcqRel));
                vacant.insert(LockRecord::new(id, name, holder_id));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        expected: &LockRecord,
        new_holder_id: &str,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        match self.records.entry(expected.name.clone()) {
            Entry::Occupied(mut current) if current.get().same_revision(expected) => {
                let next = current.get().refreshed(new_holder_id);
                current.insert(next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, record: &LockRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.records.remove_if(&record.name, |_, current| current.same_revision(record));
        Ok(())
    }

    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut deleted = 0;
        self.records.retain(|_, record| {
            let stale = record.is_older_than(threshold);
            if stale {
                deleted += 1;
            }
            !stale
        });
        Ok(deleted)
    }
}
