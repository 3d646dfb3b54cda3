use {
    crate::record::LockRecord,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

///
/// etcd-backed store, see [`etcd::EtcdLockRecordStore`].
pub mod etcd;

///
/// Process-local store, see [`memory::InMemoryLockRecordStore`].
pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("failed to encode or decode lock record `{name}`: {source}")]
    Codec {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid lock record: {0}")]
    InvalidRecord(String),
}

///
/// Persistence contract for [`LockRecord`]s.
///
/// Implementations must provide two atomic primitives:
///     - a uniqueness constraint on the record name, backing [`LockRecordStore::insert_if_absent`]
///     - a conditional update keyed on `(id, name, version)`, backing [`LockRecordStore::compare_and_swap`]
///
/// Losing a race is never an error: both primitives report it as `Ok(false)`.
/// Only connectivity or data failures surface as [`StoreError`].
///
#[async_trait]
pub trait LockRecordStore: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<LockRecord>, StoreError>;

    ///
    /// Returns the record for `name` only if it is currently held by `holder_id`.
    ///
    async fn find_by_name_and_holder(
        &self,
        name: &str,
        holder_id: &str,
    ) -> Result<Option<LockRecord>, StoreError> {
        Ok(self
            .find_by_name(name)
            .await?
            .filter(|record| record.is_held_by(holder_id)))
    }

    ///
    /// Creates a fresh record for `name` held by `holder_id`.
    ///
    /// Returns `Ok(false)` if a record for `name` already exists.
    ///
    async fn insert_if_absent(&self, name: &str, holder_id: &str) -> Result<bool, StoreError>;

    ///
    /// Replaces `expected` by [`LockRecord::refreshed`] with `new_holder_id`, only if the stored
    /// record still has the same `(id, name, version)`.
    ///
    /// Returns `Ok(false)` if the snapshot is stale.
    ///
    async fn compare_and_swap(
        &self,
        expected: &LockRecord,
        new_holder_id: &str,
    ) -> Result<bool, StoreError>;

    ///
    /// Deletes the record if it still matches `record`. Deleting an absent record is not an error.
    ///
    async fn delete(&self, record: &LockRecord) -> Result<(), StoreError>;

    ///
    /// Deletes every record whose heartbeat is missing or not newer than `threshold`.
    ///
    /// Returns the number of deleted records.
    ///
    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError>;
}
