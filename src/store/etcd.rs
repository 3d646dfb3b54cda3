use {
    super::{LockRecordStore, StoreError},
    crate::{
        record::{LockRecord, RecordId},
        retry::{retry_etcd_get, retry_etcd_txn, RetryPolicy},
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    etcd_client::{Compare, CompareOp, GetOptions, KeyValue, Txn, TxnOp, TxnOpResponse},
    futures::future::join_all,
    serde::{Deserialize, Serialize},
    tracing::{trace, warn},
};

pub const DEFAULT_KEY_PREFIX: &str = "lease-lock/";

///
/// Value stored under a lock key. The record name is the key suffix and the record id is the key's `create_revision`.
///
#[derive(Debug, Serialize, Deserialize)]
struct StoredLockRecord {
    holder_id: String,
    version: String,
    heartbeat: Option<DateTime<Utc>>,
}

///
/// [`LockRecordStore`] backed by etcd.
///
/// Each record lives under `{prefix}{name}`:
///     - insert-if-absent is a transaction guarded by `create_revision == 0`
///     - compare-and-swap and delete are transactions guarded by the key `create_revision` (the record id)
///       and `mod_revision` (the revision of the snapshot being replaced)
///
/// The version token travels inside the value, so that every record write, including heartbeats, changes it.
///
/// Transient gRPC failures are retried according to the store [`RetryPolicy`].
/// When a retried write turns out to have landed on a previous attempt, the write is reported as successful.
///
/// Examples
///
/// ```ignore
/// use lease_lock::{store::etcd::EtcdLockRecordStore, LockCoordinator};
///
/// let etcd = etcd_client::Client::connect(["http://localhost:2379"], None).await?;
/// let coordinator = LockCoordinator::new(std::sync::Arc::new(EtcdLockRecordStore::new(etcd)));
/// ```
///
#[derive(Clone)]
pub struct EtcdLockRecordStore {
    etcd: etcd_client::Client,
    prefix: String,
    retry_policy: RetryPolicy,
}

impl EtcdLockRecordStore {
    pub fn new(etcd: etcd_client::Client) -> Self {
        Self::with_prefix(etcd, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(etcd: etcd_client::Client, prefix: impl Into<String>) -> Self {
        Self {
            etcd,
            prefix: prefix.into(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn encode(record: &LockRecord) -> Result<Vec<u8>, StoreError> {
        let stored = StoredLockRecord {
            holder_id: record.holder_id.clone(),
            version: record.version.clone(),
            heartbeat: record.heartbeat,
        };
        serde_json::to_vec(&stored).map_err(|source| StoreError::Codec {
            name: record.name.clone(),
            source,
        })
    }

    fn decode(name: &str, kv: &KeyValue) -> Result<LockRecord, StoreError> {
        let stored = decode_value(name, kv.value())?;
        Ok(LockRecord {
            id: RecordId(kv.create_revision()),
            name: name.to_string(),
            holder_id: stored.holder_id,
            version: stored.version,
            heartbeat: stored.heartbeat,
            revision: kv.mod_revision(),
        })
    }

    fn revision_guard(key: &str, record: &LockRecord) -> Vec<Compare> {
        vec![
            Compare::create_revision(key, CompareOp::Equal, record.id.0),
            Compare::mod_revision(key, CompareOp::Equal, record.revision),
        ]
    }

    ///
    /// Runs `txn` and tells if it applied. When the guard failed, the current value fetched by the
    /// `or_else` branch is compared to `written`: equality means an earlier retried attempt already applied it.
    ///
    async fn apply_guarded_write(
        &self,
        key: &str,
        guard: Vec<Compare>,
        write: TxnOp,
        written: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        let txn = Txn::new()
            .when(guard)
            .and_then(vec![write])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = retry_etcd_txn(self.etcd.clone(), self.retry_policy, txn).await?;
        if resp.succeeded() {
            return Ok(true);
        }
        let Some(written) = written else {
            return Ok(false);
        };
        let already_applied = resp.op_responses().into_iter().any(|op| match op {
            TxnOpResponse::Get(get) => get.kvs().iter().any(|kv| kv.value() == written),
            _ => false,
        });
        if already_applied {
            trace!("write on {key} was applied by a previous attempt");
        }
        Ok(already_applied)
    }

    async fn delete_guarded(&self, record: &LockRecord) -> Result<bool, StoreError> {
        let key = self.key(&record.name);
        let guard = Self::revision_guard(&key, record);
        self.apply_guarded_write(&key, guard, TxnOp::delete(key.as_str(), None), None)
            .await
    }
}

#[async_trait]
impl LockRecordStore for EtcdLockRecordStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        let resp =
            retry_etcd_get(self.etcd.clone(), self.retry_policy, self.key(name), None).await?;
        resp.kvs()
            .first()
            .map(|kv| Self::decode(name, kv))
            .transpose()
    }

    async fn insert_if_absent(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        let key = self.key(name);
        // The real id is assigned by etcd as the key create_revision.
        let record = LockRecord::new(RecordId(0), name, holder_id);
        let value = Self::encode(&record)?;
        let guard = vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)];
        let put = TxnOp::put(key.as_str(), value.clone(), None);
        self.apply_guarded_write(&key, guard, put, Some(&value)).await
    }

    async fn compare_and_swap(
        &self,
        expected: &LockRecord,
        new_holder_id: &str,
    ) -> Result<bool, StoreError> {
        let key = self.key(&expected.name);
        let next = expected.refreshed(new_holder_id);
        let next_value = Self::encode(&next)?;
        let guard = Self::revision_guard(&key, expected);
        let put = TxnOp::put(key.as_str(), next_value.clone(), None);
        self.apply_guarded_write(&key, guard, put, Some(&next_value)).await
    }

    async fn delete(&self, record: &LockRecord) -> Result<(), StoreError> {
        if !self.delete_guarded(record).await? {
            trace!("lock {} was already deleted or changed hands", record.name);
        }
        Ok(())
    }

    async fn delete_older_than(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError> {
        let resp = retry_etcd_get(
            self.etcd.clone(),
            self.retry_policy,
            self.prefix.clone(),
            Some(GetOptions::new().with_prefix()),
        )
        .await?;

        let mut stale = vec![];
        for kv in resp.kvs() {
            let decoded =
                record_name(&self.prefix, kv.key()).and_then(|name| Self::decode(name, kv));
            match decoded {
                Ok(record) if record.is_older_than(threshold) => stale.push(record),
                Ok(_) => {}
                Err(e) => warn!("skipping undecodable lock record: {e}"),
            }
        }

        let results = join_all(stale.iter().map(|record| self.delete_guarded(record))).await;
        let mut deleted = 0;
        for result in results {
            if result? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

///
/// Extracts the record name from a key listed under `prefix`.
///
fn record_name<'a>(prefix: &str, key: &'a [u8]) -> Result<&'a str, StoreError> {
    let key = std::str::from_utf8(key).map_err(|_| {
        StoreError::InvalidRecord(format!(
            "key {} is not valid UTF-8",
            String::from_utf8_lossy(key)
        ))
    })?;
    key.strip_prefix(prefix)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            StoreError::InvalidRecord(format!("key {key} is not a lock under {prefix}"))
        })
}

fn decode_value(name: &str, value: &[u8]) -> Result<StoredLockRecord, StoreError> {
    let stored: StoredLockRecord =
        serde_json::from_slice(value).map_err(|source| StoreError::Codec {
            name: name.to_string(),
            source,
        })?;
    if stored.holder_id.is_empty() || stored.version.is_empty() {
        return Err(StoreError::InvalidRecord(format!(
            "lock {name} has no holder or version"
        )));
    }
    Ok(stored)
}
