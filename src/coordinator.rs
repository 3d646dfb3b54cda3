use {
    crate::{
        config::{ConfigError, LockConfig},
        lease::{HeartbeatTask, LeaseLostNotify},
        lock::LockService,
        store::{LockRecordStore, StoreError},
    },
    core::fmt,
    rand::{distributions::Alphanumeric, thread_rng, Rng},
    std::{future::Future, sync::Arc},
    tracing::{trace, warn},
};

///
/// Builds a holder identity unique to this call: `{pid}@{hostname}/{random token}`.
///
/// The random token keeps concurrent holders of the same process apart.
///
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let token: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{}@{}/{}", std::process::id(), host, token)
}

///
/// Failure of [`LockCoordinator::execute`].
///
/// Errors raised by the critical section are kept apart from failures of the locking machinery.
/// A busy lock is not an error.
///
#[derive(Debug)]
pub enum ExecuteError<E> {
    ///
    /// The critical section ran and returned an error.
    CriticalSection(E),
    ///
    /// The lock store failed while acquiring the lock.
    Infrastructure(StoreError),
}

impl<E> ExecuteError<E> {
    pub fn is_critical_section(&self) -> bool {
        matches!(self, Self::CriticalSection(_))
    }

    pub fn into_critical_section(self) -> Option<E> {
        match self {
            Self::CriticalSection(e) => Some(e),
            Self::Infrastructure(_) => None,
        }
    }
}

impl<E> From<StoreError> for ExecuteError<E> {
    fn from(e: StoreError) -> Self {
        Self::Infrastructure(e)
    }
}

impl<E: fmt::Display> fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CriticalSection(e) => write!(f, "critical section failed: {e}"),
            Self::Infrastructure(e) => write!(f, "lock infrastructure failed: {e}"),
        }
    }
}

impl<E> std::error::Error for ExecuteError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CriticalSection(e) => Some(e),
            Self::Infrastructure(e) => Some(e),
        }
    }
}

///
/// Runs critical sections under distributed locks.
///
/// For every call, the coordinator:
///     - derives a fresh holder identity
///     - acquires the named lock with the configured lease
///     - renews the lease in the background while the critical section runs
///     - stops the renewal and releases the lock on every exit path
///
/// Cloning the coordinator is cheap, every clone shares the same store.
///
/// Examples
///
/// ```ignore
/// use {lease_lock::{store::memory::InMemoryLockRecordStore, LockCoordinator}, std::sync::Arc};
///
/// let coordinator = LockCoordinator::new(Arc::new(InMemoryLockRecordStore::new()));
///
/// let ran = coordinator
///     .execute("nightly-report", || async {
///         // Only one process at a time gets here.
///         Ok::<_, std::io::Error>(())
///     })
///     .await?;
/// ```
///
#[derive(Clone)]
pub struct LockCoordinator {
    lock_service: LockService,
    config: LockConfig,
}

impl LockCoordinator {
    ///
    /// Creates a coordinator with the default [`LockConfig`].
    ///
    pub fn new(store: Arc<dyn LockRecordStore>) -> Self {
        let config = LockConfig::default();
        Self {
            lock_service: LockService::new(store, &config),
            config,
        }
    }

    pub fn with_config(
        store: Arc<dyn LockRecordStore>,
        config: LockConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            lock_service: LockService::new(store, &config),
            config,
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn lock_service(&self) -> &LockService {
        &self.lock_service
    }

    ///
    /// Tries to lock `name` under a freshly generated holder identity.
    ///
    /// Returns `Ok(None)` if the lock is busy. See [`LockCoordinator::try_lock_as`].
    ///
    pub async fn try_lock<S>(&self, name: S) -> Result<Option<ManagedLock>, StoreError>
    where
        S: AsRef<str>,
    {
        self.try_lock_as(name, generate_holder_id()).await
    }

    ///
    /// Tries to lock `name` for `holder_id`.
    ///
    /// On success the returned [`ManagedLock`] renews the lease until it is released or dropped.
    /// If the store fails mid-acquisition, a best-effort release runs before the error is returned,
    /// in case the claim was written before the failure.
    ///
    pub async fn try_lock_as<S>(
        &self,
        name: S,
        holder_id: impl Into<String>,
    ) -> Result<Option<ManagedLock>, StoreError>
    where
        S: AsRef<str>,
    {
        let name = name.as_ref();
        let holder_id = holder_id.into();
        let acquired = match self
            .lock_service
            .acquire(name, &holder_id, Some(self.config.lease_duration))
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.lock_service.release(name, &holder_id).await;
                return Err(e);
            }
        };
        if !acquired {
            return Ok(None);
        }

        let heartbeat = HeartbeatTask::spawn(
            self.lock_service.clone(),
            name,
            holder_id.as_str(),
            self.config.heartbeat_interval,
        );
        Ok(Some(ManagedLock {
            name: name.to_string(),
            holder_id,
            lock_service: self.lock_service.clone(),
            heartbeat: Some(heartbeat),
            released: false,
        }))
    }

    ///
    /// Runs `critical_section` once, under the lock `name`, and returns its output.
    ///
    /// Returns `Ok(None)` without running anything if the lock is busy.
    ///
    pub async fn run<T, E, F, Fut>(
        &self,
        name: impl AsRef<str>,
        critical_section: F,
    ) -> Result<Option<T>, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = name.as_ref();
        let Some(lock) = self.try_lock(name).await? else {
            trace!("Lock {name} is busy, skipping critical section");
            return Ok(None);
        };

        // If this future is dropped or the critical section panics, `lock` releases itself on drop.
        let outcome = critical_section().await;
        lock.release().await;

        outcome.map(Some).map_err(ExecuteError::CriticalSection)
    }

    ///
    /// Runs `critical_section` once, under the lock `name`.
    ///
    /// Returns `Ok(true)` if the lock was acquired and the critical section completed,
    /// `Ok(false)` if the lock is held by someone else.
    ///
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: impl AsRef<str>,
        critical_section: F,
    ) -> Result<bool, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(name, critical_section)
            .await
            .map(|output| output.is_some())
    }
}

///
/// A held lock, renewed in the background until released.
///
/// Prefer [`ManagedLock::release`]. Dropping the lock stops the renewal and schedules the release
/// on the current tokio runtime. Outside of a runtime the record is left to expire.
///
pub struct ManagedLock {
    name: String,
    holder_id: String,
    lock_service: LockService,
    heartbeat: Option<HeartbeatTask>,
    released: bool,
}

impl ManagedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn get_lease_lost_notify(&self) -> Option<LeaseLostNotify> {
        self.heartbeat.as_ref().map(HeartbeatTask::get_lease_lost_notify)
    }

    ///
    /// Checks in the store that the lock still belongs to this holder.
    ///
    pub async fn is_alive(&self) -> Result<bool, StoreError> {
        self.lock_service.is_held_by(&self.name, &self.holder_id).await
    }

    ///
    /// Stops the renewal, waits for any in-flight renewal, then releases the lock.
    ///
    /// Release failures are logged, not returned.
    ///
    pub async fn release(mut self) {
        self.released = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        self.lock_service.release(&self.name, &self.holder_id).await;
    }
}

impl Drop for ManagedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let heartbeat = self.heartbeat.take();
        let lock_service = self.lock_service.clone();
        let name = std::mem::take(&mut self.name);
        let holder_id = std::mem::take(&mut self.holder_id);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Some(heartbeat) = heartbeat {
                        heartbeat.stop().await;
                    }
                    lock_service.release(&name, &holder_id).await;
                });
            }
            Err(_) => {
                // The heartbeat stops once its stop channel is dropped.
                warn!("no tokio runtime to release lock {name}, it will expire once stale");
            }
        }
    }
}
