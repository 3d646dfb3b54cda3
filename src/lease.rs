use {
    crate::lock::LockService,
    std::time::Duration,
    tokio::{
        sync::{broadcast, oneshot},
        task::JoinHandle,
        time::Instant,
    },
    tracing::{error, trace, warn},
};

// Jiffy is interval between system timer interrupts, typically 10ms for linux systems.
const AT_LEAST_10_JIFFIES: Duration = Duration::from_millis(100);

///
/// Background renewal of a held lock.
///
/// The task calls [`LockService::heartbeat`] every `interval`, measured from the end of the previous
/// renewal, until it is stopped or until the lock turns out to be held by someone else.
///
/// A failed renewal is logged and the task keeps ticking: a few missed heartbeats are tolerated by the
/// staleness window, and if the holder stays cut from the store long enough, its lock is reclaimed by others.
///
/// Dropping the task stops it at its next scheduling point. [`HeartbeatTask::stop`] additionally waits for
/// an in-flight renewal to finish, so that no renewal races a subsequent release.
///
pub struct HeartbeatTask {
    name: String,
    // Dropping the sender wakes up the task so it stops.
    tx_stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    rx_lease_lost: broadcast::Receiver<()>,
}

///
/// Notify when a lock stopped being renewed.
///
pub struct LeaseLostNotify {
    inner: broadcast::Receiver<()>,
}

impl LeaseLostNotify {
    ///
    /// Wait until the renewal task has stopped, either because the lock was lost or because the task was stopped.
    ///
    pub async fn recv(mut self) {
        let _ = self.inner.recv().await;
    }
}

impl Clone for LeaseLostNotify {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.resubscribe(),
        }
    }
}

impl HeartbeatTask {
    ///
    /// Spawns the renewal task of `holder_id` on `name`, on the current tokio runtime.
    ///
    pub fn spawn(
        lock_service: LockService,
        name: impl Into<String>,
        holder_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let name = name.into();
        let holder_id = holder_id.into();
        let (tx_stop, mut rx_stop) = oneshot::channel::<()>();
        let (tx_lost, rx_lost) = broadcast::channel(1);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let name = task_name;
            let mut last_heartbeat = Instant::now();
            let mut next_renewal = last_heartbeat + interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_renewal) => {
                        let since_last_heartbeat = last_heartbeat.elapsed();
                        if since_last_heartbeat > interval {
                            let dt = since_last_heartbeat - interval;
                            if dt >= AT_LEAST_10_JIFFIES {
                                warn!("heartbeat of lock {name} is {dt:?} late");
                            }
                        }
                        match lock_service.heartbeat(&name, &holder_id).await {
                            Ok(true) => {
                                last_heartbeat = Instant::now();
                                trace!("renewed lock {name} after {since_last_heartbeat:?}");
                            }
                            Ok(false) => {
                                error!("lock {name} is no longer held by {holder_id}, stopping heartbeat");
                                let _ = tx_lost.send(());
                                break;
                            }
                            Err(e) => {
                                warn!("failed to renew lock {name}, got {e}");
                            }
                        }
                        next_renewal = Instant::now() + interval;
                    }
                    _ = &mut rx_stop => {
                        trace!("stopping heartbeat of lock {name}, last renewal: {:?} ago", last_heartbeat.elapsed());
                        break;
                    }
                }
            }
        });

        Self {
            name,
            tx_stop: Some(tx_stop),
            handle: Some(handle),
            rx_lease_lost: rx_lost,
        }
    }

    pub fn get_lease_lost_notify(&self) -> LeaseLostNotify {
        LeaseLostNotify {
            inner: self.rx_lease_lost.resubscribe(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    ///
    /// Stops the renewal and waits for the task to exit.
    ///
    pub async fn stop(mut self) {
        if let Some(tx_stop) = self.tx_stop.take() {
            let _ = tx_stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("heartbeat task of lock {} failed: {e:?}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::LockConfig, store::memory::InMemoryLockRecordStore},
        std::sync::Arc,
    };

    const INTERVAL: Duration = Duration::from_millis(100);

    async fn held_lock(name: &str) -> (Arc<InMemoryLockRecordStore>, LockService) {
        let store = Arc::new(InMemoryLockRecordStore::new());
        let service = LockService::new(store.clone(), &LockConfig::default());
        assert!(service.acquire(name, "a", None).await.expect("acquire"));
        (store, service)
    }

    #[tokio::test(start_paused = true)]
    async fn it_should_renew_the_lock_periodically() {
        let (store, service) = held_lock("job-1").await;
        let initial = store.get("job-1").expect("record");

        let task = HeartbeatTask::spawn(service, "job-1", "a", INTERVAL);
        tokio::time::sleep(INTERVAL / 2).await;
        assert_eq!(store.get("job-1").expect("record").version, initial.version);

        tokio::time::sleep(INTERVAL).await;
        let renewed = store.get("job-1").expect("record");
        assert_ne!(renewed.version, initial.version);
        assert_eq!(renewed.holder_id, "a");

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_task_no_longer_renews() {
        let (store, service) = held_lock("job-1").await;
        let task = HeartbeatTask::spawn(service, "job-1", "a", INTERVAL);

        task.stop().await;
        let version = store.get("job-1").expect("record").version;
        tokio::time::sleep(INTERVAL * 5).await;

        assert_eq!(store.get("job-1").expect("record").version, version);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_prompt() {
        let (_, service) = held_lock("job-1").await;
        let task = HeartbeatTask::spawn(service, "job-1", "a", Duration::from_secs(3600));

        let started = Instant::now();
        task.stop().await;

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn it_should_notify_when_the_lock_is_lost() {
        let (store, service) = held_lock("job-1").await;
        let task = HeartbeatTask::spawn(service.clone(), "job-1", "a", INTERVAL);
        let notify = task.get_lease_lost_notify();

        // Someone else reclaims the lock.
        let record = store.get("job-1").expect("record");
        assert!(service
            .records()
            .compare_and_swap(&record, "b")
            .await
            .expect("cas"));

        tokio::time::timeout(INTERVAL * 3, notify.recv())
            .await
            .expect("lease lost notification");
        assert!(task.is_finished());
        assert_eq!(store.get("job-1").expect("record").holder_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewals_do_not_stop_the_task() {
        let (store, service) = held_lock("job-1").await;
        let initial = store.get("job-1").expect("record");
        let task = HeartbeatTask::spawn(service, "job-1", "a", INTERVAL);

        store.set_unavailable(true);
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(!task.is_finished());

        store.set_unavailable(false);
        tokio::time::sleep(INTERVAL * 2).await;
        assert_ne!(store.get("job-1").expect("record").version, initial.version);

        task.stop().await;
    }
}
