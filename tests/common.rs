use {
    lease_lock::{store::memory::InMemoryLockRecordStore, LockConfig, LockCoordinator},
    std::{sync::Arc, time::Duration},
};

#[allow(dead_code)]
pub async fn get_etcd_client() -> etcd_client::Client {
    etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd")
}

#[allow(dead_code)]
pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

///
/// Protocol timings scaled down so that renewal and staleness happen within a test.
///
#[allow(dead_code)]
pub fn fast_config() -> LockConfig {
    LockConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_lease_duration(Duration::from_millis(200))
}

#[allow(dead_code)]
pub fn memory_coordinator(config: LockConfig) -> (Arc<InMemoryLockRecordStore>, LockCoordinator) {
    let store = Arc::new(InMemoryLockRecordStore::new());
    let coordinator =
        LockCoordinator::with_config(store.clone(), config).expect("valid lock config");
    (store, coordinator)
}
