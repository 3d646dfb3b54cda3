use {
    core::time::Duration,
    lease_lock::{store::etcd::EtcdLockRecordStore, LockConfig, LockCoordinator},
    std::sync::Arc,
};

#[tokio::main]
async fn main() {
    let etcd = etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd");

    let config = LockConfig::default()
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_lease_duration(Duration::from_secs(3));
    let coordinator =
        LockCoordinator::with_config(Arc::new(EtcdLockRecordStore::new(etcd)), config)
            .expect("invalid lock config");

    // Managed locks are renewed in the background until released or dropped.
    let managed_lock = coordinator
        .try_lock("example-managed-lock")
        .await
        .expect("failed to reach etcd")
        .expect("lock already taken");
    println!("Holding lock as {}", managed_lock.holder_id());

    let lease_lost = managed_lock
        .get_lease_lost_notify()
        .expect("renewal not running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Releasing lock!");
            managed_lock.release().await;
        }
        _ = lease_lost.recv() => {
            println!("Lock was taken over by another process!");
        }
    }
}
