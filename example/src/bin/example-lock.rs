use {
    core::time::Duration,
    lease_lock::{store::etcd::EtcdLockRecordStore, LockConfig, LockCoordinator},
    std::sync::Arc,
};

#[derive(Debug, thiserror::Error)]
#[error("report generation failed")]
struct ReportError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let etcd = etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd");

    let config = LockConfig::default()
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_lease_duration(Duration::from_secs(3));
    let coordinator =
        LockCoordinator::with_config(Arc::new(EtcdLockRecordStore::new(etcd)), config)
            .expect("invalid lock config");

    let lock_name = "example-lock";

    // Locks are released when the critical section returns, whatever its outcome.
    let coordinator2 = coordinator.clone();
    let h = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let ran = coordinator2
            .execute(lock_name, || async {
                println!("Task 2 got the lock!");
                Ok::<_, ReportError>(())
            })
            .await
            .expect("task 2 failed");
        println!("Task 2 ran its critical section: {ran}");
    });

    let ran = coordinator
        .execute(lock_name, || async {
            println!("Lock acquired in main task, sleeping for 5 seconds...");
            for i in 1..=5 {
                println!("{}...", i);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok::<_, ReportError>(())
        })
        .await
        .expect("main task failed");
    println!("Main task ran its critical section: {ran}");

    h.await.expect("task 2 panicked");

    // Lock is free again.
    let ran = coordinator
        .execute(lock_name, || async { Err::<(), _>(ReportError) })
        .await;
    println!("Failing critical section: {:?}", ran.map_err(|e| e.to_string()));
    println!("Finished!");
}
