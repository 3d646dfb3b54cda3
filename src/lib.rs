///
/// Timing configuration of the locking protocol
///
pub mod config;

///
/// Runs critical sections under "managed" locks
///
pub mod coordinator;

///
/// Background lease renewal of held locks
///
pub mod lease;

///
/// Lease acquisition algorithm: free, stale or held
///
pub mod lock;

///
/// The persisted lock record
pub mod record;

///
/// Domain operations over a lock record store
pub mod record_service;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// Lock record persistence contract and its implementations
///
pub mod store;

pub use {
    config::LockConfig,
    coordinator::{ExecuteError, LockCoordinator, ManagedLock},
    lock::LockService,
    record::{LockRecord, RecordId},
    store::{LockRecordStore, StoreError},
};
