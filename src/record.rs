use {
    chrono::{DateTime, Utc},
    core::fmt,
    std::time::Duration,
};

///
/// Store-assigned primary key of a [`LockRecord`].
///
/// The value is opaque to the locking protocol, it only takes part in the compare-and-swap predicate.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// Persisted claim over a named resource.
///
/// At most one record exists per `name`. Its presence means the resource is claimed (or was
/// recently claimed by a holder that died), its absence means the resource is free.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub id: RecordId,
    pub name: String,
    pub holder_id: String,
    ///
    /// Optimistic-concurrency token, regenerated on every successful write.
    pub version: String,
    ///
    /// Last time the holder proved liveness.
    pub heartbeat: Option<DateTime<Utc>>,
    ///
    /// Revision of this snapshot in stores that version writes natively (etcd `mod_revision`), zero elsewhere.
    /// Such stores guard conditional writes on it instead of comparing values.
    pub revision: i64,
}

pub(crate) fn new_version() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl LockRecord {
    ///
    /// Creates a freshly claimed record: new version token and a heartbeat set to now.
    ///
    pub fn new(id: RecordId, name: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            holder_id: holder_id.into(),
            version: new_version(),
            heartbeat: Some(Utc::now()),
            revision: 0,
        }
    }

    ///
    /// Returns the snapshot that replaces `self` on a successful transfer or heartbeat.
    ///
    /// `id` and `name` are kept, the holder is replaced, the version is regenerated and the heartbeat is reset to now.
    /// The store revision is unknown until the snapshot is written.
    ///
    pub fn refreshed(&self, holder_id: &str) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            holder_id: holder_id.to_string(),
            version: new_version(),
            heartbeat: Some(Utc::now()),
            revision: 0,
        }
    }

    ///
    /// True when `other` is the same write of the same record, i.e. `(id, name, version)` are equal.
    ///
    pub fn same_revision(&self, other: &LockRecord) -> bool {
        self.id == other.id && self.name == other.name && self.version == other.version
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }

    ///
    /// Liveness rule used by lock acquisition.
    ///
    /// The holder is alive iff its heartbeat is set and newer than `now - multiplier * lease_duration`.
    /// Without a lease duration liveness cannot be judged and the holder is always considered alive.
    ///
    pub fn is_alive(
        &self,
        now: DateTime<Utc>,
        lease_duration: Option<Duration>,
        multiplier: u32,
    ) -> bool {
        let Some(lease_duration) = lease_duration else {
            return true;
        };
        let Some(heartbeat) = self.heartbeat else {
            return false;
        };
        // A window too large to represent can never be exceeded.
        let Some(window) = lease_duration
            .checked_mul(multiplier)
            .and_then(|window| chrono::Duration::from_std(window).ok())
        else {
            return true;
        };
        match now.checked_sub_signed(window) {
            Some(cutoff) => heartbeat > cutoff,
            None => true,
        }
    }

    ///
    /// True when the record is eligible for garbage collection at `threshold`:
    /// its heartbeat is missing or not newer than `threshold`.
    ///
    pub fn is_older_than(&self, threshold: DateTime<Utc>) -> bool {
        match self.heartbeat {
            Some(heartbeat) => heartbeat <= threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_heartbeat(heartbeat: Option<DateTime<Utc>>) -> LockRecord {
        LockRecord {
            heartbeat,
            ..LockRecord::new(RecordId(1), "job-1", "holder-a")
        }
    }

    #[test]
    fn refreshed_record_keeps_identity_and_changes_version() {
        let record = LockRecord::new(RecordId(7), "job-1", "holder-a");
        let next = record.refreshed("holder-b");

        assert_eq!(next.id, record.id);
        assert_eq!(next.name, record.name);
        assert_eq!(next.holder_id, "holder-b");
        assert_ne!(next.version, record.version);
        assert!(next.heartbeat >= record.heartbeat);
        assert!(!next.same_revision(&record));
    }

    #[test]
    fn recent_heartbeat_is_alive_within_twice_the_lease() {
        let now = Utc::now();
        let record = record_with_heartbeat(Some(now - chrono::Duration::seconds(50)));

        assert!(record.is_alive(now, Some(Duration::from_secs(30)), 2));
        assert!(!record.is_alive(now, Some(Duration::from_secs(20)), 2));
    }

    #[test]
    fn missing_heartbeat_is_dead_unless_lease_is_unknown() {
        let record = record_with_heartbeat(None);

        assert!(!record.is_alive(Utc::now(), Some(Duration::from_secs(30)), 2));
        assert!(record.is_alive(Utc::now(), None, 2));
    }

    #[test]
    fn zero_lease_makes_any_record_stale() {
        let now = Utc::now();
        let record = record_with_heartbeat(Some(now));

        assert!(!record.is_alive(now, Some(Duration::ZERO), 2));
    }

    #[test]
    fn huge_lease_never_expires() {
        let record = record_with_heartbeat(Some(Utc::now() - chrono::Duration::days(365)));

        assert!(record.is_alive(Utc::now(), Some(Duration::MAX), 2));
    }

    #[test]
    fn older_than_includes_missing_heartbeat_and_boundary() {
        let threshold = Utc::now();

        assert!(record_with_heartbeat(None).is_older_than(threshold));
        assert!(record_with_heartbeat(Some(threshold)).is_older_than(threshold));
        assert!(!record_with_heartbeat(Some(threshold + chrono::Duration::seconds(1)))
            .is_older_than(threshold));
    }
}
