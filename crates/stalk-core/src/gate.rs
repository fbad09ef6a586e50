//! Delete enablement, derived purely from persisted signals and the displayed identity.

use crate::prefs::{PrefError, PrefStore};

/// Result of the most recent existence check, delete or successful report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistenceRecord {
    pub last_checked_identity: String,
    pub data_exists: bool,
}

impl ExistenceRecord {
    /// Existence as known for `identity`; a record for any other identity counts as unknown.
    pub fn exists_for(&self, identity: &str) -> bool {
        self.data_exists && self.last_checked_identity == identity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteGate {
    pub identity: String,
    pub running: bool,
    pub record: ExistenceRecord,
}

impl DeleteGate {
    pub fn new(identity: impl Into<String>, running: bool, record: ExistenceRecord) -> Self {
        Self {
            identity: identity.into(),
            running,
            record,
        }
    }

    /// Snapshot the persisted half of the gate for the identity currently on screen.
    pub fn read(store: &dyn PrefStore, identity: &str) -> Result<Self, PrefError> {
        Ok(Self::new(
            identity,
            store.is_running()?,
            store.existence_record()?,
        ))
    }

    pub fn delete_enabled(&self) -> bool {
        !self.identity.is_empty() && !self.running && self.record.exists_for(&self.identity)
    }
}
