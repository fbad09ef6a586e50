use crate::gate::ExistenceRecord;
use crate::SamplingInterval;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

pub const DEFAULT_FREQUENCY_LABEL: &str = "10s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefKind {
    String,
    Bool,
}

impl PrefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefKind::String => "string",
            PrefKind::Bool => "bool",
        }
    }
}

impl fmt::Display for PrefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slots shared between the tracker and the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefKey {
    UserName,
    StalkFrequency,
    ServiceRunning,
    DataExists,
    LastCheckedName,
}

impl PrefKey {
    pub const ALL: [PrefKey; 5] = [
        PrefKey::UserName,
        PrefKey::StalkFrequency,
        PrefKey::ServiceRunning,
        PrefKey::DataExists,
        PrefKey::LastCheckedName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrefKey::UserName => "userName",
            PrefKey::StalkFrequency => "stalkFrequency",
            PrefKey::ServiceRunning => "serviceRunning",
            PrefKey::DataExists => "dataExists",
            PrefKey::LastCheckedName => "lastCheckedName",
        }
    }

    pub fn kind(&self) -> PrefKind {
        match self {
            PrefKey::UserName | PrefKey::StalkFrequency | PrefKey::LastCheckedName => {
                PrefKind::String
            }
            PrefKey::ServiceRunning | PrefKey::DataExists => PrefKind::Bool,
        }
    }

    pub fn ensure_kind(&self, expected: PrefKind) -> Result<(), PrefError> {
        if self.kind() == expected {
            Ok(())
        } else {
            Err(PrefError::TypeMismatch {
                key: self.as_str(),
                expected,
                found: self.kind(),
            })
        }
    }
}

impl fmt::Display for PrefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PrefError {
    #[error("preference backend error: {0}")]
    Backend(String),
    #[error("preference {key} holds a {found} value, not {expected}")]
    TypeMismatch {
        key: &'static str,
        expected: PrefKind,
        found: PrefKind,
    },
}

/// Flat key/value store shared by every component.
///
/// Each call touches exactly one key and is durable once it returns. Nothing is atomic across
/// keys: a reader may observe one write of a pair before the other.
pub trait PrefStore: Send + Sync {
    fn get_string(&self, key: PrefKey, default: &str) -> Result<String, PrefError>;
    fn set_string(&self, key: PrefKey, value: &str) -> Result<(), PrefError>;
    fn get_bool(&self, key: PrefKey, default: bool) -> Result<bool, PrefError>;
    fn set_bool(&self, key: PrefKey, value: bool) -> Result<(), PrefError>;

    fn identity(&self) -> Result<String, PrefError> {
        self.get_string(PrefKey::UserName, "")
    }

    fn sampling_interval(&self) -> Result<SamplingInterval, PrefError> {
        let label = self.get_string(PrefKey::StalkFrequency, DEFAULT_FREQUENCY_LABEL)?;
        Ok(SamplingInterval::resolve(&label))
    }

    fn is_running(&self) -> Result<bool, PrefError> {
        self.get_bool(PrefKey::ServiceRunning, false)
    }

    fn existence_record(&self) -> Result<ExistenceRecord, PrefError> {
        Ok(ExistenceRecord {
            last_checked_identity: self.get_string(PrefKey::LastCheckedName, "")?,
            data_exists: self.get_bool(PrefKey::DataExists, false)?,
        })
    }

    /// Writes the identity first, then the flag, as two independent operations.
    fn record_existence(&self, identity: &str, exists: bool) -> Result<(), PrefError> {
        self.set_string(PrefKey::LastCheckedName, identity)?;
        self.set_bool(PrefKey::DataExists, exists)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PrefValue {
    Text(String),
    Flag(bool),
}

/// Process-local store used by tests and by callers that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryPrefStore {
    values: Mutex<HashMap<PrefKey, PrefValue>>,
}

impl MemoryPrefStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values<R>(
        &self,
        f: impl FnOnce(&mut HashMap<PrefKey, PrefValue>) -> R,
    ) -> Result<R, PrefError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| PrefError::Backend("memory store lock poisoned".to_string()))?;
        Ok(f(&mut values))
    }
}

impl PrefStore for MemoryPrefStore {
    fn get_string(&self, key: PrefKey, default: &str) -> Result<String, PrefError> {
        key.ensure_kind(PrefKind::String)?;
        self.with_values(|values| match values.get(&key) {
            Some(PrefValue::Text(value)) => value.clone(),
            _ => default.to_string(),
        })
    }

    fn set_string(&self, key: PrefKey, value: &str) -> Result<(), PrefError> {
        key.ensure_kind(PrefKind::String)?;
        self.with_values(|values| {
            values.insert(key, PrefValue::Text(value.to_string()));
        })
    }

    fn get_bool(&self, key: PrefKey, default: bool) -> Result<bool, PrefError> {
        key.ensure_kind(PrefKind::Bool)?;
        self.with_values(|values| match values.get(&key) {
            Some(PrefValue::Flag(value)) => *value,
            _ => default,
        })
    }

    fn set_bool(&self, key: PrefKey, value: bool) -> Result<(), PrefError> {
        key.ensure_kind(PrefKind::Bool)?;
        self.with_values(|values| {
            values.insert(key, PrefValue::Flag(value));
        })
    }
}
