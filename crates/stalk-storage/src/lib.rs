use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use stalk_core::prefs::{PrefError, PrefKey, PrefKind, PrefStore};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub const PREFS_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("stored value for {key} is corrupt: {value:?}")]
    CorruptValue { key: String, value: String },
    #[error("connection lock poisoned")]
    Poisoned,
}

impl From<StorageError> for PrefError {
    fn from(err: StorageError) -> Self {
        PrefError::Backend(err.to_string())
    }
}

/// SQLite-backed preference store.
///
/// Every write commits on its own, so a value is durable and visible to other connections
/// (including other processes) as soon as the call returns.
pub struct SqlitePrefStore {
    conn: Mutex<Connection>,
}

impl SqlitePrefStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > PREFS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: PREFS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn()?;
            conn.execute_batch(include_str!("../migrations/0001_prefs.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    fn read_raw(&self, key: PrefKey) -> Result<Option<(String, String)>, StorageError> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT kind, value FROM prefs WHERE key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    fn write_raw(&self, key: PrefKey, value: &str) -> Result<(), StorageError> {
        self.conn()?.execute(
            "
            INSERT INTO prefs (key, kind, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                kind=excluded.kind,
                value=excluded.value,
                updated_at=excluded.updated_at
            ",
            params![
                key.as_str(),
                key.kind().as_str(),
                value,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn read_typed(&self, key: PrefKey, kind: PrefKind) -> Result<Option<String>, PrefError> {
        key.ensure_kind(kind)?;
        match self.read_raw(key)? {
            Some((stored_kind, value)) if stored_kind == kind.as_str() => Ok(Some(value)),
            Some((stored_kind, _)) => Err(PrefError::TypeMismatch {
                key: key.as_str(),
                expected: kind,
                found: parse_kind(&stored_kind),
            }),
            None => Ok(None),
        }
    }
}

fn parse_kind(raw: &str) -> PrefKind {
    if raw == PrefKind::Bool.as_str() {
        PrefKind::Bool
    } else {
        PrefKind::String
    }
}

impl PrefStore for SqlitePrefStore {
    fn get_string(&self, key: PrefKey, default: &str) -> Result<String, PrefError> {
        Ok(self
            .read_typed(key, PrefKind::String)?
            .unwrap_or_else(|| default.to_string()))
    }

    fn set_string(&self, key: PrefKey, value: &str) -> Result<(), PrefError> {
        key.ensure_kind(PrefKind::String)?;
        Ok(self.write_raw(key, value)?)
    }

    fn get_bool(&self, key: PrefKey, default: bool) -> Result<bool, PrefError> {
        match self.read_typed(key, PrefKind::Bool)? {
            Some(value) => match value.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(StorageError::CorruptValue {
                    key: key.as_str().to_string(),
                    value,
                }
                .into()),
            },
            None => Ok(default),
        }
    }

    fn set_bool(&self, key: PrefKey, value: bool) -> Result<(), PrefError> {
        key.ensure_kind(PrefKind::Bool)?;
        Ok(self.write_raw(key, if value { "true" } else { "false" })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stalk_core::SamplingInterval;
    use tempfile::TempDir;

    #[test]
    fn migration_sets_schema_version() {
        let store = SqlitePrefStore::open_in_memory().expect("open db");
        assert_eq!(store.schema_version().expect("version"), PREFS_SCHEMA_VERSION);
        store.migrate().expect("re-running migrate is a no-op");
    }

    #[test]
    fn rejects_databases_from_a_newer_schema() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("prefs.sqlite3");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        match SqlitePrefStore::open(&path) {
            Err(StorageError::UnsupportedSchemaVersion { found: 9, supported }) => {
                assert_eq!(supported, PREFS_SCHEMA_VERSION)
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("newer schema must be rejected"),
        }
    }

    #[test]
    fn defaults_are_returned_for_unset_keys() {
        let store = SqlitePrefStore::open_in_memory().expect("open db");
        assert_eq!(store.identity().expect("identity"), "");
        assert_eq!(
            store.sampling_interval().expect("interval"),
            SamplingInterval::TenSeconds
        );
        assert!(!store.is_running().expect("running"));
        assert!(store.get_bool(PrefKey::DataExists, true).expect("default"));
    }

    #[test]
    fn values_survive_reopening_the_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested/prefs.sqlite3");
        {
            let store = SqlitePrefStore::open(&path).expect("open");
            store.set_string(PrefKey::UserName, "Alice").expect("name");
            store.set_string(PrefKey::StalkFrequency, "5s").expect("freq");
            store.set_bool(PrefKey::ServiceRunning, true).expect("running");
            store.set_bool(PrefKey::ServiceRunning, false).expect("stopped");
        }
        let store = SqlitePrefStore::open(&path).expect("reopen");
        assert_eq!(store.identity().expect("identity"), "Alice");
        assert_eq!(
            store.sampling_interval().expect("interval"),
            SamplingInterval::FiveSeconds
        );
        assert!(!store.is_running().expect("running"));
    }

    #[test]
    fn writes_are_visible_across_connections() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("prefs.sqlite3");
        let tracker_side = SqlitePrefStore::open(&path).expect("tracker");
        let control_side = SqlitePrefStore::open(&path).expect("control");

        tracker_side
            .record_existence("Alice", true)
            .expect("record");
        let record = control_side.existence_record().expect("read");
        assert_eq!(record.last_checked_identity, "Alice");
        assert!(record.data_exists);
    }

    #[test]
    fn kind_mismatches_surface_as_errors() {
        let store = SqlitePrefStore::open_in_memory().expect("open db");
        assert!(matches!(
            store.set_string(PrefKey::DataExists, "yes"),
            Err(PrefError::TypeMismatch { .. })
        ));
        assert!(matches!(
            store.get_bool(PrefKey::UserName, false),
            Err(PrefError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_bool_rows_are_reported() {
        let store = SqlitePrefStore::open_in_memory().expect("open db");
        store
            .conn()
            .expect("conn")
            .execute(
                "INSERT INTO prefs (key, kind, value, updated_at) VALUES ('dataExists', 'bool', 'maybe', '')",
                [],
            )
            .expect("insert");
        assert!(matches!(
            store.get_bool(PrefKey::DataExists, false),
            Err(PrefError::Backend(_))
        ));
    }
}
