//! Durable lock persistence.
//!
//! `LockStore` is the compare-and-set contract the locker relies on.
//! `SqliteLockStore` backs it with an embedded SQLite database in WAL mode
//! with `synchronous = FULL`, so every committed mutation is fsynced before
//! the call returns.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::errors::StoreError;
use crate::models::LockRecord;

/// Outcome of an atomic save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The record was written.
    Saved,
    /// A record already existed for the key and was left untouched.
    Exists(LockRecord),
}

/// Key/value persistence for lock records with compare-and-set semantics.
pub trait LockStore: Send + Sync {
    /// Write `record` under its key unless a record already exists.
    fn save(&self, record: &LockRecord) -> Result<SaveOutcome, StoreError>;

    /// Fetch the record stored under `key`.
    fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError>;

    /// Replace the stored record if it has the same lock id. Returns false
    /// when the key is empty or held under a different id.
    fn update(&self, record: &LockRecord) -> Result<bool, StoreError>;

    /// Remove the record under `key`, returning it if one existed.
    fn delete(&self, key: &str) -> Result<Option<LockRecord>, StoreError>;

    /// All records, ordered by key.
    fn list(&self) -> Result<Vec<LockRecord>, StoreError>;

    /// Remove every record owned by the pull request, returning them.
    fn delete_by_pull_request(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<LockRecord>, StoreError>;
}

/// SQLite-backed lock store.
pub struct SqliteLockStore {
    conn: Mutex<Connection>,
}

impl SqliteLockStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Io(format!("creating {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS locks (
                lock_key TEXT PRIMARY KEY,
                repo_full_name TEXT NOT NULL,
                pull_num INTEGER NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_locks_pull ON locks(repo_full_name, pull_num);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Io(format!("lock store mutex poisoned: {}", e)))
    }
}

fn encode(record: &LockRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
        key: record.key(),
        message: e.to_string(),
    })
}

fn decode(key: &str, raw: &str) -> Result<LockRecord, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn select_record(conn: &Connection, key: &str) -> Result<Option<LockRecord>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT record FROM locks WHERE lock_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|r| decode(key, &r)).transpose()
}

impl LockStore for SqliteLockStore {
    fn save(&self, record: &LockRecord) -> Result<SaveOutcome, StoreError> {
        let key = record.key();
        let encoded = encode(record)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO locks (lock_key, repo_full_name, pull_num, record)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lock_key) DO NOTHING",
            params![
                key,
                record.identity.repo_full_name,
                record.pull_num as i64,
                encoded
            ],
        )?;

        if inserted == 1 {
            tx.commit()?;
            return Ok(SaveOutcome::Saved);
        }

        let existing = select_record(&tx, &key)?.ok_or_else(|| StoreError::Corrupt {
            key: key.clone(),
            message: "conflicting row vanished inside transaction".to_string(),
        })?;
        tx.commit()?;
        Ok(SaveOutcome::Exists(existing))
    }

    fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let conn = self.conn()?;
        select_record(&conn, key)
    }

    fn update(&self, record: &LockRecord) -> Result<bool, StoreError> {
        let key = record.key();
        let encoded = encode(record)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let matches = select_record(&tx, &key)?.is_some_and(|current| current.id == record.id);
        if !matches {
            return Ok(false);
        }
        tx.execute(
            "UPDATE locks SET record = ?2 WHERE lock_key = ?1",
            params![key, encoded],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = select_record(&tx, key)?;
        if existing.is_some() {
            tx.execute("DELETE FROM locks WHERE lock_key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(existing)
    }

    fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT lock_key, record FROM locks ORDER BY lock_key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            records.push(decode(&key, &raw)?);
        }
        Ok(records)
    }

    fn delete_by_pull_request(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<LockRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut removed = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT lock_key, record FROM locks
                 WHERE repo_full_name = ?1 AND pull_num = ?2
                 ORDER BY lock_key",
            )?;
            let rows = stmt.query_map(params![repo_full_name, pull_num as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, raw) = row?;
                removed.push(decode(&key, &raw)?);
            }
        }

        tx.execute(
            "DELETE FROM locks WHERE repo_full_name = ?1 AND pull_num = ?2",
            params![repo_full_name, pull_num as i64],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicyStatus, ProjectIdentity};
    use tempfile::tempdir;

    fn record(dir: &str, pull: u64) -> LockRecord {
        LockRecord::new(ProjectIdentity::new("acme/infra", dir, "default"), pull, "alice")
    }

    #[test]
    fn test_save_then_conflict_returns_existing() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        let first = record("prod", 1);
        assert_eq!(store.save(&first)?, SaveOutcome::Saved);

        let second = record("prod", 2);
        match store.save(&second)? {
            SaveOutcome::Exists(existing) => {
                assert_eq!(existing.id, first.id);
                assert_eq!(existing.pull_num, 1);
            }
            SaveOutcome::Saved => panic!("second save must not overwrite"),
        }
        Ok(())
    }

    #[test]
    fn test_get_missing_is_none() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        assert!(store.get("acme/infra#prod#default")?.is_none());
        Ok(())
    }

    #[test]
    fn test_delete_returns_removed_record() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        let lock = record("prod", 1);
        store.save(&lock)?;
        let removed = store.delete(&lock.key())?;
        assert_eq!(removed.map(|r| r.id), Some(lock.id));
        assert!(store.delete(&lock.key())?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_requires_same_lock_id() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        let mut lock = record("prod", 1);
        store.save(&lock)?;

        lock.policy = PolicyStatus::Failed;
        assert!(store.update(&lock)?);
        assert_eq!(store.get(&lock.key())?.unwrap().policy, PolicyStatus::Failed);

        let stranger = record("prod", 2);
        assert!(!store.update(&stranger)?);
        assert_eq!(store.get(&lock.key())?.unwrap().pull_num, 1);
        Ok(())
    }

    #[test]
    fn test_update_missing_key_is_false() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        assert!(!store.update(&record("prod", 1))?);
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_is_ordered_by_key() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        store.save(&record("staging", 1))?;
        store.save(&record("prod", 2))?;
        let keys: Vec<String> = store.list()?.iter().map(|r| r.key()).collect();
        assert_eq!(
            keys,
            vec!["acme/infra#prod#default", "acme/infra#staging#default"]
        );
        Ok(())
    }

    #[test]
    fn test_delete_by_pull_request_only_touches_that_pull() -> Result<(), StoreError> {
        let store = SqliteLockStore::open_in_memory()?;
        store.save(&record("prod", 1))?;
        store.save(&record("staging", 1))?;
        store.save(&record("dev", 2))?;
        store.save(&LockRecord::new(
            ProjectIdentity::new("acme/other", "prod", "default"),
            1,
            "bob",
        ))?;

        let removed = store.delete_by_pull_request("acme/infra", 1)?;
        assert_eq!(removed.len(), 2);

        let remaining = store.list()?;
        assert_eq!(remaining.len(), 2);
        assert!(
            remaining
                .iter()
                .all(|r| !(r.identity.repo_full_name == "acme/infra" && r.pull_num == 1))
        );
        Ok(())
    }

    #[test]
    fn test_records_survive_reopen() -> Result<(), StoreError> {
        let dir = tempdir().map_err(|e| StoreError::Io(e.to_string()))?;
        let path = dir.path().join("locks.db");
        let lock = record("prod", 3);
        {
            let store = SqliteLockStore::open(&path)?;
            store.save(&lock)?;
        }
        let reopened = SqliteLockStore::open(&path)?;
        let fetched = reopened.get(&lock.key())?.expect("lock should persist");
        assert_eq!(fetched, lock);
        Ok(())
    }
}
