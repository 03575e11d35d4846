use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use tracing::info;

use crate::ledger::{Ledger, LedgerError, LedgerSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: malformed ledger state: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: merkle root does not match ledger contents", path.display())]
    DigestMismatch { path: PathBuf },
    #[error("{}: refusing to overwrite existing ledger state", path.display())]
    AlreadyExists { path: PathBuf },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A ledger persisted as one pretty-printed JSON snapshot.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes an empty ledger. Fails if state already exists unless `force`.
    pub fn init(&self, force: bool) -> Result<Ledger, StoreError> {
        if self.exists() && !force {
            return Err(StoreError::AlreadyExists {
                path: self.path.clone(),
            });
        }
        let ledger = Ledger::new();
        self.save(&ledger)?;
        Ok(ledger)
    }

    pub fn load_snapshot(&self) -> Result<LedgerSnapshot, StoreError> {
        let bytes = fs::read(&self.path).map_err(|source| self.io_error(source))?;
        let snapshot: LedgerSnapshot =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })?;
        if !snapshot.verify() {
            return Err(StoreError::DigestMismatch {
                path: self.path.clone(),
            });
        }
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn load(&self) -> Result<Ledger, StoreError> {
        let snapshot = self.load_snapshot()?;
        info!(
            path = %self.path.display(),
            accounts = snapshot.accounts.len(),
            height = snapshot.meta.height,
            "ledger loaded"
        );
        Ok(Ledger::from_snapshot(snapshot)?)
    }

    /// Writes to a sibling temp file first and renames it over the target.
    pub fn save(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let snapshot = ledger.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let tmp = self.tmp_path();
        let written = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&json)?;
                f.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(source) = written {
            // the target is untouched; only the partial temp file goes
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(source));
        }
        info!(
            path = %self.path.display(),
            height = snapshot.meta.height,
            root = %hex::encode(snapshot.merkle_root),
            "ledger saved"
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

pub(crate) mod serde_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded.trim()).map_err(D::Error::custom)?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| D::Error::custom(format!("digest must be 32 bytes, got {}", bytes.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferRequest;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(dir.path().join("state").join("ledger.json"))
    }

    #[test]
    fn save_then_load_restores_balances_and_history() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ledger = store.init(false).unwrap();
        ledger.open_account("alice", 100).unwrap();
        ledger.open_account("bob", 50).unwrap();
        ledger
            .transfer(&TransferRequest::new("alice", "bob", 30).with_memo("rent"))
            .unwrap();
        store.save(&ledger).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.balance("alice").unwrap(), 70);
        assert_eq!(loaded.balance("bob").unwrap(), 80);
        assert_eq!(loaded.history(), ledger.history());
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ledger = store.init(false).unwrap();
        ledger.open_account("alice", 1).unwrap();
        store.save(&ledger).unwrap();

        assert!(matches!(
            store.init(false),
            Err(StoreError::AlreadyExists { .. })
        ));
        store.init(true).unwrap();
        assert!(store.load().unwrap().accounts().is_empty());
    }

    #[test]
    fn tampered_balance_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ledger = Ledger::new();
        ledger.open_account("alice", 100).unwrap();
        store.save(&ledger).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        value["accounts"]["alice"] = serde_json::json!(1_000_000);
        fs::write(store.path(), serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            store.load(),
            Err(StoreError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn missing_and_malformed_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(matches!(store.load(), Err(StoreError::Io { .. })));

        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Json { .. })));
    }

    #[test]
    fn digest_is_stored_as_hex() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&Ledger::new()).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        let root = value["merkle_root"].as_str().unwrap();
        assert_eq!(root.len(), 64);
        assert!(hex::decode(root).is_ok());
    }

    #[test]
    fn negative_balance_with_valid_root_fails_load_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut accounts = std::collections::BTreeMap::new();
        accounts.insert("A".to_string(), -5);
        let snapshot = LedgerSnapshot::new(Default::default(), accounts, vec![]);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), serde_json::to_vec(&snapshot).unwrap()).unwrap();

        assert!(matches!(
            store.load_snapshot(),
            Err(StoreError::Ledger(LedgerError::NegativeBalance { balance: -5, .. }))
        ));
        assert!(store.load().is_err());
    }

    #[test]
    fn edited_journal_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ledger = Ledger::new();
        ledger.open_account("alice", 100).unwrap();
        store.save(&ledger).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        value["events"][0]["opening_balance"] = serde_json::json!(5);
        fs::write(store.path(), serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            store.load_snapshot(),
            Err(StoreError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn failed_save_removes_temp_file_and_keeps_target() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        // a non-empty directory at the target path makes the rename fail
        fs::create_dir_all(store.path().join("occupied")).unwrap();

        assert!(matches!(
            store.save(&Ledger::new()),
            Err(StoreError::Io { .. })
        ));
        assert!(!store.tmp_path().exists());
        assert!(store.path().join("occupied").is_dir());
    }
}
