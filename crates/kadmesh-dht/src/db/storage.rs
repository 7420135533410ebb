//! File-backed storage adapter
//!
//! Keeps diversification records, key-blocks and the value version
//! high-water mark in one bincode file under a state directory, so a node
//! restarted with the same id keeps its diversified keys, honours blocks it
//! already verified and never reissues a version.

use super::diversify::{
    Diversification, DiversificationPolicy, DiversificationType, StorageAdapter, StoreEvent,
    version_floor,
};
use super::key_block::KeyBlock;
use crate::error::DhtError;
use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const STORAGE_FILE: &str = "storage.bin";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    diversifications: Vec<Diversification>,
    key_blocks: Vec<KeyBlock>,
    next_version: u32,
}

#[derive(Debug)]
struct Records {
    diversifications: HashMap<NodeId, Diversification>,
    key_blocks: Vec<KeyBlock>,
    next_version: u32,
}

/// Storage adapter persisting to a directory
#[derive(Debug)]
pub struct FileStorageAdapter {
    path: PathBuf,
    policy: DiversificationPolicy,
    records: Mutex<Records>,
}

impl FileStorageAdapter {
    /// Open or create the storage file under `dir`
    ///
    /// # Errors
    ///
    /// - `DhtError::Io` if the directory cannot be created or the file read
    /// - `DhtError::InvalidConfig` if the file exists but does not decode
    pub fn open(dir: &Path, policy: DiversificationPolicy) -> Result<Self, DhtError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORAGE_FILE);
        let persisted = if path.exists() {
            let bytes = fs::read(&path)?;
            bincode::deserialize::<Persisted>(&bytes).map_err(|e| {
                DhtError::InvalidConfig(format!("corrupt storage file {}: {}", path.display(), e).into())
            })?
        } else {
            Persisted::default()
        };
        tracing::debug!(
            "Opened storage {}: {} diversifications, {} key-blocks",
            path.display(),
            persisted.diversifications.len(),
            persisted.key_blocks.len()
        );

        Ok(Self {
            path,
            policy,
            records: Mutex::new(Records {
                diversifications: persisted
                    .diversifications
                    .into_iter()
                    .map(|d| (d.key, d))
                    .collect(),
                key_blocks: persisted.key_blocks,
                next_version: persisted.next_version,
            }),
        })
    }

    /// Path of the storage file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write `records` through a temporary file so a crash leaves either
    /// the old or the new contents
    fn save(&self, records: &Records) -> Result<(), DhtError> {
        let persisted = Persisted {
            diversifications: records.diversifications.values().cloned().collect(),
            key_blocks: records.key_blocks.clone(),
            next_version: records.next_version,
        };
        let bytes = bincode::serialize(&persisted)
            .map_err(|e| DhtError::InvalidState(e.to_string().into()))?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn save_or_warn(&self, records: &Records) {
        if let Err(e) = self.save(records) {
            tracing::warn!("Cannot write {}: {}", self.path.display(), e);
        }
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get_existing_diversification(&self, key: &NodeId) -> Option<Diversification> {
        self.records().diversifications.get(key).cloned()
    }

    fn create_new_diversification(&self, key: &NodeId, kind: DiversificationType) -> Diversification {
        let mut records = self.records();
        if let Some(existing) = records.diversifications.get(key) {
            return existing.clone();
        }
        tracing::info!("Diversifying key {} ({:?})", key, kind);
        let div = Diversification::new(*key, kind);
        records.diversifications.insert(*key, div.clone());
        self.save_or_warn(&records);
        div
    }

    fn value_stored(&self, _key: &NodeId, event: &StoreEvent) -> Option<DiversificationType> {
        self.policy.evaluate(event)
    }

    fn next_value_versions(&self, count: u32) -> u32 {
        let mut records = self.records();
        let first = version_floor(records.next_version);
        records.next_version = first.saturating_add(count);
        self.save_or_warn(&records);
        first
    }

    fn key_blocks(&self) -> Vec<KeyBlock> {
        self.records().key_blocks.clone()
    }

    fn set_key_blocks(&self, blocks: &[KeyBlock]) {
        let mut records = self.records();
        records.key_blocks = blocks.to_vec();
        self.save_or_warn(&records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::contact::Contact;
    use crate::db::value::{self, ReplicationControl};
    use crate::db::{Database, DbLookup};
    use ed25519_dalek::SigningKey;
    use std::sync::Arc;

    fn open(dir: &Path) -> Arc<FileStorageAdapter> {
        Arc::new(FileStorageAdapter::open(dir, DiversificationPolicy::default()).unwrap())
    }

    #[test]
    fn test_diversifications_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = NodeId::hash(b"hot");
        let created = open(dir.path()).create_new_diversification(&key, DiversificationType::Size);

        let reopened = open(dir.path());
        assert!(reopened.is_diversified(&key));
        assert_eq!(reopened.get_existing_diversification(&key), Some(created));
        assert!(reopened.path().exists());
    }

    #[test]
    fn test_versions_never_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let me = Contact::new(NodeId::hash(b"me"), "10.0.0.9:6881".parse().unwrap());
        let key = NodeId::hash(b"k");

        let db = Database::new(&DhtConfig::default(), open(dir.path())).unwrap();
        let before = db.store_local(key, b"a".to_vec(), 0, 1, ReplicationControl::DEFAULT, &me);
        drop(db);

        let db = Database::new(&DhtConfig::default(), open(dir.path())).unwrap();
        let after = db.store_local(key, b"b".to_vec(), 0, 1, ReplicationControl::DEFAULT, &me);
        assert!(after.version > before.version);
    }

    #[test]
    fn test_key_blocks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let authority = SigningKey::from_bytes(&[5u8; 32]);
        let config = DhtConfig {
            key_block_authority: Some(hex::encode(authority.verifying_key().to_bytes())),
            ..DhtConfig::default()
        };
        let key = NodeId::hash(b"banned");
        let block = KeyBlock::sign(key, value::now_secs(), &authority);

        let db = Database::new(&config, open(dir.path())).unwrap();
        assert!(db.apply_key_block(block.clone()).unwrap());
        drop(db);

        let db = Database::new(&config, open(dir.path())).unwrap();
        assert_eq!(db.get(&key, 0), DbLookup::Blocked(block));

        // Blocks are re-verified on load; another authority drops them
        let other = SigningKey::from_bytes(&[6u8; 32]);
        let config = DhtConfig {
            key_block_authority: Some(hex::encode(other.verifying_key().to_bytes())),
            ..DhtConfig::default()
        };
        let db = Database::new(&config, open(dir.path())).unwrap();
        assert!(db.key_block(&key).is_none());
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STORAGE_FILE), [0xFFu8; 3]).unwrap();
        assert!(matches!(
            FileStorageAdapter::open(dir.path(), DiversificationPolicy::default()),
            Err(DhtError::InvalidConfig(_))
        ));
    }
}
