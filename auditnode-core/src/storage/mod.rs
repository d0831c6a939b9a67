//! Persistent chain storage.
//!
//! Two artifacts live under the data directory:
//!   - `chain.json` — the ordered index of committed block headers
//!     ([`BlockMeta`] entries, contiguous ids, hash-linked),
//!   - `blocks/block_<id>.json` — one full block body per committed block.
//!
//! Writes go to a temp file first and are renamed into place, so a crash
//! never leaves a torn file. Commit order is body first, index second: the
//! index never points at a body that was not persisted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::ledger::block::{Block, BlockMeta, GENESIS_HASH};

#[derive(Debug, Error)]
pub enum StorageError {
    /// Incoming entry does not extend the current chain head.
    #[error("chain broken: {0}")]
    ChainBroken(String),
    #[error("block {0} not found")]
    NotFound(i64),
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable append-only chain of block metadata plus per-block body files.
///
/// `append` and `put_block_body` are writer-exclusive; readers observe either
/// the pre-write or post-write index, never a mix.
pub struct ChainStore {
    data_dir: PathBuf,
    index: RwLock<Vec<BlockMeta>>,
}

impl ChainStore {
    /// Open (or create) the store under `data_dir`, reloading and verifying
    /// any existing index.
    pub fn open(data_dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir.join("blocks"))?;
        let store = Self {
            data_dir,
            index: RwLock::new(Vec::new()),
        };
        let entries = store.load_index()?;
        store.verify_index(&entries)?;
        if let Some(last) = entries.last() {
            tracing::info!(
                "📂 chain index loaded: height {} (last hash {})",
                last.id,
                &last.hash[..16.min(last.hash.len())]
            );
            // Detect the body-missing degraded state a damaged disk could
            // leave behind. Bodies are written before the index, so our own
            // commits cannot produce this.
            match store.get_block_body(last.id) {
                Ok(_) => {}
                Err(err) => tracing::error!(
                    "🚨 indexed block {} has no readable body ({err}); serving that block will fail",
                    last.id
                ),
            }
        } else {
            tracing::info!("📂 no existing chain index, starting at genesis");
        }
        *store.index.write_or_recover() = entries;
        Ok(store)
    }

    /// Default data directory (`~/.auditnode`).
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".auditnode")
    }

    fn index_path(&self) -> PathBuf {
        self.data_dir.join("chain.json")
    }

    fn block_path(&self, id: i64) -> PathBuf {
        self.data_dir.join("blocks").join(format!("block_{id}.json"))
    }

    fn load_index(&self) -> Result<Vec<BlockMeta>, StorageError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn verify_index(&self, entries: &[BlockMeta]) -> Result<(), StorageError> {
        let mut expected_prev = GENESIS_HASH.to_string();
        for (i, entry) in entries.iter().enumerate() {
            if entry.id != i as i64 {
                return Err(StorageError::ChainBroken(format!(
                    "index entry {} has id {}",
                    i, entry.id
                )));
            }
            if entry.previous_hash != expected_prev {
                return Err(StorageError::ChainBroken(format!(
                    "index entry {i} does not link to its predecessor"
                )));
            }
            expected_prev = entry.hash.clone();
        }
        Ok(())
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Hash of the entry with the greatest id, or the genesis constant when
    /// the chain is empty.
    pub fn last_hash(&self) -> String {
        self.index
            .read_or_recover()
            .last()
            .map(|meta| meta.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string())
    }

    /// Greatest committed block id, or -1 when the chain is empty.
    pub fn last_id(&self) -> i64 {
        self.index
            .read_or_recover()
            .last()
            .map(|meta| meta.id)
            .unwrap_or(-1)
    }

    /// Append a header to the index. Rejects with `ChainBroken` unless
    /// `meta.id` and `meta.previous_hash` extend the current head exactly.
    /// The updated index is durable before this returns.
    pub fn append(&self, meta: BlockMeta) -> Result<(), StorageError> {
        let mut index = self.index.write_or_recover();
        let expected_id = index.last().map(|m| m.id + 1).unwrap_or(0);
        let expected_prev = index
            .last()
            .map(|m| m.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        if meta.id != expected_id {
            return Err(StorageError::ChainBroken(format!(
                "expected block id {}, got {}",
                expected_id, meta.id
            )));
        }
        if meta.previous_hash != expected_prev {
            return Err(StorageError::ChainBroken(format!(
                "previous_hash does not match chain head at id {}",
                meta.id
            )));
        }
        index.push(meta);
        let serialized = match serde_json::to_string_pretty(&*index) {
            Ok(s) => s,
            Err(err) => {
                index.pop();
                return Err(StorageError::Parse(err));
            }
        };
        if let Err(err) = Self::write_atomic(&self.index_path(), serialized.as_bytes()) {
            // Keep memory and disk agreeing when the disk write fails.
            index.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Persist a full block body to `blocks/block_<id>.json`.
    pub fn put_block_body(&self, block: &Block) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec(block)?;
        Self::write_atomic(&self.block_path(block.id), &serialized)
    }

    /// Read a committed block body back by id.
    pub fn get_block_body(&self, id: i64) -> Result<Block, StorageError> {
        let path = self.block_path(id);
        if !path.exists() {
            return Err(StorageError::NotFound(id));
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Extension trait that recovers from poisoned RwLocks gracefully.
trait PoisonRecover<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> PoisonRecover<T> for RwLock<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 chain index RwLock was poisoned (read) — recovering");
            poisoned.into_inner()
        })
    }
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 chain index RwLock was poisoned (write) — recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::audit::{Audit, FileInfo, UserInfo};
    use tempfile::TempDir;

    fn audit(req_id: &str) -> Audit {
        Audit {
            req_id: req_id.to_string(),
            timestamp: 1,
            access_type: "read".to_string(),
            file_info: FileInfo {
                file_id: "f1".to_string(),
                file_name: "a.txt".to_string(),
            },
            user_info: UserInfo {
                user_id: "u1".to_string(),
                user_name: "alice".to_string(),
            },
            signature: String::new(),
            public_key: String::new(),
        }
    }

    fn block(id: i64, previous_hash: &str) -> Block {
        Block::assemble(id, previous_hash.to_string(), vec![audit(&format!("r{id}"))])
    }

    #[test]
    fn empty_chain_reports_genesis() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChainStore::open(dir.path().to_path_buf()).expect("open");
        assert_eq!(store.last_id(), -1);
        assert_eq!(store.last_hash(), GENESIS_HASH);
    }

    #[test]
    fn append_enforces_contiguity_and_linkage() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChainStore::open(dir.path().to_path_buf()).expect("open");

        let b0 = block(0, GENESIS_HASH);
        store.append(b0.meta()).expect("append genesis block");
        assert_eq!(store.last_id(), 0);
        assert_eq!(store.last_hash(), b0.hash);

        // Wrong previous hash.
        let bad_prev = block(1, &"f".repeat(64));
        assert!(matches!(
            store.append(bad_prev.meta()),
            Err(StorageError::ChainBroken(_))
        ));

        // Wrong id.
        let bad_id = block(5, &b0.hash);
        assert!(matches!(
            store.append(bad_id.meta()),
            Err(StorageError::ChainBroken(_))
        ));

        // Correct extension.
        let b1 = block(1, &b0.hash);
        store.append(b1.meta()).expect("append block 1");
        assert_eq!(store.last_id(), 1);
        assert_eq!(store.last_hash(), b1.hash);
    }

    #[test]
    fn block_body_roundtrips_bit_identical() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChainStore::open(dir.path().to_path_buf()).expect("open");
        let b0 = block(0, GENESIS_HASH);
        store.put_block_body(&b0).expect("put body");
        let got = store.get_block_body(0).expect("get body");
        assert_eq!(got, b0);
    }

    #[test]
    fn missing_body_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChainStore::open(dir.path().to_path_buf()).expect("open");
        assert!(matches!(
            store.get_block_body(42),
            Err(StorageError::NotFound(42))
        ));
    }

    #[test]
    fn corrupt_body_is_a_parse_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChainStore::open(dir.path().to_path_buf()).expect("open");
        fs::write(dir.path().join("blocks").join("block_0.json"), b"{nope").expect("write");
        assert!(matches!(store.get_block_body(0), Err(StorageError::Parse(_))));
    }

    #[test]
    fn index_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let b0 = block(0, GENESIS_HASH);
        let b1 = block(1, &b0.hash);
        {
            let store = ChainStore::open(dir.path().to_path_buf()).expect("open");
            store.put_block_body(&b0).expect("body 0");
            store.append(b0.meta()).expect("append 0");
            store.put_block_body(&b1).expect("body 1");
            store.append(b1.meta()).expect("append 1");
        }
        let store = ChainStore::open(dir.path().to_path_buf()).expect("reopen");
        assert_eq!(store.last_id(), 1);
        assert_eq!(store.last_hash(), b1.hash);
        assert_eq!(store.get_block_body(0).expect("body 0").id, 0);
    }

    #[test]
    fn tampered_index_refuses_to_open() {
        let dir = TempDir::new().expect("tempdir");
        let b0 = block(0, GENESIS_HASH);
        {
            let store = ChainStore::open(dir.path().to_path_buf()).expect("open");
            store.put_block_body(&b0).expect("body");
            store.append(b0.meta()).expect("append");
        }
        // Rewrite the index with a broken link.
        let mut tampered = b0.meta();
        tampered.previous_hash = "f".repeat(64);
        let contents = serde_json::to_string(&vec![tampered]).expect("serialize");
        fs::write(dir.path().join("chain.json"), contents).expect("write");
        assert!(matches!(
            ChainStore::open(dir.path().to_path_buf()),
            Err(StorageError::ChainBroken(_))
        ));
    }
}
