//! Shared node state: the four state machines behind the RPC surface.
//!
//! `NodeState` owns the mempool, the chain store, the heartbeat table, and
//! the election state, and is cloned into the RPC services and the
//! background cluster loops. Handles are `Arc`s; every component serializes
//! its own mutations internally.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ledger::block::Block;
use crate::ledger::mempool::Mempool;
use crate::p2p::{ElectionState, HeartbeatTable};
use crate::storage::{ChainStore, StorageError};

#[derive(Clone)]
pub struct NodeState {
    /// This node's peer-visible address, also its election identity.
    pub self_addr: String,
    /// Configured peer addresses (not including self).
    pub peer_addrs: Vec<String>,
    pub mempool: Arc<Mempool>,
    pub chain: Arc<ChainStore>,
    pub heartbeats: Arc<HeartbeatTable>,
    pub election: Arc<ElectionState>,
}

impl NodeState {
    pub fn open(
        self_addr: String,
        mut peer_addrs: Vec<String>,
        data_dir: PathBuf,
    ) -> Result<Self, StorageError> {
        // Our own address in the peer list would double-count us in quorum
        // math; drop it here so every consumer sees the same cluster.
        let configured = peer_addrs.len();
        peer_addrs.retain(|addr| *addr != self_addr);
        if peer_addrs.len() != configured {
            tracing::warn!("peer list contained our own address {self_addr}, ignoring it");
        }
        let chain = ChainStore::open(data_dir)?;
        Ok(Self {
            self_addr,
            peer_addrs,
            mempool: Arc::new(Mempool::new()),
            chain: Arc::new(chain),
            heartbeats: Arc::new(HeartbeatTable::new()),
            election: Arc::new(ElectionState::new()),
        })
    }

    /// Peers plus self. Quorum is a strict majority of this.
    pub fn cluster_size(&self) -> usize {
        self.peer_addrs.len() + 1
    }

    pub fn is_leader(&self) -> bool {
        self.election.leader() == self.self_addr
    }

    /// Drain the current mempool snapshot into the next proposed block.
    /// Returns `None` when there is nothing to propose.
    pub fn build_block(&self) -> Option<Block> {
        let audits = self.mempool.load_all();
        if audits.is_empty() {
            return None;
        }
        let id = self.chain.last_id() + 1;
        let previous_hash = self.chain.last_hash();
        Some(Block::assemble(id, previous_hash, audits))
    }

    /// Follower-side proposal validation. Checks, in order: Merkle root,
    /// previous-hash linkage, header hash, and every audit signature. The
    /// returned string is the wire `error_message`.
    pub fn validate_proposal(&self, block: &Block) -> Result<(), String> {
        if Block::compute_merkle_root(&block.audits) != block.merkle_root {
            return Err("bad merkle_root".to_string());
        }
        if block.previous_hash != self.chain.last_hash() {
            return Err("bad previous_hash".to_string());
        }
        if Block::header_hash(block.id, &block.previous_hash, &block.merkle_root) != block.hash {
            return Err("block_hash mismatch".to_string());
        }
        for audit in &block.audits {
            if !audit.verify() {
                return Err(format!("invalid audit signature: {}", audit.req_id));
            }
        }
        Ok(())
    }

    /// Commit a block locally: persist the body, append the index entry,
    /// then evict the block's audits from the mempool. Body-before-index
    /// means the index can never point at a missing body. The returned
    /// string is the wire `error_message`.
    pub fn commit_block(&self, block: &Block) -> Result<(), String> {
        // Cheap rejection before touching disk; append re-checks under its
        // own lock and stays authoritative.
        let expected_id = self.chain.last_id() + 1;
        if block.id != expected_id || block.previous_hash != self.chain.last_hash() {
            return Err(format!(
                "chain broken: block {} does not extend head {}",
                block.id,
                self.chain.last_id()
            ));
        }
        if let Err(err) = self.chain.put_block_body(block) {
            tracing::error!("failed to write block file for id {}: {err}", block.id);
            return Err("could not write block file".to_string());
        }
        self.chain.append(block.meta()).map_err(|err| err.to_string())?;

        let ids: Vec<String> = block.audits.iter().map(|a| a.req_id.clone()).collect();
        self.mempool.remove_batch(&ids);
        tracing::info!(
            "⛓️  committed block {} ({} audits, mempool now {})",
            block.id,
            block.audits.len(),
            self.mempool.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::ledger::audit::{Audit, FileInfo, UserInfo};
    use crate::ledger::block::GENESIS_HASH;
    use tempfile::TempDir;

    fn signed_audit(req_id: &str, key: &rsa::RsaPrivateKey) -> Audit {
        let mut audit = Audit {
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
            public_key: crypto::public_key_pem(key).expect("pem"),
        };
        audit.signature =
            crypto::sign_payload(key, &audit.canonical_bytes()).expect("sign");
        audit
    }

    fn test_key() -> rsa::RsaPrivateKey {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(23);
        rsa::RsaPrivateKey::new(&mut rng, 1024).expect("test keygen")
    }

    fn state(dir: &TempDir) -> NodeState {
        NodeState::open(
            "127.0.0.1:7001".to_string(),
            vec![],
            dir.path().to_path_buf(),
        )
        .expect("open state")
    }

    #[test]
    fn build_block_drains_the_snapshot_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        node.mempool.append(signed_audit("r1", &key));
        node.mempool.append(signed_audit("r2", &key));

        let block = node.build_block().expect("block");
        assert_eq!(block.id, 0);
        assert_eq!(block.previous_hash, GENESIS_HASH);
        let ids: Vec<&str> = block.audits.iter().map(|a| a.req_id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2"]);
    }

    #[test]
    fn build_block_is_none_on_empty_mempool() {
        let dir = TempDir::new().expect("tempdir");
        assert!(state(&dir).build_block().is_none());
    }

    #[test]
    fn valid_proposal_passes_all_checks() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        node.mempool.append(signed_audit("r1", &key));
        let block = node.build_block().expect("block");
        assert_eq!(node.validate_proposal(&block), Ok(()));
    }

    #[test]
    fn bad_merkle_root_is_rejected_first() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        node.mempool.append(signed_audit("r1", &key));
        let mut block = node.build_block().expect("block");
        block.merkle_root = "f".repeat(64);
        assert_eq!(
            node.validate_proposal(&block),
            Err("bad merkle_root".to_string())
        );
    }

    #[test]
    fn bad_previous_hash_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        let audits = vec![signed_audit("r1", &key)];
        let block = Block::assemble(1, "f".repeat(64), audits);
        assert_eq!(
            node.validate_proposal(&block),
            Err("bad previous_hash".to_string())
        );
    }

    #[test]
    fn forged_header_hash_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        node.mempool.append(signed_audit("r1", &key));
        let mut block = node.build_block().expect("block");
        block.hash = "e".repeat(64);
        assert_eq!(
            node.validate_proposal(&block),
            Err("block_hash mismatch".to_string())
        );
    }

    #[test]
    fn unsigned_audit_in_block_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        let mut bad = signed_audit("r1", &key);
        bad.signature = String::new();
        let block = Block::assemble(0, GENESIS_HASH.to_string(), vec![bad]);
        assert_eq!(
            node.validate_proposal(&block),
            Err("invalid audit signature: r1".to_string())
        );
    }

    #[test]
    fn commit_evicts_exactly_the_committed_audits() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        node.mempool.append(signed_audit("r1", &key));
        node.mempool.append(signed_audit("r2", &key));
        let block = node.build_block().expect("block");
        // A third audit arrives between proposal and commit.
        node.mempool.append(signed_audit("r3", &key));

        node.commit_block(&block).expect("commit");
        assert_eq!(node.chain.last_id(), 0);
        assert_eq!(node.mempool.len(), 1);
        assert!(node.mempool.contains("r3"));
        assert_eq!(node.chain.get_block_body(0).expect("body"), block);
    }

    #[test]
    fn commit_rejects_a_block_that_skips_ahead() {
        let dir = TempDir::new().expect("tempdir");
        let node = state(&dir);
        let key = test_key();
        let block = Block::assemble(4, "a".repeat(64), vec![signed_audit("r1", &key)]);
        assert!(node.commit_block(&block).is_err());
        assert_eq!(node.chain.last_id(), -1);
    }
}
