//! Blocks: ordered, Merkle-summarised batches of audits linked by hash.

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::ledger::audit::Audit;

/// `previous_hash` of block 0. Every node in a cluster must agree on this.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A committed (or proposed) block. Immutable once committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Strictly monotonic, contiguous from 0.
    pub id: i64,
    /// Hash of block `id - 1`, or [`GENESIS_HASH`] for block 0.
    pub previous_hash: String,
    /// Merkle reduction over the audits' canonical leaf digests, in order.
    pub merkle_root: String,
    /// Header hash; see [`Block::header_hash`].
    pub hash: String,
    pub audits: Vec<Audit>,
}

/// The four-field summary persisted to the chain index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: i64,
    pub hash: String,
    pub previous_hash: String,
    pub merkle_root: String,
}

impl Block {
    /// Build a block over `audits`, computing the Merkle root and header
    /// hash. Audit order is preserved; it is the order the leaves are
    /// reduced in.
    pub fn assemble(id: i64, previous_hash: String, audits: Vec<Audit>) -> Self {
        let merkle_root = Self::compute_merkle_root(&audits);
        let hash = Self::header_hash(id, &previous_hash, &merkle_root);
        Self {
            id,
            previous_hash,
            merkle_root,
            hash,
            audits,
        }
    }

    /// Merkle root of the canonical leaf digests of `audits`, in order.
    pub fn compute_merkle_root(audits: &[Audit]) -> String {
        let leaves: Vec<String> = audits.iter().map(Audit::leaf_hash).collect();
        crypto::merkle_root(&leaves)
    }

    /// Hash over the block header. The Merkle root already commits to the
    /// ordered audit list, so hashing `(id, previous_hash, merkle_root)` pins
    /// the whole block without depending on any message serialization.
    pub fn header_hash(id: i64, previous_hash: &str, merkle_root: &str) -> String {
        crypto::sha256_hex(format!("{id}{previous_hash}{merkle_root}").as_bytes())
    }

    /// Index entry for this block.
    pub fn meta(&self) -> BlockMeta {
        BlockMeta {
            id: self.id,
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            merkle_root: self.merkle_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::audit::{Audit, FileInfo, UserInfo};

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

    #[test]
    fn genesis_hash_is_sixty_four_zeros() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn single_audit_block_root_is_the_leaf() {
        let a = audit("r1");
        let block = Block::assemble(0, GENESIS_HASH.to_string(), vec![a.clone()]);
        assert_eq!(block.merkle_root, a.leaf_hash());
    }

    #[test]
    fn header_hash_covers_every_header_field() {
        let base = Block::header_hash(0, GENESIS_HASH, "root");
        assert_ne!(base, Block::header_hash(1, GENESIS_HASH, "root"));
        assert_ne!(base, Block::header_hash(0, "ff", "root"));
        assert_ne!(base, Block::header_hash(0, GENESIS_HASH, "other"));
        assert_eq!(base, Block::header_hash(0, GENESIS_HASH, "root"));
    }

    #[test]
    fn assemble_sets_hash_from_header() {
        let block = Block::assemble(3, "ab".repeat(32), vec![audit("r1"), audit("r2")]);
        assert_eq!(
            block.hash,
            Block::header_hash(3, &block.previous_hash, &block.merkle_root)
        );
    }

    #[test]
    fn two_nodes_agree_on_the_root_for_the_same_ordered_audits() {
        let audits = vec![audit("r1"), audit("r2"), audit("r3")];
        let here = Block::compute_merkle_root(&audits);
        let there = Block::compute_merkle_root(&audits.clone());
        assert_eq!(here, there);

        let mut reordered = audits;
        reordered.swap(0, 1);
        assert_ne!(here, Block::compute_merkle_root(&reordered));
    }

    #[test]
    fn meta_projects_the_header() {
        let block = Block::assemble(2, "cd".repeat(32), vec![audit("r9")]);
        let meta = block.meta();
        assert_eq!(meta.id, 2);
        assert_eq!(meta.hash, block.hash);
        assert_eq!(meta.previous_hash, block.previous_hash);
        assert_eq!(meta.merkle_root, block.merkle_root);
    }
}
