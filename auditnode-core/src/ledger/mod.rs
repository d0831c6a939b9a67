//! Ledger core: audits, blocks, the mempool, and shared node state.

pub mod audit;
pub mod block;
pub mod mempool;
pub mod state;

pub use audit::{Audit, FileInfo, UserInfo};
pub use block::{Block, BlockMeta, GENESIS_HASH};
pub use mempool::Mempool;
pub use state::NodeState;
