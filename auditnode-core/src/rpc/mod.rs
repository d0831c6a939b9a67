//! JSON-RPC surface of the node.
//!
//! Two services share one server:
//! - `audit_*` — client ingress: verify a signed audit, admit it to the
//!   mempool, and gossip it one hop to every peer under a bounded deadline.
//! - `chain_*` — the peer protocol: gossip intake, block propose/commit,
//!   block reads, heartbeats, elections, and leadership announcements.
//!
//! The same trait declarations generate the typed peer clients used by the
//! cluster layer, so wire shapes cannot drift between caller and callee.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tower_http::cors::{Any, CorsLayer};

use crate::ledger::{Audit, Block, NodeState};
use crate::p2p::{should_grant_vote, PeerClient, PeerStats};
use crate::storage::StorageError;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILURE: &str = "failure";

// ─── Wire types ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditSubmitResponse {
    pub req_id: String,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhisperResponse {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockVoteResponse {
    pub vote: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockCommitResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlockResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Block>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub from_address: String,
    pub current_leader_address: String,
    pub latest_block_id: i64,
    pub mem_pool_size: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerElectionRequest {
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerElectionResponse {
    pub vote: bool,
    /// Reserved for a term-based protocol variant; always 0.
    pub term: i64,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyLeadershipRequest {
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyLeadershipResponse {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    pub address: String,
    pub latest_block_id: i64,
    pub last_hash: String,
    pub mempool_size: usize,
    pub leader: String,
    pub voted_for: String,
    pub peer_count: usize,
}

// ─── Service traits ────────────────────────────────────────────────────────

#[rpc(server, client)]
pub trait AuditApi {
    /// Submit a signed audit record. Verifies, admits to the mempool, and
    /// gossips one hop to every peer before replying.
    #[method(name = "audit_submitAudit")]
    async fn submit_audit(&self, audit: Audit) -> RpcResult<AuditSubmitResponse>;
}

#[rpc(server, client)]
pub trait ChainApi {
    /// Gossip intake. Admits like `audit_submitAudit` but never re-gossips.
    #[method(name = "chain_whisperAudit")]
    async fn whisper_audit(&self, audit: Audit) -> RpcResult<WhisperResponse>;

    /// Vote on a proposed block.
    #[method(name = "chain_proposeBlock")]
    async fn propose_block(&self, block: Block) -> RpcResult<BlockVoteResponse>;

    /// Commit a quorum-approved block.
    #[method(name = "chain_commitBlock")]
    async fn commit_block(&self, block: Block) -> RpcResult<BlockCommitResponse>;

    /// Read a committed block by id.
    #[method(name = "chain_getBlock")]
    async fn get_block(&self, id: i64) -> RpcResult<GetBlockResponse>;

    /// Liveness + progress report from a peer (usually the leader).
    #[method(name = "chain_sendHeartbeat")]
    async fn send_heartbeat(&self, req: HeartbeatRequest) -> RpcResult<HeartbeatResponse>;

    /// Vote request from a candidate.
    #[method(name = "chain_triggerElection")]
    async fn trigger_election(
        &self,
        req: TriggerElectionRequest,
    ) -> RpcResult<TriggerElectionResponse>;

    /// Winner's leadership announcement.
    #[method(name = "chain_notifyLeadership")]
    async fn notify_leadership(
        &self,
        req: NotifyLeadershipRequest,
    ) -> RpcResult<NotifyLeadershipResponse>;

    /// Local node status snapshot.
    #[method(name = "chain_status")]
    async fn status(&self) -> RpcResult<NodeStatusResponse>;
}

// ─── Audit service ─────────────────────────────────────────────────────────

pub struct AuditRpcImpl {
    state: NodeState,
    peers: Arc<Vec<PeerClient>>,
    gossip_deadline: Duration,
}

impl AuditRpcImpl {
    pub fn new(state: NodeState, peers: Arc<Vec<PeerClient>>, gossip_deadline: Duration) -> Self {
        Self {
            state,
            peers,
            gossip_deadline,
        }
    }
}

#[async_trait]
impl AuditApiServer for AuditRpcImpl {
    async fn submit_audit(&self, audit: Audit) -> RpcResult<AuditSubmitResponse> {
        if !audit.verify() {
            tracing::warn!(req_id = %audit.req_id, "rejecting audit with invalid signature");
            return Err(ErrorObjectOwned::owned(
                -32602,
                "Invalid client signature",
                None::<()>,
            ));
        }
        let admitted = self.state.mempool.append(audit.clone());
        tracing::info!(
            req_id = %audit.req_id,
            admitted,
            pool = self.state.mempool.len(),
            "audit accepted from client"
        );

        // One-hop gossip, concurrently, each call bounded by the gossip
        // deadline. Failures are logged by the peer client and never affect
        // the client's response; we only wait for every call to settle.
        let mut calls = JoinSet::new();
        for peer in self.peers.iter() {
            let peer = peer.clone();
            let audit = audit.clone();
            let deadline = self.gossip_deadline;
            calls.spawn(async move { peer.whisper_audit(audit, deadline).await });
        }
        while calls.join_next().await.is_some() {}

        Ok(AuditSubmitResponse {
            req_id: audit.req_id,
            status: STATUS_SUCCESS.to_string(),
        })
    }
}

// ─── Blockchain service ────────────────────────────────────────────────────

pub struct ChainRpcImpl {
    state: NodeState,
}

impl ChainRpcImpl {
    pub fn new(state: NodeState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ChainApiServer for ChainRpcImpl {
    async fn whisper_audit(&self, audit: Audit) -> RpcResult<WhisperResponse> {
        if !audit.verify() {
            tracing::warn!(req_id = %audit.req_id, "invalid signature in gossiped audit");
            return Err(ErrorObjectOwned::owned(
                -32602,
                "Invalid signature in gossiped audit",
                None::<()>,
            ));
        }
        // Admit and stop: whispered audits are never forwarded again, which
        // is what keeps the one-hop gossip from flooding.
        let admitted = self.state.mempool.append(audit.clone());
        tracing::debug!(
            req_id = %audit.req_id,
            admitted,
            pool = self.state.mempool.len(),
            "audit accepted from gossip"
        );
        Ok(WhisperResponse {
            status: STATUS_SUCCESS.to_string(),
        })
    }

    async fn propose_block(&self, block: Block) -> RpcResult<BlockVoteResponse> {
        match self.state.validate_proposal(&block) {
            Ok(()) => Ok(BlockVoteResponse {
                vote: true,
                status: STATUS_SUCCESS.to_string(),
                error_message: None,
            }),
            Err(reason) => {
                tracing::warn!("voting no on proposed block {}: {reason}", block.id);
                Ok(BlockVoteResponse {
                    vote: false,
                    status: STATUS_FAILURE.to_string(),
                    error_message: Some(reason),
                })
            }
        }
    }

    async fn commit_block(&self, block: Block) -> RpcResult<BlockCommitResponse> {
        match self.state.commit_block(&block) {
            Ok(()) => Ok(BlockCommitResponse {
                status: STATUS_SUCCESS.to_string(),
                error_message: None,
            }),
            Err(reason) => {
                tracing::error!("refusing to commit block {}: {reason}", block.id);
                Ok(BlockCommitResponse {
                    status: STATUS_FAILURE.to_string(),
                    error_message: Some(reason),
                })
            }
        }
    }

    async fn get_block(&self, id: i64) -> RpcResult<GetBlockResponse> {
        let failure = |message: &str| GetBlockResponse {
            block: None,
            status: STATUS_FAILURE.to_string(),
            error_message: Some(message.to_string()),
        };
        if id < 0 || id > self.state.chain.last_id() {
            return Ok(failure("block id out of range"));
        }
        match self.state.chain.get_block_body(id) {
            Ok(block) => Ok(GetBlockResponse {
                block: Some(block),
                status: STATUS_SUCCESS.to_string(),
                error_message: None,
            }),
            Err(StorageError::Parse(err)) => {
                tracing::error!("block {id} body is unreadable: {err}");
                Ok(failure("JSON parse error"))
            }
            Err(err) => {
                tracing::error!("block {id} body could not be opened: {err}");
                Ok(failure("could not open block file"))
            }
        }
    }

    async fn send_heartbeat(&self, req: HeartbeatRequest) -> RpcResult<HeartbeatResponse> {
        self.state.heartbeats.update(
            &req.from_address,
            &req.current_leader_address,
            req.latest_block_id,
            req.mem_pool_size,
        );
        if self
            .state
            .election
            .adopt_leader_if_unknown(&req.current_leader_address)
        {
            tracing::info!("learned new leader: {}", req.current_leader_address);
        }
        Ok(HeartbeatResponse {
            status: STATUS_SUCCESS.to_string(),
        })
    }

    async fn trigger_election(
        &self,
        req: TriggerElectionRequest,
    ) -> RpcResult<TriggerElectionResponse> {
        let (cand_blocks, cand_pool) = self.state.heartbeats.stats_for(&req.address);
        let candidate = PeerStats {
            blocks: cand_blocks,
            pool: cand_pool,
        };
        let mine = PeerStats {
            blocks: self.state.chain.last_id(),
            pool: self.state.mempool.len() as i64,
        };
        let vote = should_grant_vote(candidate, mine, &req.address, &self.state.self_addr);
        if vote {
            self.state.election.set_voted_for(&req.address);
        }
        tracing::info!(
            candidate = %req.address,
            vote,
            "election vote cast (candidate {:?} vs own {:?})",
            candidate,
            mine
        );
        Ok(TriggerElectionResponse {
            vote,
            term: 0,
            status: STATUS_SUCCESS.to_string(),
        })
    }

    async fn notify_leadership(
        &self,
        req: NotifyLeadershipRequest,
    ) -> RpcResult<NotifyLeadershipResponse> {
        self.state.election.set_leader(&req.address);
        tracing::info!("👑 new leader announced: {}", req.address);
        Ok(NotifyLeadershipResponse {
            status: STATUS_SUCCESS.to_string(),
        })
    }

    async fn status(&self) -> RpcResult<NodeStatusResponse> {
        Ok(NodeStatusResponse {
            address: self.state.self_addr.clone(),
            latest_block_id: self.state.chain.last_id(),
            last_hash: self.state.chain.last_hash(),
            mempool_size: self.state.mempool.len(),
            leader: self.state.election.leader(),
            voted_for: self.state.election.voted_for(),
            peer_count: self.state.peer_addrs.len(),
        })
    }
}

// ─── Server bootstrap ──────────────────────────────────────────────────────

/// Start the JSON-RPC server hosting both services on `addr`.
pub async fn start_rpc_server(
    state: NodeState,
    peers: Arc<Vec<PeerClient>>,
    addr: SocketAddr,
    gossip_deadline: Duration,
) -> anyhow::Result<ServerHandle> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let middleware = tower::ServiceBuilder::new().layer(cors);

    let server = Server::builder()
        .set_middleware(middleware)
        .build(addr)
        .await?;

    let mut module = AuditRpcImpl::new(state.clone(), peers, gossip_deadline).into_rpc();
    module.merge(ChainRpcImpl::new(state).into_rpc())?;

    let handle = server.start(module);
    tracing::info!("🌐 JSON-RPC server started on http://{addr}");
    Ok(handle)
}
