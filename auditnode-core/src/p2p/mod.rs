//! Cluster layer: peer liveness, leader election, and the leader's duties.
//!
//! All peer traffic is request/response over each peer's RPC endpoint, with
//! a per-call deadline; a deadline or transport failure is logged, counted
//! as a missing vote where votes are being tallied, and never touches local
//! state. Three background loops live here:
//!   - heartbeat: every node reports liveness, progress, and its view of
//!     the leader to every peer,
//!   - proposal: the leader drains the mempool into blocks and drives the
//!     propose/commit round,
//!   - election: non-leaders watch for a stale leader and run for office.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};

use crate::ledger::{Audit, Block, NodeState};
use crate::rpc::{
    BlockVoteResponse, ChainApiClient, HeartbeatRequest, NotifyLeadershipRequest,
    TriggerElectionRequest,
};

/// Extension trait that recovers from poisoned RwLocks gracefully.
trait PoisonRecover<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> PoisonRecover<T> for RwLock<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 cluster RwLock was poisoned (read) — recovering");
            poisoned.into_inner()
        })
    }
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 cluster RwLock was poisoned (write) — recovering");
            poisoned.into_inner()
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── Heartbeat table (latest-seen liveness per peer) ───────────────────────

/// Latest heartbeat seen from one peer. Overwritten on every heartbeat.
#[derive(Clone, Debug, Serialize)]
pub struct HeartbeatEntry {
    pub from_address: String,
    pub current_leader_address: String,
    pub latest_block_id: i64,
    pub mem_pool_size: i64,
    /// Wall clock (unix millis) when this entry was written.
    pub last_seen_ms: u64,
}

#[derive(Default)]
pub struct HeartbeatTable {
    entries: RwLock<HashMap<String, HeartbeatEntry>>,
}

impl HeartbeatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, from: &str, leader: &str, latest_block_id: i64, mem_pool_size: i64) {
        let entry = HeartbeatEntry {
            from_address: from.to_string(),
            current_leader_address: leader.to_string(),
            latest_block_id,
            mem_pool_size,
            last_seen_ms: now_ms(),
        };
        self.entries
            .write_or_recover()
            .insert(from.to_string(), entry);
    }

    pub fn all(&self) -> Vec<HeartbeatEntry> {
        self.entries.read_or_recover().values().cloned().collect()
    }

    /// `(latest_block_id, mem_pool_size)` last reported by `addr`, or zeros
    /// if the peer has never been heard from.
    pub fn stats_for(&self, addr: &str) -> (i64, i64) {
        self.entries
            .read_or_recover()
            .get(addr)
            .map(|e| (e.latest_block_id, e.mem_pool_size))
            .unwrap_or((0, 0))
    }

    /// Whether `addr` has an entry newer than `tau`.
    pub fn is_fresh(&self, addr: &str, tau: Duration) -> bool {
        self.is_fresh_at(addr, now_ms(), tau)
    }

    fn is_fresh_at(&self, addr: &str, now_ms: u64, tau: Duration) -> bool {
        self.entries
            .read_or_recover()
            .get(addr)
            .map(|e| now_ms.saturating_sub(e.last_seen_ms) <= tau.as_millis() as u64)
            .unwrap_or(false)
    }

    /// Addresses whose last heartbeat is older than `tau` as of `now_ms`.
    pub fn expired(&self, now_ms: u64, tau: Duration) -> Vec<String> {
        self.entries
            .read_or_recover()
            .values()
            .filter(|e| now_ms.saturating_sub(e.last_seen_ms) > tau.as_millis() as u64)
            .map(|e| e.from_address.clone())
            .collect()
    }
}

// ─── Election state ────────────────────────────────────────────────────────

#[derive(Default)]
struct ElectionInner {
    /// Current leader address; empty when unknown.
    leader: String,
    /// Candidate this node voted for in the current round; empty when none.
    voted_for: String,
}

/// Node-local view of who leads and who we voted for. Not persisted;
/// transitions are atomic.
#[derive(Default)]
pub struct ElectionState {
    inner: Mutex<ElectionInner>,
}

impl ElectionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ElectionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 election state Mutex was poisoned — recovering");
            poisoned.into_inner()
        })
    }

    pub fn leader(&self) -> String {
        self.lock().leader.clone()
    }

    pub fn set_leader(&self, addr: &str) {
        self.lock().leader = addr.to_string();
    }

    /// Passive leader discovery: adopt `addr` only when no leader is known.
    /// Returns whether adoption happened.
    pub fn adopt_leader_if_unknown(&self, addr: &str) -> bool {
        if addr.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        if inner.leader.is_empty() {
            inner.leader = addr.to_string();
            return true;
        }
        false
    }

    pub fn voted_for(&self) -> String {
        self.lock().voted_for.clone()
    }

    pub fn set_voted_for(&self, addr: &str) {
        self.lock().voted_for = addr.to_string();
    }

    pub fn clear_voted_for(&self) {
        self.lock().voted_for.clear();
    }
}

/// A candidate's claim to leadership, compared against the voter's own view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerStats {
    pub blocks: i64,
    pub pool: i64,
}

/// Vote yes iff the candidate strictly leads on block height, then mempool
/// size, then (deterministic tie-break) lexicographic address order.
pub fn should_grant_vote(
    candidate: PeerStats,
    mine: PeerStats,
    candidate_addr: &str,
    self_addr: &str,
) -> bool {
    candidate.blocks > mine.blocks
        || (candidate.blocks == mine.blocks && candidate.pool > mine.pool)
        || (candidate.blocks == mine.blocks
            && candidate.pool == mine.pool
            && candidate_addr > self_addr)
}

// ─── Peer client ───────────────────────────────────────────────────────────

/// HTTP RPC client for one configured peer. Every call is bounded by an
/// explicit deadline; failures are logged and reported as absent responses.
#[derive(Clone)]
pub struct PeerClient {
    pub addr: String,
    client: HttpClient,
}

impl PeerClient {
    pub fn connect(addr: &str) -> anyhow::Result<Self> {
        let url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        // Outer cap only; individual calls carry their own tighter deadline.
        let client = HttpClientBuilder::default()
            .request_timeout(Duration::from_secs(5))
            .build(url)?;
        Ok(Self {
            addr: addr.to_string(),
            client,
        })
    }

    /// One-hop gossip. Best effort: returns whether the peer admitted it.
    pub async fn whisper_audit(&self, audit: Audit, deadline: Duration) -> bool {
        match timeout(deadline, self.client.whisper_audit(audit)).await {
            Ok(Ok(resp)) => {
                tracing::debug!("gossip to {} acknowledged: {}", self.addr, resp.status);
                true
            }
            Ok(Err(err)) => {
                tracing::warn!("gossip to {} failed: {err}", self.addr);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "gossip to {} timed out after {}ms",
                    self.addr,
                    deadline.as_millis()
                );
                false
            }
        }
    }

    /// Ask the peer to vote on a proposed block. `None` means unreachable,
    /// which tallies the same as a no vote.
    pub async fn propose_block(
        &self,
        block: Block,
        deadline: Duration,
    ) -> Option<BlockVoteResponse> {
        match timeout(deadline, self.client.propose_block(block)).await {
            Ok(Ok(resp)) => Some(resp),
            Ok(Err(err)) => {
                tracing::warn!("propose to {} failed: {err}", self.addr);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "propose to {} timed out after {}ms",
                    self.addr,
                    deadline.as_millis()
                );
                None
            }
        }
    }

    pub async fn commit_block(&self, block: Block, deadline: Duration) -> bool {
        match timeout(deadline, self.client.commit_block(block)).await {
            Ok(Ok(resp)) if resp.status == "success" => true,
            Ok(Ok(resp)) => {
                tracing::warn!(
                    "commit on {} refused: {}",
                    self.addr,
                    resp.error_message.unwrap_or_default()
                );
                false
            }
            Ok(Err(err)) => {
                tracing::warn!("commit on {} failed: {err}", self.addr);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "commit on {} timed out after {}ms",
                    self.addr,
                    deadline.as_millis()
                );
                false
            }
        }
    }

    pub async fn send_heartbeat(&self, req: HeartbeatRequest, deadline: Duration) {
        match timeout(deadline, self.client.send_heartbeat(req)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::debug!("heartbeat to {} failed: {err}", self.addr),
            Err(_) => tracing::debug!("heartbeat to {} timed out", self.addr),
        }
    }

    /// `None` when the peer was unreachable; otherwise its yes/no vote.
    pub async fn trigger_election(
        &self,
        req: TriggerElectionRequest,
        deadline: Duration,
    ) -> Option<bool> {
        match timeout(deadline, self.client.trigger_election(req)).await {
            Ok(Ok(resp)) => Some(resp.vote),
            Ok(Err(err)) => {
                tracing::warn!("election call to {} failed: {err}", self.addr);
                None
            }
            Err(_) => {
                tracing::warn!("election call to {} timed out", self.addr);
                None
            }
        }
    }

    pub async fn notify_leadership(&self, req: NotifyLeadershipRequest, deadline: Duration) {
        match timeout(deadline, self.client.notify_leadership(req)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::warn!("leadership notify to {} failed: {err}", self.addr),
            Err(_) => tracing::warn!("leadership notify to {} timed out", self.addr),
        }
    }
}

/// Build clients for every configured peer.
pub fn connect_peers(peer_addrs: &[String]) -> anyhow::Result<Vec<PeerClient>> {
    peer_addrs.iter().map(|addr| PeerClient::connect(addr)).collect()
}

// ─── Cluster timing configuration ──────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Leader heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Staleness threshold tau: a leader quieter than this is presumed dead.
    pub leader_timeout: Duration,
    /// Proposal tick: the leader proposes at least this often when audits
    /// are pending.
    pub propose_interval: Duration,
    /// Mempool size that triggers a proposal ahead of the tick.
    pub batch_threshold: usize,
    pub gossip_deadline: Duration,
    pub propose_deadline: Duration,
    pub commit_deadline: Duration,
    /// Deadline for heartbeat / election / leadership calls.
    pub rpc_deadline: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            leader_timeout: Duration::from_secs(2),
            propose_interval: Duration::from_secs(1),
            batch_threshold: 64,
            gossip_deadline: Duration::from_millis(200),
            propose_deadline: Duration::from_millis(500),
            commit_deadline: Duration::from_secs(1),
            rpc_deadline: Duration::from_millis(500),
        }
    }
}

// ─── Leader duties ─────────────────────────────────────────────────────────

/// Heartbeat loop. Every node reports its liveness, progress, and view of
/// the current leader; the leader's report is what followers use to detect
/// leader death, and everyone's reports are what election voters use as
/// candidate stats.
pub async fn run_heartbeat_loop(state: NodeState, peers: Vec<PeerClient>, config: ClusterConfig) {
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let req = HeartbeatRequest {
            from_address: state.self_addr.clone(),
            current_leader_address: state.election.leader(),
            latest_block_id: state.chain.last_id(),
            mem_pool_size: state.mempool.len() as i64,
        };
        let mut calls = JoinSet::new();
        for peer in &peers {
            let peer = peer.clone();
            let req = req.clone();
            let deadline = config.rpc_deadline;
            calls.spawn(async move { peer.send_heartbeat(req, deadline).await });
        }
        while calls.join_next().await.is_some() {}
    }
}

/// Leader proposal loop: drain the mempool into a block on the configured
/// tick, or early once the batch threshold is reached.
pub async fn run_proposal_loop(state: NodeState, peers: Vec<PeerClient>, config: ClusterConfig) {
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_proposal = Instant::now();
    loop {
        poll.tick().await;
        if !state.is_leader() || state.mempool.is_empty() {
            continue;
        }
        let due = last_proposal.elapsed() >= config.propose_interval
            || state.mempool.len() >= config.batch_threshold;
        if !due {
            continue;
        }
        last_proposal = Instant::now();
        run_proposal_round(&state, &peers, &config).await;
    }
}

/// One propose → tally → commit round.
async fn run_proposal_round(state: &NodeState, peers: &[PeerClient], config: &ClusterConfig) {
    let Some(block) = state.build_block() else {
        return;
    };
    tracing::info!(
        "📦 proposing block {} with {} audits",
        block.id,
        block.audits.len()
    );

    let mut calls = JoinSet::new();
    for peer in peers {
        let peer = peer.clone();
        let block = block.clone();
        let deadline = config.propose_deadline;
        calls.spawn(async move { peer.propose_block(block, deadline).await });
    }
    // Self counts as a yes vote.
    let mut yes = 1usize;
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok(Some(vote)) if vote.vote => yes += 1,
            Ok(Some(vote)) => tracing::warn!(
                "peer voted no on block {}: {}",
                block.id,
                vote.error_message.unwrap_or_default()
            ),
            _ => {}
        }
    }

    let cluster = state.cluster_size();
    if yes * 2 <= cluster {
        tracing::warn!(
            "🗳️  block {} rejected ({yes}/{cluster} votes), keeping audits pooled",
            block.id
        );
        return;
    }
    tracing::info!("🗳️  block {} approved ({yes}/{cluster} votes)", block.id);

    let mut commits = JoinSet::new();
    for peer in peers {
        let peer = peer.clone();
        let block = block.clone();
        let deadline = config.commit_deadline;
        commits.spawn(async move { peer.commit_block(block, deadline).await });
    }
    while commits.join_next().await.is_some() {}

    if let Err(err) = state.commit_block(&block) {
        tracing::error!("local commit of block {} failed: {err}", block.id);
    }
}

/// Follower election monitor: when the known leader goes quiet for longer
/// than tau (or no leader is known at all), run for office.
pub async fn run_election_loop(state: NodeState, peers: Vec<PeerClient>, config: ClusterConfig) {
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Grace period at startup so a live leader has a chance to be heard.
    let mut quiet_since = Instant::now();
    loop {
        interval.tick().await;
        if state.is_leader() {
            quiet_since = Instant::now();
            continue;
        }
        let leader = state.election.leader();
        if !leader.is_empty() && state.heartbeats.is_fresh(&leader, config.leader_timeout) {
            quiet_since = Instant::now();
            continue;
        }
        if quiet_since.elapsed() < config.leader_timeout {
            continue;
        }
        // Also spaces retries when a round fails to reach quorum.
        quiet_since = Instant::now();
        run_election_round(&state, &peers, &config).await;
    }
}

/// One election round with this node as candidate.
async fn run_election_round(state: &NodeState, peers: &[PeerClient], config: &ClusterConfig) {
    tracing::info!(
        "🗳️  leader '{}' unreachable, running for election as {}",
        state.election.leader(),
        state.self_addr
    );
    // New round: forget any earlier vote, then vote for ourselves.
    state.election.clear_voted_for();
    state.election.set_voted_for(&state.self_addr);

    let req = TriggerElectionRequest {
        address: state.self_addr.clone(),
    };
    let mut calls = JoinSet::new();
    for peer in peers {
        let peer = peer.clone();
        let req = req.clone();
        let deadline = config.rpc_deadline;
        calls.spawn(async move { peer.trigger_election(req, deadline).await });
    }
    let mut yes = 1usize; // our own vote
    while let Some(joined) = calls.join_next().await {
        if let Ok(Some(true)) = joined {
            yes += 1;
        }
    }

    let cluster = state.cluster_size();
    if yes * 2 <= cluster {
        tracing::info!("lost election ({yes}/{cluster} votes)");
        return;
    }
    state.election.set_leader(&state.self_addr);
    tracing::info!("👑 won election ({yes}/{cluster} votes), announcing leadership");

    let req = NotifyLeadershipRequest {
        address: state.self_addr.clone(),
    };
    let mut notifies = JoinSet::new();
    for peer in peers {
        let peer = peer.clone();
        let req = req.clone();
        let deadline = config.rpc_deadline;
        notifies.spawn(async move { peer.notify_leadership(req, deadline).await });
    }
    while notifies.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_update_overwrites_the_entry() {
        let table = HeartbeatTable::new();
        table.update("127.0.0.1:7002", "127.0.0.1:7001", 3, 5);
        table.update("127.0.0.1:7002", "127.0.0.1:7009", 4, 2);
        let all = table.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].current_leader_address, "127.0.0.1:7009");
        assert_eq!(all[0].latest_block_id, 4);
        assert_eq!(all[0].mem_pool_size, 2);
        assert_eq!(table.stats_for("127.0.0.1:7002"), (4, 2));
    }

    #[test]
    fn unknown_peer_stats_default_to_zero() {
        let table = HeartbeatTable::new();
        assert_eq!(table.stats_for("nobody"), (0, 0));
    }

    #[test]
    fn expiry_is_relative_to_tau() {
        let table = HeartbeatTable::new();
        table.update("a", "l", 0, 0);
        let seen = table.all()[0].last_seen_ms;
        let tau = Duration::from_secs(2);
        assert!(table.expired(seen + 1000, tau).is_empty());
        assert_eq!(table.expired(seen + 2001, tau), vec!["a".to_string()]);
        assert!(table.is_fresh_at("a", seen + 1000, tau));
        assert!(!table.is_fresh_at("a", seen + 2001, tau));
        assert!(!table.is_fresh_at("missing", seen, tau));
    }

    #[test]
    fn election_state_transitions() {
        let state = ElectionState::new();
        assert!(state.leader().is_empty());
        assert!(state.adopt_leader_if_unknown("127.0.0.1:7001"));
        assert!(!state.adopt_leader_if_unknown("127.0.0.1:7002"));
        assert_eq!(state.leader(), "127.0.0.1:7001");

        state.set_voted_for("127.0.0.1:7003");
        assert_eq!(state.voted_for(), "127.0.0.1:7003");
        state.clear_voted_for();
        assert!(state.voted_for().is_empty());

        state.set_leader("127.0.0.1:7004");
        assert_eq!(state.leader(), "127.0.0.1:7004");
    }

    #[test]
    fn vote_prefers_higher_block_count() {
        let cand = PeerStats { blocks: 6, pool: 0 };
        let mine = PeerStats { blocks: 5, pool: 9 };
        assert!(should_grant_vote(cand, mine, "a", "z"));
        assert!(!should_grant_vote(mine, cand, "z", "a"));
    }

    #[test]
    fn vote_breaks_block_ties_on_pool_size() {
        let cand = PeerStats { blocks: 5, pool: 4 };
        let mine = PeerStats { blocks: 5, pool: 3 };
        assert!(should_grant_vote(cand, mine, "a", "z"));
        assert!(!should_grant_vote(mine, cand, "a", "z"));
    }

    #[test]
    fn full_tie_goes_to_the_lexicographically_larger_address() {
        let stats = PeerStats { blocks: 5, pool: 3 };
        assert!(should_grant_vote(
            stats,
            stats,
            "127.0.0.1:7002",
            "127.0.0.1:7001"
        ));
        assert!(!should_grant_vote(
            stats,
            stats,
            "127.0.0.1:7001",
            "127.0.0.1:7002"
        ));
        // A candidate never beats itself.
        assert!(!should_grant_vote(stats, stats, "127.0.0.1:7001", "127.0.0.1:7001"));
    }
}
