//! AuditNode - one node of a replicated file-audit ledger.
//!
//! Clients sign and submit audit records; the cluster gossips them into
//! every mempool, the elected leader batches them into Merkle-rooted,
//! hash-chained blocks, and a strict majority of peers votes each block in.
//! Any node serves committed blocks back by id.

mod cli;
mod crypto;
mod ledger;
mod p2p;
mod rpc;
mod storage;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use crate::ledger::{Audit, FileInfo, NodeState, UserInfo};
use crate::p2p::ClusterConfig;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            data_dir,
            listen,
            advertise,
            peers,
            batch_threshold,
        } => {
            tracing::info!("🦀 Starting AuditNode...");

            let listen_addr: std::net::SocketAddr = listen
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid --listen address (use host:port)"))?;
            let self_addr = advertise.unwrap_or_else(|| listen.clone());
            let data_dir = data_dir.unwrap_or_else(storage::ChainStore::default_data_dir);

            std::fs::create_dir_all(&data_dir)?;
            let state = NodeState::open(self_addr, peers, data_dir)?;
            let peer_clients = Arc::new(p2p::connect_peers(&state.peer_addrs)?);

            let config = ClusterConfig {
                batch_threshold,
                ..ClusterConfig::default()
            };

            let rpc_handle = rpc::start_rpc_server(
                state.clone(),
                peer_clients.clone(),
                listen_addr,
                config.gossip_deadline,
            )
            .await?;

            // Background cluster loops: announce liveness, drain the mempool
            // into blocks (leader only), and watch for a dead leader.
            let heartbeat_handle = tokio::spawn(p2p::run_heartbeat_loop(
                state.clone(),
                (*peer_clients).clone(),
                config.clone(),
            ));
            let proposal_handle = tokio::spawn(p2p::run_proposal_loop(
                state.clone(),
                (*peer_clients).clone(),
                config.clone(),
            ));
            let election_handle = tokio::spawn(p2p::run_election_loop(
                state.clone(),
                (*peer_clients).clone(),
                config.clone(),
            ));

            tracing::info!(
                "✅ Node running - RPC: {}, identity: {}, peers: {}",
                listen_addr,
                state.self_addr,
                state.peer_addrs.len()
            );

            // Wait for shutdown
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down...");

            heartbeat_handle.abort();
            proposal_handle.abort();
            election_handle.abort();
            rpc_handle.stop()?;
        }

        Commands::Keygen { output } => {
            tracing::info!("🔑 Generating 2048-bit RSA keypair (this can take a moment)...");
            let key = crypto::generate_keypair()?;
            let public_path = crypto::save_keypair(&output, &key)?;
            tracing::info!("Private key written to {:?}", output);
            tracing::info!("Public key written to {:?}", public_path);
        }

        Commands::Submit {
            rpc_url,
            key,
            req_id,
            file_id,
            file_name,
            user_id,
            user_name,
            access_type,
            timestamp,
        } => {
            use crate::rpc::AuditApiClient;

            let signing_key = crypto::load_private_key(&key)
                .map_err(|e| anyhow::anyhow!("failed to load key {:?}: {e}", key))?;
            let req_id = req_id.unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>()));
            let timestamp = timestamp.unwrap_or_else(now_millis);

            let mut audit = Audit {
                req_id,
                timestamp,
                access_type,
                file_info: FileInfo { file_id, file_name },
                user_info: UserInfo { user_id, user_name },
                signature: String::new(),
                public_key: crypto::public_key_pem(&signing_key)?,
            };
            audit.signature = crypto::sign_payload(&signing_key, &audit.canonical_bytes())?;
            tracing::info!("📤 Submitting audit {} to {}", audit.req_id, rpc_url);

            let client = jsonrpsee::http_client::HttpClientBuilder::default().build(&rpc_url)?;
            let resp = client.submit_audit(audit).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }

        Commands::GetBlock { rpc_url, id } => {
            use crate::rpc::ChainApiClient;

            let client = jsonrpsee::http_client::HttpClientBuilder::default().build(&rpc_url)?;
            let resp = client.get_block(id).await?;
            match resp.block {
                Some(block) => println!("{}", serde_json::to_string_pretty(&block)?),
                None => anyhow::bail!(
                    "node returned {}: {}",
                    resp.status,
                    resp.error_message.unwrap_or_default()
                ),
            }
        }
    }

    Ok(())
}
