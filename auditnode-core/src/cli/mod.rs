//! CLI module for AuditNode

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "auditnode")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Replicated file-audit ledger node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node (RPC server + cluster duties)
    Start {
        /// Directory for the chain index and block files
        /// (defaults to ~/.auditnode)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// RPC bind address
        #[arg(long, default_value = "127.0.0.1:7001")]
        listen: String,

        /// Address peers use to reach this node; also the election identity
        /// (defaults to --listen)
        #[arg(long)]
        advertise: Option<String>,

        /// Peer address (can be specified multiple times)
        #[arg(long = "peer", short = 'p')]
        peers: Vec<String>,

        /// Mempool size that triggers a block proposal ahead of the tick
        #[arg(long, default_value_t = 64)]
        batch_threshold: usize,
    },

    /// Generate an RSA keypair for audit signing
    Keygen {
        /// Output path for the private key PEM (the public PEM lands beside it)
        #[arg(short, long, default_value = "client.pem")]
        output: PathBuf,
    },

    /// Sign one audit record and submit it to a running node
    Submit {
        /// RPC endpoint of the node to submit through
        #[arg(long, default_value = "http://127.0.0.1:7001")]
        rpc_url: String,

        /// Path to the private key PEM created by keygen
        #[arg(long, short = 'k')]
        key: PathBuf,

        /// Request id (random when omitted)
        #[arg(long)]
        req_id: Option<String>,

        #[arg(long)]
        file_id: String,

        #[arg(long)]
        file_name: String,

        #[arg(long)]
        user_id: String,

        #[arg(long)]
        user_name: String,

        /// Access type recorded in the audit (read, write, delete, ...)
        #[arg(long, default_value = "read")]
        access_type: String,

        /// Audit timestamp (defaults to current unix millis)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Fetch a committed block from a running node
    GetBlock {
        /// RPC endpoint of the node to query
        #[arg(long, default_value = "http://127.0.0.1:7001")]
        rpc_url: String,

        /// Block id
        id: i64,
    },
}
