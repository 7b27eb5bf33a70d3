//! Haven — profile-hosting node for a peer-to-peer identity network.
//!
//! Hosts public-key-addressed identity profiles, relays application-service
//! calls between them, answers search queries, and replicates its identity
//! set to follower servers in a neighborhood.

use clap::Parser;
use haven::{join_neighborhood, Config};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "haven", version, about = "Haven: identity profile-hosting node")]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Primary (discovery) port
    #[arg(long, default_value = "16987")]
    primary_port: u16,

    /// Server-neighbor port
    #[arg(long, default_value = "16988")]
    neighbor_port: u16,

    /// Client non-customer port
    #[arg(long, default_value = "16989")]
    non_customer_port: u16,

    /// Client customer port
    #[arg(long, default_value = "16990")]
    customer_port: u16,

    /// Client app-service port
    #[arg(long, default_value = "16991")]
    app_service_port: u16,

    /// Maximum hosted identities
    #[arg(long, default_value = "10000")]
    max_hosted_identities: usize,

    /// Maximum relationship cards per identity
    #[arg(long, default_value = "100")]
    max_identity_relations: usize,

    /// Maximum follower servers
    #[arg(long, default_value = "200")]
    max_followers: usize,

    /// Concurrent neighborhood initializations
    #[arg(long, default_value = "3")]
    init_parallelism: usize,

    /// Keep-alive interval in seconds
    #[arg(long, default_value = "60")]
    keep_alive: u64,

    /// Neighbor servers to join (host:neighbor_port, comma-separated)
    #[arg(short, long)]
    join: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("haven=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("════════════════════════════════════════════════════════════");
    info!("  Haven v{} — identity profile-hosting node", VERSION);
    info!("════════════════════════════════════════════════════════════");

    let config = Config {
        data_dir: args.data_dir.clone(),
        bind_addr: args.bind,
        primary_port: args.primary_port,
        server_neighbor_port: args.neighbor_port,
        client_non_customer_port: args.non_customer_port,
        client_customer_port: args.customer_port,
        client_app_service_port: args.app_service_port,
        max_hosted_identities: args.max_hosted_identities,
        max_identity_relations: args.max_identity_relations,
        max_followers: args.max_followers,
        init_parallelism: args.init_parallelism,
        keep_alive_secs: args.keep_alive,
    };

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!("cannot create data dir {:?}: {}", args.data_dir, e);
        return;
    }
    let keypair = match haven::crypto::load_or_generate_keypair(&args.data_dir) {
        Ok(kp) => kp,
        Err(e) => {
            error!("cannot load node keypair: {}", e);
            return;
        }
    };
    info!("node identity: {}", hex::encode(keypair.identity_id()));

    let ctx = match haven::net::start(config, keypair).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to start listeners: {}", e);
            return;
        }
    };

    // Join requested neighborhoods: replicate their identity sets here and
    // subscribe to their updates.
    if let Some(joins) = args.join {
        for target in joins.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match target.parse::<SocketAddr>() {
                Ok(addr) => match join_neighborhood(&ctx, addr).await {
                    Ok(neighbor) => {
                        info!("joined neighborhood of {}", hex::encode(&neighbor[..8]))
                    }
                    Err(e) => warn!("joining {} failed: {}", addr, e),
                },
                Err(_) => warn!("invalid --join target: {}", target),
            }
        }
    }

    // Status printer
    let status_ctx = ctx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let sessions = status_ctx.session_count().await;
            let stats = status_ctx.registry.stats().await;
            info!(
                "Status: {} sessions | {} online identities | {} hosted | {} followers | {} queued actions",
                sessions,
                stats.online,
                status_ctx.store.count_hosted(),
                status_ctx.store.count_followers(),
                status_ctx.store.count_actions()
            );
        }
    });

    info!("Haven running. Hosting {} identities.", ctx.store.count_hosted());

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    if let Err(e) = ctx.store.flush().await {
        warn!("final flush failed: {}", e);
    }
}
