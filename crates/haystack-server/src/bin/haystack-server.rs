//! Haystack Server CLI
//!
//! A thin wrapper around the haystack-server library.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use haystack::{DispatcherConfig, Num};
use tower_http::cors::CorsLayer;

#[derive(Parser)]
#[command(name = "haystack-server")]
#[command(about = "Haystack record and watch server")]
#[command(after_help = "\
EXAMPLES:
    # Serve records from a directory of .json files
    haystack-server ./site/

    # Short leases, swept every second
    haystack-server --default-lease 30s --max-lease 5min --sweep-interval 1 ./site/
")]
struct Args {
    /// Record files (.json arrays of dicts) or directories of them
    paths: Vec<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Time zone reported by /about
    #[arg(long, default_value = "UTC")]
    tz: String,

    /// Lease for watches opened without one
    #[arg(long, default_value = "1min")]
    default_lease: Num,

    /// Longest lease a client may request
    #[arg(long, default_value = "1hr")]
    max_lease: Num,

    /// Seconds between lease expiry sweeps
    #[arg(long, default_value = "10")]
    sweep_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // both leases must be durations
    let default_lease = args.default_lease.as_duration()?;
    let max_lease = args.max_lease.as_duration()?;
    if default_lease > max_lease {
        anyhow::bail!("--default-lease {} exceeds --max-lease {}", args.default_lease, args.max_lease);
    }

    let config = DispatcherConfig {
        tz: args.tz,
        default_lease: args.default_lease,
        max_lease: args.max_lease,
        ..DispatcherConfig::default()
    };
    log::info!(
        "Leases: default {}, max {}",
        config.default_lease,
        config.max_lease
    );
    let core = Arc::new(haystack_server::ServerCore::with_config(config));

    let loaded = haystack_server::loader::load_into(&core, &args.paths).await;
    log::info!("Loaded {} records", loaded);

    let _sweeper = core.spawn_lease_sweeper(Duration::from_secs(args.sweep_interval.max(1)));

    let router = haystack_server::build_router_with_docs(core).layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    println!("Starting server on {}", addr);
    println!("  GET  /about, /ops, /formats");
    println!("  POST /read, /commit");
    println!("  POST /watchSub, /watchUnsub, /watchPoll; GET /watches");
    println!("  GET  /watchStream?watchId=<id> - SSE watch stream");
    println!("  POST /hisRead, /hisWrite, /pointWrite, /pointWriteArray, /invokeAction");
    println!("  GET  /swagger-ui - API documentation");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
