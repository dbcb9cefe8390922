use clap::Parser;
use log::{error, info};
use server::config::{CacheConfig, LockConfig, ServerConfig};
use server::network::Server;
use std::path::PathBuf;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, opens the caches and runs the request
/// server until it fails or Ctrl+C is pressed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "20")]
        tick_rate: u32,
        /// Directory for the persisted snapshot; memory only when omitted
        #[clap(short, long)]
        data_dir: Option<PathBuf>,
        /// Seconds between flushes of dirty cache entries
        #[clap(long, default_value = "5")]
        flush_secs: u64,
        /// Seconds of silence before a session is dropped
        #[clap(long, default_value = "30")]
        session_timeout: u64,
        /// Milliseconds a request may wait for one lock (0 waits forever)
        #[clap(long, default_value = "0")]
        lock_timeout_ms: u64,
        /// Chat messages kept in memory once persisted
        #[clap(long, default_value = "500")]
        message_capacity: usize,
        /// Maximum concurrent sessions
        #[clap(long, default_value = "64")]
        max_sessions: usize,
        /// Seconds between lock statistics reports
        #[clap(long, default_value = "60")]
        stats_secs: u64,
    }

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        tick_duration: Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1))),
        flush_interval: Duration::from_secs(args.flush_secs.max(1)),
        session_timeout: Duration::from_secs(args.session_timeout.max(1)),
        stats_interval: Duration::from_secs(args.stats_secs.max(1)),
        cache: CacheConfig {
            data_dir: args.data_dir,
            message_capacity: args.message_capacity,
            max_sessions: args.max_sessions,
            lock: LockConfig {
                acquire_timeout: (args.lock_timeout_ms > 0)
                    .then(|| Duration::from_millis(args.lock_timeout_ms)),
            },
        },
    };
    info!("Starting server with {:?}", config);

    let mut server = Server::new(config).await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    server.shutdown().await?;
    Ok(())
}
