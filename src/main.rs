use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use warden::{config::WardenConfig, server};

/// Named reader/writer locks over plain TCP.
#[derive(Parser, Debug)]
#[command(name = "warden")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, env = "WARDEN_PORT", default_value_t = 11311)]
    port: u16,

    /// Deadline for ACQUIRE requests that carry no timeout (milliseconds).
    #[arg(long, env = "WARDEN_DEFAULT_TIMEOUT_MS", default_value_t = 30_000)]
    default_timeout_ms: u64,

    /// Admit new readers even while a writer is waiting.
    #[arg(long, env = "WARDEN_GREEDY_READERS", default_value_t = false)]
    greedy_readers: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = WardenConfig {
        port: args.port,
        default_timeout_ms: args.default_timeout_ms,
        greedy_readers: args.greedy_readers,
    };

    // only an unrecoverable listener failure gets us here
    if let Err(err) = server::serve(config).await {
        error!("server terminated: {}", err);
        std::process::exit(1);
    }
}
