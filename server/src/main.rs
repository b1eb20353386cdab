use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server::{router, ServerConfig, ServerState};

#[derive(Parser, Debug)]
#[command(version, about = "In-memory directory and block store server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Answer watch requests with not-supported, forcing clients to poll.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(ServerState::new(ServerConfig {
        watch_supported: !args.no_watch,
    }));
    let app = router(state);

    tracing::info!("listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await.expect("bind");
    axum::serve(listener, app).await.expect("serve");
}
