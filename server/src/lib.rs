//! In-memory remote side: directory service, content-addressed block
//! store, user-key registry and WebSocket watch feed.
//!
//! Runs standalone through `main.rs` or in-process inside the client's
//! integration tests via [`spawn_inprocess`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod state;
pub mod types;

pub use state::{ServerConfig, ServerState};

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/dir/*path",
            get(handlers::lookup).put(handlers::put_entry).delete(handlers::delete_entry),
        )
        .route("/list/*path", get(handlers::list_dir))
        .route("/rename", post(handlers::rename))
        .route("/settime/*path", post(handlers::set_time))
        .route("/access/*path", get(handlers::access))
        .route("/block", post(handlers::put_block))
        .route("/block/:reference", get(handlers::get_block))
        .route("/key/:user", get(handlers::get_key).put(handlers::put_key))
        .route("/watch/*root", get(handlers::watch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle to a server running on its own background runtime.
pub struct InProcessServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl InProcessServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start a server on an ephemeral localhost port. The serving thread is
/// detached; it lives until the process exits, which is what the tests
/// want.
pub fn spawn_inprocess(config: ServerConfig) -> InProcessServer {
    let state = Arc::new(ServerState::new(config));
    let app = router(state.clone());
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("server runtime");
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind localhost");
            tx.send(listener.local_addr().expect("local addr")).ok();
            axum::serve(listener, app).await.expect("serve");
        });
    });
    let addr = rx.recv().expect("server never reported its address");
    InProcessServer { addr, state }
}
