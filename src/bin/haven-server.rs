//! haven-server: emergency session orchestrator over HTTP + WebSocket.

#[tokio::main]
async fn main() {
    if let Err(error) = haven::server::run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
