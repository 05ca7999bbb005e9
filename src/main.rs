use std::net::SocketAddr;

use carona::relay::{self, Relay};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = std::env::var("RELAY_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:4050".into())
        .parse()
        .unwrap();

    relay::serve(Relay::new(), addr).await.unwrap();
}
