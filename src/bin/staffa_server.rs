use std::env;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use staffa::broker::Broker;
use staffa::config::BrokerConfig;

// Serves the line protocol over plain TCP; a TLS terminator in front of the
// listener is expected to own the handshake in any real deployment.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    let address = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = match args.get(2) {
        Some(raw) => raw.parse()?,
        None => 4433,
    };

    let config = BrokerConfig {
        live_prices: env::var("STAFFA_LIVE_PRICES").is_ok(),
        log_prices: true,
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config)?;
    broker.start();

    let listener = TcpListener::bind((address.as_str(), port)).await?;
    log::info!("staffa broker listening on {address}:{port}");

    tokio::select! {
        served = Arc::clone(&broker).serve(listener) => served?,
        _ = tokio::signal::ctrl_c() => log::info!("interrupt received"),
    }

    broker.shutdown().await;
    Ok(())
}
