use std::time::Duration;

use anyhow::Result;
use wallet_ble::{BleTransport, TransportConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let transport = BleTransport::create(TransportConfig::default(), Duration::from_secs(30)).await?;
    let wallet = transport.connected_wallet().await.expect("just connected");
    println!("connected to {}", wallet);

    let info = transport.app_and_version().await?;
    println!("running app: {} {}", info.name, info.version);

    transport.disconnect().await?;
    Ok(())
}
