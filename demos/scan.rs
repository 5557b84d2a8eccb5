use std::time::Duration;

use anyhow::Result;
use wallet_ble::{BleTransport, TransportConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let transport = BleTransport::new(TransportConfig::default()).await?;
    let mut scan = transport.scan(Duration::from_secs(10)).await?;

    while let Some(item) = scan.recv().await {
        let wallets = item?;
        println!("-- {} wallet(s) in range", wallets.len());
        for wallet in wallets {
            println!("   {} [{}] rssi {:?}", wallet.identifier, wallet.model, wallet.rssi);
        }
    }

    Ok(())
}
