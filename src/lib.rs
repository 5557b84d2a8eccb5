//! BLE transport for NanoX/Stax-family hardware wallets.
//!
//! Exchanges APDUs with a wallet over the GATT service it advertises: scan,
//! connect, subscribe, negotiate the frame size, then run single-in-flight
//! write/notify exchanges. See [`BleTransport`] for the entry point.

pub mod apdu;
mod connection;
pub mod device;
pub mod error;
pub mod hexutil;
pub mod link;
pub mod scanner;
pub mod session;
pub mod shared;
pub mod transport;

pub use apdu::{Apdu, StatusWord};
pub use device::{DeviceModel, TransportConfig};
pub use error::{StatusError, TransportError};
pub use scanner::{DiscoveredDevice, PeripheralIdentifier};
pub use session::commands::AppInfo;
pub use transport::{AdapterStatus, BleTransport};
