use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{BDAddr, Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::device::{DeviceModel, DeviceSpec, TransportConfig};
use crate::error::TransportError;

/// Display name used when an advertisement carries no local name.
pub const UNKNOWN_PERIPHERAL_NAME: &str = "(peripheral name unknown)";

type Devices = Arc<RwLock<HashMap<PeripheralId, DiscoveredDevice>>>;

/// One item on the scan stream: the full deduplicated device list after a
/// change, or the terminal scan error.
pub type ScanItem = Result<Vec<DiscoveredDevice>, TransportError>;

/// Stable identity of a peripheral plus its advertised display name.
///
/// The name is advertisement metadata and may change between sightings, so
/// equality and hashing consider the address only.
#[derive(Clone, Debug, Serialize)]
pub struct PeripheralIdentifier {
    pub address: BDAddr,
    pub name: String,
}

impl PeripheralIdentifier {
    pub fn new(address: BDAddr, name: Option<String>) -> Self {
        Self {
            address,
            name: name.unwrap_or_else(|| UNKNOWN_PERIPHERAL_NAME.to_owned()),
        }
    }
}

impl PartialEq for PeripheralIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeripheralIdentifier {}

impl std::hash::Hash for PeripheralIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for PeripheralIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// A wallet seen during a scan.
#[derive(Clone, Debug)]
pub struct DiscoveredDevice {
    /// Stack handle used to resolve the peripheral again at connect time.
    pub id: PeripheralId,
    pub identifier: PeripheralIdentifier,
    pub model: DeviceModel,
    pub rssi: Option<i16>,
    pub discovered_at: DateTime<Utc>,
}

/// Scans for peripherals advertising one of the configured wallet services and
/// keeps a deduplicated view of everything seen so far.
#[derive(Clone)]
pub struct WalletScanner {
    central: Adapter,
    config: TransportConfig,
    devices: Devices,
    // Cancel token of the scan currently running, if any. Per-scan so a stop
    // issued while no scan runs cannot leak into the next one.
    cancel: Arc<std::sync::Mutex<Option<Arc<Notify>>>>,
}

impl WalletScanner {
    pub fn new(central: Adapter, config: TransportConfig) -> Self {
        Self {
            central,
            config,
            devices: Arc::new(RwLock::new(HashMap::new())),
            cancel: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Start scanning. The receiver gets the full device list every time it
    /// changes (new wallet, RSSI refresh, name refresh). The scan ends on
    /// [`WalletScanner::stop`], on `timeout`, or when the receiver is dropped;
    /// a timeout with nothing discovered puts `ScanTimedOut` on the stream.
    pub async fn start(&self, timeout: Duration) -> Result<mpsc::Receiver<ScanItem>, TransportError> {
        self.devices.write().await.clear();

        let filter = ScanFilter {
            services: self.config.service_uuids(),
        };
        self.central
            .start_scan(filter)
            .await
            .map_err(|e| TransportError::ScanError(e.to_string()))?;
        let events = self
            .central
            .events()
            .await
            .map_err(|e| TransportError::ScanError(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<ScanItem>(32);
        tracing::debug!(?timeout, "scanning for wallets");

        let cancel = Arc::new(Notify::new());
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let processor = ScanEventsProcessor {
            central: self.central.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
            cancel,
            tx,
        };
        tokio::spawn(async move {
            processor.run(events, timeout).await;
        });

        Ok(rx)
    }

    /// Stop an in-progress scan.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            // A permit, not a wakeup: the processor may be between polls.
            cancel.notify_one();
        }
        let _ = self.central.stop_scan().await;
    }

    /// Everything discovered so far, oldest sighting first.
    pub async fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut list: Vec<DiscoveredDevice> = self.devices.read().await.values().cloned().collect();
        list.sort_by_key(|device| device.discovered_at);
        list
    }

    /// Resolve a discovered wallet back to its peripheral handle.
    pub async fn peripheral(&self, device: &DiscoveredDevice) -> Result<Peripheral, TransportError> {
        self.central
            .peripheral(&device.id)
            .await
            .map_err(|e| TransportError::ConnectError(format!("peripheral not known to adapter: {}", e)))
    }

    /// Scan until the wallet with this identity shows up.
    pub async fn wait_for_identifier(
        &self,
        identifier: &PeripheralIdentifier,
        timeout: Duration,
    ) -> Result<DiscoveredDevice, TransportError> {
        self.wait_for(timeout, |device| device.identifier == *identifier).await
    }

    /// Scan until a wallet advertising exactly `name` shows up. Ambiguity is
    /// resolved first-seen.
    pub async fn wait_for_name(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<DiscoveredDevice, TransportError> {
        self.wait_for(timeout, |device| device.identifier.name == name).await
    }

    /// Scan until any configured wallet shows up.
    pub async fn wait_for_any(&self, timeout: Duration) -> Result<DiscoveredDevice, TransportError> {
        self.wait_for(timeout, |_| true).await
    }

    async fn wait_for(
        &self,
        timeout: Duration,
        matches: impl Fn(&DiscoveredDevice) -> bool,
    ) -> Result<DiscoveredDevice, TransportError> {
        let mut rx = self.start(timeout).await?;
        while let Some(item) = rx.recv().await {
            let snapshot = item?;
            if let Some(found) = snapshot.into_iter().find(&matches) {
                tracing::info!(wallet = %found.identifier, model = %found.model, "found wallet");
                self.stop().await;
                return Ok(found);
            }
        }
        Err(TransportError::ScanTimedOut)
    }
}

struct ScanEventsProcessor {
    central: Adapter,
    config: TransportConfig,
    devices: Devices,
    cancel: Arc<Notify>,
    tx: mpsc::Sender<ScanItem>,
}

impl ScanEventsProcessor {
    async fn run(
        self,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        timeout: Duration,
    ) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if self.devices.read().await.is_empty() {
                        let _ = self.tx.send(Err(TransportError::ScanTimedOut)).await;
                    }
                    tracing::debug!("scan window elapsed");
                    break;
                }
                _ = self.cancel.notified() => break,
                event = events.next() => {
                    match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id)) => {
                            if self.refresh(&id).await {
                                let mut snapshot: Vec<DiscoveredDevice> =
                                    self.devices.read().await.values().cloned().collect();
                                snapshot.sort_by_key(|device| device.discovered_at);
                                if self.tx.send(Ok(snapshot)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        let _ = self.central.stop_scan().await;
    }

    /// Update the device map from the latest advertisement. Returns whether
    /// anything the caller can observe actually changed.
    async fn refresh(&self, id: &PeripheralId) -> bool {
        let peripheral = match self.central.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                tracing::debug!(?id, "could not resolve peripheral: {}", e);
                return false;
            }
        };
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            Ok(None) => return false,
            Err(e) => {
                tracing::debug!(?id, "could not read properties: {}", e);
                return false;
            }
        };

        let spec = props
            .services
            .iter()
            .chain(props.service_data.keys())
            .find_map(|uuid| self.config.match_service(uuid));
        let spec: &DeviceSpec = match spec {
            Some(spec) => spec,
            None => return false,
        };

        let identifier = PeripheralIdentifier::new(props.address, props.local_name);
        let mut devices = self.devices.write().await;
        match devices.get_mut(id) {
            Some(existing) => {
                let changed = existing.identifier.name != identifier.name || existing.rssi != props.rssi;
                existing.identifier = identifier;
                existing.rssi = props.rssi;
                changed
            }
            None => {
                tracing::debug!(wallet = %identifier, model = %spec.model, "discovered wallet");
                devices.insert(
                    id.clone(),
                    DiscoveredDevice {
                        id: id.clone(),
                        identifier,
                        model: spec.model,
                        rssi: props.rssi,
                        discovered_at: Utc::now(),
                    },
                );
                true
            }
        }
    }
}
