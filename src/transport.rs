//! The public transport handle tying scanner, connection and session together.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, CentralState, Manager as _};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use crate::apdu::Apdu;
use crate::connection::ConnectionHelper;
use crate::device::{DeviceSpec, TransportConfig};
use crate::error::TransportError;
use crate::scanner::{DiscoveredDevice, PeripheralIdentifier, ScanItem, WalletScanner};
use crate::session::commands::AppInfo;
use crate::session::WalletSession;

/// How long connect-by-identifier keeps scanning for a wallet that is not in
/// the current discovery cache.
const CONNECT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Availability of the BLE stack underneath the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AdapterStatus {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Resetting,
    Unknown,
}

impl AdapterStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AdapterStatus::PoweredOn)
    }
}

impl From<CentralState> for AdapterStatus {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => AdapterStatus::PoweredOn,
            CentralState::PoweredOff => AdapterStatus::PoweredOff,
            CentralState::Unknown => AdapterStatus::Unknown,
        }
    }
}

type DisconnectHandler = Box<dyn FnOnce(PeripheralIdentifier) + Send>;

#[derive(Clone)]
struct ActiveSession {
    session: Arc<WalletSession<Peripheral>>,
    device: DiscoveredDevice,
}

/// An explicit handle to one wallet transport.
///
/// Cheap to clone; all clones share the same adapter, discovery cache and
/// session. Every awaitable operation here is the primary implementation; the
/// `*_with_callback` forms spawn it and route the terminal value.
#[derive(Clone)]
pub struct BleTransport {
    adapter: Adapter,
    config: TransportConfig,
    scanner: WalletScanner,
    active: Arc<RwLock<Option<ActiveSession>>>,
    disconnect_handlers: Arc<StdMutex<Vec<DisconnectHandler>>>,
}

impl BleTransport {
    /// Build a transport over the first Bluetooth adapter on the system.
    pub async fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|_| TransportError::BluetoothNotAvailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| TransportError::BluetoothNotAvailable)?
            .into_iter()
            .next()
            .ok_or(TransportError::BluetoothNotAvailable)?;

        let scanner = WalletScanner::new(adapter.clone(), config.clone());
        Ok(Self {
            adapter,
            config,
            scanner,
            active: Arc::new(RwLock::new(None)),
            disconnect_handlers: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    /// Scan and connect to the first wallet discovered.
    pub async fn create(
        config: TransportConfig,
        scan_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let transport = Self::new(config).await?;
        let device = transport.scanner.wait_for_any(scan_timeout).await?;
        transport.connect_device(device).await?;
        Ok(transport)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Start a scan. Each received item is the deduplicated device list after
    /// a change; the stream closes when the window elapses or the scan stops.
    pub async fn scan(&self, timeout: Duration) -> Result<mpsc::Receiver<ScanItem>, TransportError> {
        self.ensure_available().await?;
        self.scanner.start(timeout).await
    }

    /// [`BleTransport::scan`] as a `futures::Stream`.
    pub async fn scan_stream(
        &self,
        timeout: Duration,
    ) -> Result<impl futures::Stream<Item = ScanItem>, TransportError> {
        Ok(ReceiverStream::new(self.scan(timeout).await?))
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop().await;
    }

    /// Wallets seen by the most recent scan, oldest first.
    pub async fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.scanner.devices().await
    }

    /// Connect to a previously discovered wallet. If it is not in the
    /// discovery cache a fresh scan looks for it first.
    pub async fn connect(&self, identifier: &PeripheralIdentifier) -> Result<(), TransportError> {
        self.ensure_available().await?;
        self.ensure_idle().await?;

        let cached = self
            .scanner
            .devices()
            .await
            .into_iter()
            .find(|device| device.identifier == *identifier);
        let device = match cached {
            Some(device) => device,
            None => {
                self.scanner
                    .wait_for_identifier(identifier, CONNECT_SCAN_TIMEOUT)
                    .await?
            }
        };
        self.connect_device(device).await
    }

    /// Scan for a wallet advertising exactly `name` and connect to it.
    /// Ambiguity resolves to the wallet seen first.
    pub async fn connect_by_name(
        &self,
        name: &str,
        scan_timeout: Duration,
    ) -> Result<PeripheralIdentifier, TransportError> {
        self.ensure_available().await?;
        self.ensure_idle().await?;

        let device = self.scanner.wait_for_name(name, scan_timeout).await?;
        let identifier = device.identifier.clone();
        self.connect_device(device).await?;
        Ok(identifier)
    }

    /// The wallet this transport is currently connected to.
    pub async fn connected_wallet(&self) -> Option<PeripheralIdentifier> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|active| active.device.identifier.clone())
    }

    /// One APDU out, one reassembled response back (status word included).
    pub async fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError> {
        self.current_session().await?.exchange(apdu).await
    }

    /// Write an APDU without waiting for a response.
    pub async fn send(&self, apdu: &Apdu) -> Result<(), TransportError> {
        self.current_session().await?.send(apdu).await
    }

    /// Disconnect from the wallet. If an exchange is in flight the teardown
    /// waits for it to resolve first.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let active = self.active.write().await.take();
        match active {
            Some(active) => {
                tracing::info!(wallet = %active.device.identifier, "disconnecting");
                active.session.close().await;
                Ok(())
            }
            None => Err(TransportError::CurrentConnectedError(
                "no wallet connected".to_owned(),
            )),
        }
    }

    /// Ask the device which app is running and at which version.
    pub async fn app_and_version(&self) -> Result<AppInfo, TransportError> {
        self.current_session().await?.app_and_version().await
    }

    /// Make sure `name` is the running app, launching it if necessary.
    pub async fn open_app_if_needed(&self, name: &str) -> Result<(), TransportError> {
        self.current_session().await?.open_app_if_needed(name).await
    }

    /// Return the device to its launcher.
    pub async fn quit_app(&self) -> Result<(), TransportError> {
        self.current_session().await?.quit_app().await
    }

    /// Snapshot of the stack's availability.
    pub async fn adapter_status(&self) -> Result<AdapterStatus, TransportError> {
        self.adapter
            .adapter_state()
            .await
            .map(Into::into)
            .map_err(|e| TransportError::LowerLevelError(e.to_string()))
    }

    /// Stream of stack availability transitions.
    pub async fn availability_updates(
        &self,
    ) -> Result<mpsc::Receiver<AdapterStatus>, TransportError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::LowerLevelError(e.to_string()))?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::StateUpdate(state) = event {
                    if tx.send(AdapterStatus::from(state)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Invoke `handler` on every stack availability transition.
    pub async fn on_availability_change(
        &self,
        handler: impl Fn(AdapterStatus) + Send + 'static,
    ) -> Result<(), TransportError> {
        let mut updates = self.availability_updates().await?;
        tokio::spawn(async move {
            while let Some(status) = updates.recv().await {
                handler(status);
            }
        });
        Ok(())
    }

    /// Register a one-shot handler for an unexpected disconnection. Handlers
    /// run once, in registration order, and are cleared afterwards.
    pub fn on_disconnect(&self, handler: impl FnOnce(PeripheralIdentifier) + Send + 'static) {
        self.disconnect_handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Callback form of [`BleTransport::exchange`].
    pub fn exchange_with_callback(
        &self,
        apdu: Apdu,
        callback: impl FnOnce(Result<Vec<u8>, TransportError>) + Send + 'static,
    ) {
        let transport = self.clone();
        tokio::spawn(async move { callback(transport.exchange(&apdu).await) });
    }

    /// Callback form of [`BleTransport::connect`].
    pub fn connect_with_callback(
        &self,
        identifier: PeripheralIdentifier,
        callback: impl FnOnce(Result<(), TransportError>) + Send + 'static,
    ) {
        let transport = self.clone();
        tokio::spawn(async move { callback(transport.connect(&identifier).await) });
    }

    /// Callback form of [`BleTransport::disconnect`].
    pub fn disconnect_with_callback(
        &self,
        callback: impl FnOnce(Result<(), TransportError>) + Send + 'static,
    ) {
        let transport = self.clone();
        tokio::spawn(async move { callback(transport.disconnect().await) });
    }

    async fn current_session(&self) -> Result<Arc<WalletSession<Peripheral>>, TransportError> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|active| active.session.clone())
            .ok_or_else(|| TransportError::CurrentConnectedError("no wallet connected".to_owned()))
    }

    async fn ensure_idle(&self) -> Result<(), TransportError> {
        if self.active.read().await.is_some() {
            return Err(TransportError::ConnectError(
                "a wallet is already connected".to_owned(),
            ));
        }
        Ok(())
    }

    async fn ensure_available(&self) -> Result<(), TransportError> {
        match self.adapter.adapter_state().await {
            // Backends that cannot report a state get the benefit of the
            // doubt; the operation itself will surface any real failure.
            Ok(CentralState::PoweredOn) | Err(_) => Ok(()),
            Ok(_) => Err(TransportError::BluetoothNotAvailable),
        }
    }

    /// Connect, discover, subscribe and negotiate against one discovered
    /// wallet, then install the session and its disconnect monitor.
    async fn connect_device(&self, device: DiscoveredDevice) -> Result<(), TransportError> {
        // A connect supersedes any running scan.
        self.scanner.stop().await;

        tracing::info!(wallet = %device.identifier, model = %device.model, "connecting");
        let peripheral = self.scanner.peripheral(&device).await?;
        let helper = ConnectionHelper::new(&peripheral);
        helper.connect().await?;

        let spec = DeviceSpec::for_model(device.model);
        let endpoints = match helper.discover(spec).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                helper.disconnect().await;
                return Err(e);
            }
        };

        let session = match WalletSession::establish(
            peripheral.clone(),
            device.model,
            endpoints.notify,
            endpoints.write,
            endpoints.can_write_without_response,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                helper.disconnect().await;
                return Err(e);
            }
        };

        self.spawn_disconnect_monitor(&device, Arc::downgrade(&session))
            .await?;
        *self.active.write().await = Some(ActiveSession { session, device });
        Ok(())
    }

    /// Watch the adapter for this peripheral vanishing. Holds only a weak
    /// session reference so teardown never waits on the monitor.
    async fn spawn_disconnect_monitor(
        &self,
        device: &DiscoveredDevice,
        session: Weak<WalletSession<Peripheral>>,
    ) -> Result<(), TransportError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::LowerLevelError(e.to_string()))?;
        let target = device.id.clone();
        let identifier = device.identifier.clone();
        let active = self.active.clone();
        let handlers = self.disconnect_handlers.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDisconnected(id) => id,
                    _ => continue,
                };
                if id != target {
                    continue;
                }

                // A session closed through disconnect() set its flag before
                // the stack reported the drop; anything else is unexpected.
                let was_expected = match session.upgrade() {
                    Some(session) => {
                        let was_closed = session.is_closed();
                        session.mark_closed();
                        was_closed
                    }
                    None => true,
                };

                let mut slot = active.write().await;
                if slot.as_ref().map(|a| a.device.id == target).unwrap_or(false) {
                    *slot = None;
                }
                drop(slot);

                if !was_expected {
                    tracing::warn!(wallet = %identifier, "wallet disconnected unexpectedly");
                    let drained: Vec<DisconnectHandler> = {
                        let mut handlers = handlers.lock().unwrap();
                        handlers.drain(..).collect()
                    };
                    for handler in drained {
                        handler(identifier.clone());
                    }
                }
                break;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_status_mapping() {
        assert_eq!(AdapterStatus::from(CentralState::PoweredOn), AdapterStatus::PoweredOn);
        assert_eq!(AdapterStatus::from(CentralState::PoweredOff), AdapterStatus::PoweredOff);
        assert_eq!(AdapterStatus::from(CentralState::Unknown), AdapterStatus::Unknown);
        assert!(AdapterStatus::PoweredOn.is_available());
        assert!(!AdapterStatus::Resetting.is_available());
    }
}
