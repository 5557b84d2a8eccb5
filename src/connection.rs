use std::time::Duration;

use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use tokio::time;

use crate::device::DeviceSpec;
use crate::error::TransportError;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The GATT endpoints a wallet session talks through.
pub(crate) struct GattEndpoints {
    pub notify: Characteristic,
    pub write: Characteristic,
    pub can_write_without_response: bool,
}

/// Establishes and tears down the GATT link for one peripheral.
pub(crate) struct ConnectionHelper {
    device: Peripheral,
}

impl ConnectionHelper {
    pub fn new(device: &Peripheral) -> Self {
        Self {
            device: device.clone(),
        }
    }

    /// Connect with a few retries. Some stacks report success before the link
    /// is usable, so each attempt re-checks `is_connected`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            if self
                .device
                .is_connected()
                .await
                .map_err(|e| TransportError::ConnectError(format!("connection state unknown: {}", e)))?
            {
                tracing::debug!("connected to device");
                return Ok(());
            }

            match time::timeout(CONNECT_TIMEOUT, self.device.connect()).await {
                Ok(Ok(())) => {
                    if self.device.is_connected().await.unwrap_or(false) {
                        tracing::debug!("connected to device");
                        return Ok(());
                    }
                    last_error = "connect call succeeded but device is not connected".to_owned();
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no connection after {:?}", CONNECT_TIMEOUT),
            }

            tracing::debug!(attempt, "retrying connection: {}", last_error);
            time::sleep(Duration::from_millis(500)).await;
        }

        Err(TransportError::ConnectError(format!(
            "gatt connect failed: {}",
            last_error
        )))
    }

    /// Discover the wallet service and resolve its three characteristics.
    pub async fn discover(&self, spec: &DeviceSpec) -> Result<GattEndpoints, TransportError> {
        time::timeout(DISCOVERY_TIMEOUT, self.device.discover_services())
            .await
            .map_err(|_| TransportError::ConnectError("service discovery timed out".to_owned()))?
            .map_err(|e| TransportError::ConnectError(format!("service discovery failed: {}", e)))?;

        let characteristics: Vec<Characteristic> = self
            .device
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == spec.service_uuid)
            .collect();
        if characteristics.is_empty() {
            return Err(TransportError::ConnectError(format!(
                "wallet service {} not present on peripheral",
                spec.service_uuid
            )));
        }

        let notify = characteristics
            .iter()
            .find(|c| c.uuid == spec.notify_uuid)
            .cloned()
            .ok_or_else(|| {
                TransportError::ConnectError("notify characteristic missing".to_owned())
            })?;

        // Prefer the command characteristic when the peripheral really exposes
        // it with the without-response capability.
        let write_cmd = characteristics.iter().find(|c| {
            c.uuid == spec.write_cmd_uuid
                && c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        });
        let (write, can_write_without_response) = match write_cmd {
            Some(c) => (c.clone(), true),
            None => (
                characteristics
                    .iter()
                    .find(|c| c.uuid == spec.write_uuid)
                    .cloned()
                    .ok_or_else(|| {
                        TransportError::ConnectError("write characteristic missing".to_owned())
                    })?,
                false,
            ),
        };

        tracing::debug!(
            notify = %notify.uuid,
            write = %write.uuid,
            can_write_without_response,
            "resolved wallet characteristics"
        );

        Ok(GattEndpoints {
            notify,
            write,
            can_write_without_response,
        })
    }

    pub async fn disconnect(&self) {
        match self.device.is_connected().await {
            Ok(false) => {
                tracing::debug!("already disconnected");
            }
            _ => {
                if let Err(e) = self.device.disconnect().await {
                    tracing::warn!("could not disconnect: {}", e);
                } else {
                    tracing::debug!("disconnected from device");
                }
            }
        }
    }
}
