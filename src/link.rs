//! The GATT operations the exchange engine needs from a connected peripheral.
//!
//! `btleplug`'s `Peripheral` is the production implementation; the trait exists
//! so the session state machine can be driven by a scripted in-memory link in
//! tests.

use std::pin::Pin;

use async_trait::async_trait;
use btleplug::api::{Characteristic, ValueNotification, WriteType};
use futures::Stream;

pub type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        write_type: WriteType,
    ) -> Result<(), btleplug::Error>;

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), btleplug::Error>;

    async fn notifications(&self) -> Result<NotificationStream, btleplug::Error>;

    async fn disconnect(&self) -> Result<(), btleplug::Error>;

    async fn is_connected(&self) -> Result<bool, btleplug::Error>;
}

#[async_trait]
impl GattLink for btleplug::platform::Peripheral {
    async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        write_type: WriteType,
    ) -> Result<(), btleplug::Error> {
        btleplug::api::Peripheral::write(self, characteristic, payload, write_type).await
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), btleplug::Error> {
        btleplug::api::Peripheral::subscribe(self, characteristic).await
    }

    async fn notifications(&self) -> Result<NotificationStream, btleplug::Error> {
        btleplug::api::Peripheral::notifications(self).await
    }

    async fn disconnect(&self) -> Result<(), btleplug::Error> {
        btleplug::api::Peripheral::disconnect(self).await
    }

    async fn is_connected(&self) -> Result<bool, btleplug::Error> {
        btleplug::api::Peripheral::is_connected(self).await
    }
}
