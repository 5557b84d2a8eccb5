//! Scripted in-memory GATT link for exercising the session state machine.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use btleplug::api::{CharPropFlags, Characteristic, ValueNotification, WriteType};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::device::{DeviceModel, DeviceSpec};
use crate::link::{GattLink, NotificationStream};
use crate::session::WalletSession;
use futures::StreamExt;

pub(crate) type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// The single probe frame the session writes to negotiate the MTU.
pub(crate) const MTU_PROBE: [u8; 8] = [0x05, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00];
/// A probe response declaring an MTU of 0x99 = 153 bytes.
pub(crate) const MTU_RESPONSE: [u8; 11] = [
    0x05, 0x00, 0x00, 0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x99,
];

struct MockInner {
    notify_uuid: Uuid,
    notify: broadcast::Sender<ValueNotification>,
    writes: StdMutex<Vec<Vec<u8>>>,
    responder: StdMutex<Option<Responder>>,
    fail_writes: AtomicBool,
    disconnected: AtomicBool,
}

/// Notifications fan out over a broadcast channel the way a real stack fans
/// them out to its subscribers; a write triggers whatever frames the scripted
/// responder returns for it.
#[derive(Clone)]
pub(crate) struct MockLink(Arc<MockInner>);

impl MockLink {
    pub fn new(notify_uuid: Uuid) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self(Arc::new(MockInner {
            notify_uuid,
            notify,
            writes: StdMutex::new(Vec::new()),
            responder: StdMutex::new(None),
            fail_writes: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }))
    }

    pub fn respond_with(&self, responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static) {
        *self.0.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn notify_frames(&self, frames: &[Vec<u8>]) {
        for frame in frames {
            let _ = self.0.notify.send(ValueNotification {
                uuid: self.0.notify_uuid,
                value: frame.clone(),
            });
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0.writes.lock().unwrap().clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.0.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.0.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GattLink for MockLink {
    async fn write(
        &self,
        _characteristic: &Characteristic,
        payload: &[u8],
        _write_type: WriteType,
    ) -> Result<(), btleplug::Error> {
        if self.0.fail_writes.load(Ordering::SeqCst) {
            return Err(btleplug::Error::NotConnected);
        }
        self.0.writes.lock().unwrap().push(payload.to_vec());
        let frames = self
            .0
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .map(|responder| responder(payload))
            .unwrap_or_default();
        self.notify_frames(&frames);
        Ok(())
    }

    async fn subscribe(&self, _characteristic: &Characteristic) -> Result<(), btleplug::Error> {
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, btleplug::Error> {
        let rx = self.0.notify.subscribe();
        Ok(Box::pin(
            BroadcastStream::new(rx).filter_map(|item| futures::future::ready(item.ok())),
        ))
    }

    async fn disconnect(&self) -> Result<(), btleplug::Error> {
        self.0.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, btleplug::Error> {
        Ok(!self.0.disconnected.load(Ordering::SeqCst))
    }
}

pub(crate) fn endpoints() -> (Characteristic, Characteristic) {
    let spec = DeviceSpec::for_model(DeviceModel::NanoX);
    let notify = Characteristic {
        uuid: spec.notify_uuid,
        service_uuid: spec.service_uuid,
        properties: CharPropFlags::NOTIFY,
        descriptors: BTreeSet::new(),
    };
    let write = Characteristic {
        uuid: spec.write_uuid,
        service_uuid: spec.service_uuid,
        properties: CharPropFlags::WRITE,
        descriptors: BTreeSet::new(),
    };
    (notify, write)
}

/// A session over a fresh mock link, MTU already negotiated to 153.
pub(crate) async fn established_session() -> (MockLink, Arc<WalletSession<MockLink>>) {
    let (notify, write) = endpoints();
    let link = MockLink::new(notify.uuid);
    link.respond_with(|payload| {
        if payload == MTU_PROBE {
            vec![MTU_RESPONSE.to_vec()]
        } else {
            vec![]
        }
    });
    let session = WalletSession::establish(link.clone(), DeviceModel::NanoX, notify, write, false)
        .await
        .expect("mock session establishes");
    (link, Arc::new(session))
}
