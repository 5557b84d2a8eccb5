//! The connected-wallet session: MTU negotiation and the APDU exchange engine.

pub mod commands;
#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use btleplug::api::{Characteristic, WriteType};
use futures::stream::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::time;

use crate::apdu::{Apdu, Dechunker, FRAME_TAG};
use crate::device::DeviceModel;
use crate::error::TransportError;
use crate::hexutil;
use crate::link::GattLink;

/// Smallest frame size a wallet may negotiate.
pub const MIN_MTU: usize = 20;
/// Largest frame size a wallet may negotiate.
pub const MAX_MTU: usize = 512;

const MTU_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reject MTU values outside the protocol range.
pub fn validate_mtu(value: usize) -> Result<usize, TransportError> {
    if (MIN_MTU..=MAX_MTU).contains(&value) {
        Ok(value)
    } else {
        Err(TransportError::PairingError(format!(
            "negotiated mtu {} outside [{}, {}]",
            value, MIN_MTU, MAX_MTU
        )))
    }
}

/// A live session with one wallet.
///
/// At most one exchange runs at a time: the busy slot is a `try_lock`ed mutex
/// whose guard is released on every exit path, including cancellation of the
/// exchange future. [`WalletSession::close`] takes the same slot, which is
/// what defers an explicit disconnect until the in-flight exchange resolves.
pub struct WalletSession<L: GattLink> {
    link: L,
    model: DeviceModel,
    notify: Characteristic,
    write: Characteristic,
    write_type: WriteType,
    mtu: usize,
    busy: Mutex<()>,
    closed: watch::Sender<bool>,
}

impl<L: GattLink> WalletSession<L> {
    /// Subscribe to the notify characteristic and negotiate the frame size.
    /// The session is usable once this returns.
    pub(crate) async fn establish(
        link: L,
        model: DeviceModel,
        notify: Characteristic,
        write: Characteristic,
        can_write_without_response: bool,
    ) -> Result<Self, TransportError> {
        link.subscribe(&notify)
            .await
            .map_err(|e| TransportError::ListenError(e.to_string()))?;

        let write_type = if can_write_without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        let mut session = Self {
            link,
            model,
            notify,
            write,
            write_type,
            mtu: MIN_MTU,
            busy: Mutex::new(()),
            closed: watch::channel(false).0,
        };
        session.mtu = session.negotiate_mtu().await?;
        tracing::info!(model = %session.model, mtu = session.mtu, "wallet session established");
        Ok(session)
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    /// The frame size negotiated with the device; fixed for the session.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// One request/response cycle. Returns the reassembled response payload
    /// including its trailing two-byte status word.
    pub async fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError> {
        let _busy = self
            .busy
            .try_lock()
            .map_err(|_| TransportError::PendingActionOnDevice)?;

        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::LowerLevelError(
                "session is closed".to_owned(),
            ));
        }

        // Subscribe to notifications before writing so a fast response cannot
        // slip past; frames arriving outside an exchange have no stream to
        // land on and are discarded.
        let mut frames = self
            .link
            .notifications()
            .await
            .map_err(|e| TransportError::ListenError(e.to_string()))?;

        self.write_apdu(apdu).await?;

        let mut dechunker = Dechunker::new();
        loop {
            tokio::select! {
                maybe = frames.next() => {
                    let notification = maybe.ok_or_else(|| {
                        TransportError::LowerLevelError("notification stream ended".to_owned())
                    })?;
                    if notification.uuid != self.notify.uuid {
                        continue;
                    }
                    tracing::trace!(rx = %hexutil::to_hex(&notification.value));
                    if let Some(payload) = dechunker
                        .push(&notification.value)
                        .map_err(|e| TransportError::ReadError(e.to_string()))?
                    {
                        return Ok(payload);
                    }
                }
                _ = closed.changed() => {
                    return Err(TransportError::LowerLevelError(
                        "device disconnected during exchange".to_owned(),
                    ));
                }
            }
        }
    }

    /// Write an APDU without waiting for a response.
    pub async fn send(&self, apdu: &Apdu) -> Result<(), TransportError> {
        let _busy = self
            .busy
            .try_lock()
            .map_err(|_| TransportError::PendingActionOnDevice)?;
        if self.is_closed() {
            return Err(TransportError::LowerLevelError(
                "session is closed".to_owned(),
            ));
        }
        self.write_apdu(apdu).await
    }

    /// Tear the session down. Waits for an in-flight exchange to resolve
    /// before touching the link, then disconnects.
    pub async fn close(&self) {
        let _busy = self.busy.lock().await;
        self.closed.send_replace(true);
        if let Err(e) = self.link.disconnect().await {
            tracing::warn!("gatt teardown failed: {}", e);
        }
    }

    /// Record that the peripheral vanished underneath us. Any in-flight
    /// exchange unblocks with `LowerLevelError`.
    pub(crate) fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    /// Chunk and write one APDU, each frame acknowledged before the next.
    async fn write_apdu(&self, apdu: &Apdu) -> Result<(), TransportError> {
        for (index, frame) in apdu.frames(self.mtu).iter().enumerate() {
            tracing::trace!(frame = index, tx = %hexutil::to_hex(frame));
            self.link
                .write(&self.write, frame, self.write_type)
                .await
                .map_err(|e| TransportError::WriteError(e.to_string()))?;
        }
        Ok(())
    }

    /// Probe the device for its frame size: a single headerless-length frame
    /// out, one notify frame back carrying the probe echo plus the MTU byte.
    async fn negotiate_mtu(&self) -> Result<usize, TransportError> {
        let mut frames = self
            .link
            .notifications()
            .await
            .map_err(|e| TransportError::PairingError(e.to_string()))?;

        let probe = Apdu::infer_mtu();
        for frame in probe.frames(MIN_MTU) {
            self.link
                .write(&self.write, &frame, self.write_type)
                .await
                .map_err(|e| TransportError::PairingError(format!("mtu probe write failed: {}", e)))?;
        }

        let response = time::timeout(MTU_EXCHANGE_TIMEOUT, async {
            while let Some(notification) = frames.next().await {
                if notification.uuid == self.notify.uuid {
                    return Some(notification.value);
                }
            }
            None
        })
        .await
        .map_err(|_| TransportError::PairingError("no response to mtu probe".to_owned()))?
        .ok_or_else(|| TransportError::PairingError("notification stream ended".to_owned()))?;

        parse_mtu_response(&response)
    }
}

/// The MTU response echoes the probe inside a first-frame header: five header
/// bytes, five echo bytes, then the MTU itself.
fn parse_mtu_response(frame: &[u8]) -> Result<usize, TransportError> {
    if frame.first() != Some(&FRAME_TAG) {
        return Err(TransportError::PairingError(format!(
            "unexpected mtu response tag: {:?}",
            frame.first()
        )));
    }
    if frame.len() < 11 {
        return Err(TransportError::PairingError(format!(
            "mtu response too short: {} bytes",
            frame.len()
        )));
    }
    validate_mtu(frame[10] as usize)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::mock::{established_session, MTU_PROBE, MTU_RESPONSE};
    use super::*;

    #[test]
    fn mtu_range_is_enforced() {
        assert!(validate_mtu(20).is_ok());
        assert!(validate_mtu(512).is_ok());
        assert!(matches!(validate_mtu(19), Err(TransportError::PairingError(_))));
        assert!(matches!(validate_mtu(513), Err(TransportError::PairingError(_))));
    }

    #[test]
    fn mtu_response_parsing() {
        assert_eq!(parse_mtu_response(&MTU_RESPONSE).unwrap(), 0x99);
        assert!(matches!(
            parse_mtu_response(&hex!("08 0000 0001 99")),
            Err(TransportError::PairingError(_))
        ));
        assert!(matches!(
            parse_mtu_response(&hex!("05 0000 0005 08")),
            Err(TransportError::PairingError(_))
        ));
        // In-range tag and length but a frame size below the floor.
        assert!(matches!(
            parse_mtu_response(&hex!("05 0000 0005 08 00 00 00 00 13")),
            Err(TransportError::PairingError(_))
        ));
    }

    #[tokio::test]
    async fn negotiates_mtu_from_probe_response() {
        let (link, session) = established_session().await;
        assert_eq!(session.mtu(), 0x99);
        assert_eq!(link.writes(), vec![MTU_PROBE.to_vec()]);
    }

    #[tokio::test]
    async fn single_frame_exchange() {
        let (link, session) = established_session().await;
        link.respond_with(|payload| {
            if payload == hex!("05 0000 000c e0d8000007426974636f696e") {
                vec![hex!("05 0000 0002 9000").to_vec()]
            } else {
                vec![]
            }
        });

        let response = session
            .exchange(&Apdu::from_hex("e0d8000007426974636f696e"))
            .await
            .unwrap();
        assert_eq!(response, hex!("9000"));
    }

    #[tokio::test]
    async fn multi_frame_response_reassembles_in_order() {
        let (link, session) = established_session().await;
        link.respond_with(|_| {
            vec![
                hex!("05 0000 0008 01 02 03").to_vec(),
                hex!("05 0001 04 05 06").to_vec(),
                hex!("05 0002 07 08 ff").to_vec(),
            ]
        });

        let response = session.exchange(&Apdu::new(vec![0xb0])).await.unwrap();
        assert_eq!(response, hex!("01 02 03 04 05 06 07 08"));
    }

    #[tokio::test]
    async fn second_exchange_is_rejected_while_one_is_pending() {
        let (link, session) = established_session().await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange(&Apdu::new(vec![0xe0, 0x01])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = session.exchange(&Apdu::new(vec![0xb0])).await.unwrap_err();
        assert!(matches!(err, TransportError::PendingActionOnDevice));

        // The pending exchange is not perturbed.
        link.notify_frames(&[hex!("05 0000 0002 9000").to_vec()]);
        assert_eq!(pending.await.unwrap().unwrap(), hex!("9000"));
    }

    #[tokio::test]
    async fn disconnect_waits_for_inflight_exchange() {
        let (link, session) = established_session().await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange(&Apdu::new(vec![0xe0, 0x01])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closer = {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished(), "close must defer to the exchange");
        assert!(!link.is_disconnected());

        link.notify_frames(&[hex!("05 0000 0002 9000").to_vec()]);
        assert_eq!(pending.await.unwrap().unwrap(), hex!("9000"));

        closer.await.unwrap();
        assert!(link.is_disconnected());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn unexpected_disconnect_aborts_exchange() {
        let (_link, session) = established_session().await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange(&Apdu::new(vec![0xe0, 0x01])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.mark_closed();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::LowerLevelError(_)));
    }

    #[tokio::test]
    async fn cancelled_exchange_releases_the_busy_slot() {
        let (link, session) = established_session().await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange(&Apdu::new(vec![0xe0, 0x01])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending.abort();
        let _ = pending.await;

        // A late response to the cancelled command has no exchange to land on.
        link.notify_frames(&[hex!("05 0000 0002 6985").to_vec()]);

        link.respond_with(|payload| {
            if payload == hex!("05 0000 0004 b0010000") {
                vec![hex!("05 0000 0002 9000").to_vec()]
            } else {
                vec![]
            }
        });
        let response = session.exchange(&Apdu::from_hex("b0010000")).await.unwrap();
        assert_eq!(response, hex!("9000"));
    }

    #[tokio::test]
    async fn write_failure_surfaces_and_frees_the_slot() {
        let (link, session) = established_session().await;
        link.set_fail_writes(true);

        let err = session.exchange(&Apdu::new(vec![0xb0])).await.unwrap_err();
        assert!(matches!(err, TransportError::WriteError(_)));

        link.set_fail_writes(false);
        link.respond_with(|_| vec![hex!("05 0000 0002 9000").to_vec()]);
        assert!(session.exchange(&Apdu::new(vec![0xb0])).await.is_ok());
    }

    #[tokio::test]
    async fn send_writes_without_awaiting_a_response() {
        let (link, session) = established_session().await;
        session.send(&Apdu::from_hex("b0a70000")).await.unwrap();
        assert_eq!(link.writes().last().unwrap(), &hex!("05 0000 0004 b0a70000"));
    }

    #[tokio::test]
    async fn framing_violation_maps_to_read_error() {
        let (link, session) = established_session().await;
        link.respond_with(|_| vec![hex!("aa 0000 0002 9000").to_vec()]);
        let err = session.exchange(&Apdu::new(vec![0xb0])).await.unwrap_err();
        assert!(matches!(err, TransportError::ReadError(_)));
    }

    #[tokio::test]
    async fn exchange_on_closed_session_fails_fast() {
        let (link, session) = established_session().await;
        session.close().await;
        assert!(link.is_disconnected());
        let err = session.exchange(&Apdu::new(vec![0xb0])).await.unwrap_err();
        assert!(matches!(err, TransportError::LowerLevelError(_)));
    }
}
