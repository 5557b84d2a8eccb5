//! APDU framing codec.
//!
//! Outbound APDUs are sliced into tagged BLE frames; inbound notify frames are
//! reassembled back into one response payload whose trailing two bytes are the
//! device status word.
//!
//! Frame layout: byte 0 is the tag `0x05`; bytes 1-2 are the big-endian frame
//! index; the first frame additionally carries the big-endian total payload
//! length in bytes 3-4. The rest of each frame is payload.

use core::fmt::Debug;

use pretty_hex::*;
use thiserror::Error;

use crate::error::StatusError;
use crate::hexutil;

/// Tag carried by every data frame.
pub const FRAME_TAG: u8 = 0x05;

/// Header bytes of the first frame (tag + index + length).
pub const FIRST_FRAME_HEADER: usize = 5;
/// Header bytes of every later frame (tag + index).
pub const FRAME_HEADER: usize = 3;

/// An application protocol data unit: an immutable command payload plus the
/// framing mode used to put it on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Apdu {
    data: Vec<u8>,
    prevent_chunking: bool,
}

impl Apdu {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            prevent_chunking: false,
        }
    }

    /// Build an APDU from a hex string. Malformed hex yields an APDU with an
    /// empty payload, which in turn produces no frames.
    pub fn from_hex(s: &str) -> Self {
        Self::new(hexutil::hex_to_bytes(s))
    }

    /// The MTU probe written right after notification subscription. Sent as a
    /// single frame without a length field; the device answers with its
    /// negotiated frame size.
    pub fn infer_mtu() -> Self {
        Self {
            data: vec![0x08, 0x00, 0x00, 0x00, 0x00],
            prevent_chunking: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The ordered transmission frames for this APDU at the given MTU.
    pub fn frames(&self, mtu: usize) -> Vec<Vec<u8>> {
        if self.prevent_chunking {
            if self.data.is_empty() {
                return vec![];
            }
            let mut frame = Vec::with_capacity(FRAME_HEADER + self.data.len());
            frame.push(FRAME_TAG);
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&self.data);
            return vec![frame];
        }
        chunk(&self.data, mtu)
    }
}

impl Debug for Apdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.data.as_slice().hex_dump())
    }
}

/// Slice `payload` into transmission frames of at most `mtu` bytes.
///
/// An empty payload produces no frames. The declared length saturates at
/// `0xFFFF`; the per-frame capacity is clamped to at least one payload byte
/// so a pathologically small MTU still makes progress.
pub fn chunk(payload: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![];
    }

    let declared = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut index = 0u16;

    while offset < payload.len() {
        let header = if index == 0 { FIRST_FRAME_HEADER } else { FRAME_HEADER };
        let capacity = mtu.saturating_sub(header).max(1);
        let end = (offset + capacity).min(payload.len());

        let mut frame = Vec::with_capacity(header + (end - offset));
        frame.push(FRAME_TAG);
        frame.extend_from_slice(&index.to_be_bytes());
        if index == 0 {
            frame.extend_from_slice(&declared.to_be_bytes());
        }
        frame.extend_from_slice(&payload[offset..end]);

        frames.push(frame);
        offset = end;
        index = index.wrapping_add(1);
    }

    frames
}

/// A violation of the frame layout while reassembling a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected frame tag 0x{0:02x}")]
    BadTag(u8),
    #[error("frame index out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u16, got: u16 },
    #[error("frame of {0} bytes is shorter than its header")]
    TooShort(usize),
    #[error("frame received after the declared payload was complete")]
    TrailingFrame,
    #[error("frames ended before the declared payload was complete ({got} of {expected} bytes)")]
    Incomplete { expected: usize, got: usize },
}

/// Incremental reassembly of notify frames into one response payload.
///
/// The first frame's length field is authoritative: reassembly completes once
/// that many bytes have accumulated, and surplus bytes in the completing frame
/// are dropped. A saturated length field (`0xFFFF`) cannot promise an exact
/// size, so completion is then deferred to [`Dechunker::finish`].
#[derive(Debug, Default)]
pub struct Dechunker {
    buffer: Vec<u8>,
    declared: usize,
    next_index: u16,
    started: bool,
    done: bool,
}

impl Dechunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound frame. Returns the full payload once complete.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        if self.done {
            return Err(FrameError::TrailingFrame);
        }

        let header = if self.started { FRAME_HEADER } else { FIRST_FRAME_HEADER };
        if frame.len() < header {
            return Err(FrameError::TooShort(frame.len()));
        }
        if frame[0] != FRAME_TAG {
            return Err(FrameError::BadTag(frame[0]));
        }

        let index = u16::from_be_bytes([frame[1], frame[2]]);
        if index != self.next_index {
            return Err(FrameError::OutOfOrder {
                expected: self.next_index,
                got: index,
            });
        }

        if !self.started {
            self.declared = u16::from_be_bytes([frame[3], frame[4]]) as usize;
            self.started = true;
        }
        self.next_index = self.next_index.wrapping_add(1);
        self.buffer.extend_from_slice(&frame[header..]);

        if self.buffer.len() >= self.declared && self.declared < u16::MAX as usize {
            self.buffer.truncate(self.declared);
            self.done = true;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        Ok(None)
    }

    /// Close out reassembly once no more frames will arrive. Only meaningful
    /// for the saturated-length case; otherwise reports what is missing.
    pub fn finish(self) -> Result<Vec<u8>, FrameError> {
        if !self.started {
            return Err(FrameError::Incomplete { expected: 0, got: 0 });
        }
        if self.declared == u16::MAX as usize && self.buffer.len() >= self.declared {
            return Ok(self.buffer);
        }
        Err(FrameError::Incomplete {
            expected: self.declared,
            got: self.buffer.len(),
        })
    }
}

/// Reassemble a complete, ordered frame list in one call.
pub fn dechunk(frames: &[Vec<u8>]) -> Result<Vec<u8>, FrameError> {
    let mut dechunker = Dechunker::new();
    for frame in frames {
        if let Some(payload) = dechunker.push(frame)? {
            return Ok(payload);
        }
    }
    dechunker.finish()
}

/// The two-byte status word trailing every well-formed response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const OK: StatusWord = StatusWord(0x9000);
    pub const USER_REJECTED: StatusWord = StatusWord(0x6985);
    pub const APP_NOT_AVAILABLE: StatusWord = StatusWord(0x6984);

    pub fn is_ok(&self) -> bool {
        *self == StatusWord::OK
    }

    /// Classify a non-success status word.
    pub fn to_error(self) -> Option<StatusError> {
        match self {
            StatusWord::OK => None,
            StatusWord::USER_REJECTED => Some(StatusError::UserRejected),
            StatusWord::APP_NOT_AVAILABLE => Some(StatusError::AppNotAvailableInDevice),
            StatusWord(other) => Some(StatusError::Unknown(format!("{:04x}", other))),
        }
    }

    /// `Ok(())` for `9000`, the classified error otherwise.
    pub fn check(self) -> Result<(), StatusError> {
        match self.to_error() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl std::fmt::Display for StatusWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Split a reassembled response into its body and trailing status word.
/// Responses shorter than two bytes violate the wire protocol.
pub fn split_status(response: &[u8]) -> Result<(&[u8], StatusWord), StatusError> {
    if response.len() < 2 {
        return Err(StatusError::NoStatus);
    }
    let (body, sw) = response.split_at(response.len() - 2);
    Ok((body, StatusWord(u16::from_be_bytes([sw[0], sw[1]]))))
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn empty_payload_has_no_frames() {
        assert!(chunk(&[], 23).is_empty());
        assert!(Apdu::new(vec![]).frames(23).is_empty());
        assert!(Apdu::from_hex("abc").frames(153).is_empty()); // odd-length hex
    }

    #[test]
    fn frames_honour_tag_size_and_indices() {
        for mtu in [8, 20, 23, 153, 512] {
            for len in [1, 2, 19, 20, 147, 148, 149, 500, 4096] {
                let payload = pattern(len);
                let frames = chunk(&payload, mtu);
                assert!(!frames.is_empty());
                for (i, frame) in frames.iter().enumerate() {
                    assert_eq!(frame[0], FRAME_TAG);
                    assert!(frame.len() <= mtu, "mtu {} len {} frame {}", mtu, len, i);
                    assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), i as u16);
                }
                let declared = u16::from_be_bytes([frames[0][3], frames[0][4]]);
                assert_eq!(declared as usize, len.min(0xFFFF));
            }
        }
    }

    #[test]
    fn chunk_dechunk_round_trip() {
        for mtu in [8, 9, 20, 21, 100, 153, 512] {
            for len in [1, 5, 148, 149, 150, 500, 1000] {
                let payload = pattern(len);
                let frames = chunk(&payload, mtu);
                assert_eq!(dechunk(&frames).unwrap(), payload, "mtu {} len {}", mtu, len);
            }
        }
    }

    #[test]
    fn tiny_mtu_still_makes_progress() {
        // Capacity clamps to one payload byte even when the header alone
        // exceeds the MTU.
        let payload = pattern(4);
        let frames = chunk(&payload, 2);
        assert_eq!(frames.len(), 4);
        assert_eq!(dechunk(&frames).unwrap(), payload);
    }

    #[test]
    fn oversized_payload_saturates_length_field() {
        let payload = pattern(0x1_0005);
        let frames = chunk(&payload, 153);
        assert_eq!(&frames[0][3..5], &[0xFF, 0xFF]);
        // Round-trips through the batch reassembler, which only trusts the
        // saturated field once arrival agrees with it.
        assert_eq!(dechunk(&frames).unwrap(), payload);
    }

    #[test]
    fn mtu_probe_is_a_single_headerless_length_frame() {
        let frames = Apdu::infer_mtu().frames(23);
        assert_eq!(frames, vec![hex!("05 00 00 08 00 00 00 00").to_vec()]);
    }

    #[test]
    fn open_app_fits_one_frame_at_negotiated_mtu() {
        let apdu = Apdu::from_hex("e0d8000007426974636f696e");
        let frames = apdu.frames(153);
        assert_eq!(frames, vec![hex!("05 0000 000c e0d8000007426974636f696e").to_vec()]);

        let response = dechunk(&[hex!("05 0000 0002 9000").to_vec()]).unwrap();
        let (body, sw) = split_status(&response).unwrap();
        assert!(body.is_empty());
        assert!(sw.is_ok());
    }

    #[test]
    fn five_hundred_bytes_take_four_frames_at_mtu_153() {
        let payload = pattern(500);
        let frames = chunk(&payload, 153);
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[0][3..5], &[0x01, 0xF4]);
        assert_eq!(frames[0].len(), 153);
        assert_eq!(frames[3].len(), 500 - 148 - 2 * 150 + FRAME_HEADER);
        assert_eq!(dechunk(&frames).unwrap(), payload);
    }

    #[test]
    fn surplus_in_last_frame_is_discarded() {
        let response = dechunk(&[hex!("05 0000 0002 9000 ee").to_vec()]).unwrap();
        assert_eq!(response, vec![0x90, 0x00]);
    }

    #[test]
    fn framing_violations_are_reported() {
        let mut d = Dechunker::new();
        assert_eq!(d.push(&hex!("06 0000 0002 90")), Err(FrameError::BadTag(0x06)));

        let mut d = Dechunker::new();
        assert_eq!(d.push(&hex!("05 0000")), Err(FrameError::TooShort(3)));

        let mut d = Dechunker::new();
        d.push(&hex!("05 0000 0004 90")).unwrap();
        assert_eq!(
            d.push(&hex!("05 0002 00")),
            Err(FrameError::OutOfOrder { expected: 1, got: 2 })
        );

        let mut d = Dechunker::new();
        assert!(d.push(&hex!("05 0000 0002 9000")).unwrap().is_some());
        assert_eq!(d.push(&hex!("05 0001 00")), Err(FrameError::TrailingFrame));

        let short = vec![hex!("05 0000 000a 9000").to_vec()];
        assert_eq!(dechunk(&short), Err(FrameError::Incomplete { expected: 10, got: 2 }));
    }

    #[test]
    fn status_word_classification() {
        assert!(StatusWord(0x9000).check().is_ok());
        assert_eq!(StatusWord(0x6985).to_error(), Some(StatusError::UserRejected));
        assert_eq!(
            StatusWord(0x6984).to_error(),
            Some(StatusError::AppNotAvailableInDevice)
        );
        assert_eq!(
            StatusWord(0x6a80).to_error(),
            Some(StatusError::Unknown("6a80".into()))
        );
    }

    #[test]
    fn status_split_requires_two_bytes() {
        assert_eq!(split_status(&[0x90]), Err(StatusError::NoStatus));
        let (body, sw) = split_status(&hex!("01 07 9000")).unwrap();
        assert_eq!(body, hex!("01 07"));
        assert_eq!(sw, StatusWord::OK);
    }
}
