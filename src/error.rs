use thiserror::Error;

/// Errors surfaced by the transport layer.
///
/// Every kind carries a stable identifier (see [`TransportError::code`]) so
/// callers on the far side of an FFI or IPC boundary can match on it without
/// parsing display strings.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("another exchange is already pending on the device")]
    PendingActionOnDevice,
    #[error("user refused the action on the device")]
    UserRefusedOnDevice,
    #[error("scan timed out before any wallet was discovered")]
    ScanTimedOut,
    #[error("bluetooth stack is not available")]
    BluetoothNotAvailable,
    #[error("connect failed: {0}")]
    ConnectError(String),
    #[error("no wallet connected: {0}")]
    CurrentConnectedError(String),
    #[error("write failed: {0}")]
    WriteError(String),
    #[error("read failed: {0}")]
    ReadError(String),
    #[error("could not listen for notifications: {0}")]
    ListenError(String),
    #[error("scan failed: {0}")]
    ScanError(String),
    #[error("pairing failed: {0}")]
    PairingError(String),
    #[error("bluetooth stack failure: {0}")]
    LowerLevelError(String),
    #[error(transparent)]
    Status(#[from] StatusError),
}

impl TransportError {
    /// Stable identifier string for cross-boundary matching.
    ///
    /// `BluetoothNotAvaliable` is spelled exactly as the companion SDKs spell
    /// it; changing it would break callers matching on the identifier.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::PendingActionOnDevice => "TransportRaceCondition",
            TransportError::UserRefusedOnDevice => "UserRefusedOnDevice",
            TransportError::ScanTimedOut => "ListenTimeout",
            TransportError::BluetoothNotAvailable => "BluetoothNotAvaliable",
            TransportError::ConnectError(_) => "ConnectionError",
            TransportError::CurrentConnectedError(_) => "CurrentConnectedError",
            TransportError::WriteError(_) => "WriteError",
            TransportError::ReadError(_) => "ReadError",
            TransportError::ListenError(_) => "ListenError",
            TransportError::ScanError(_) => "ScanError",
            TransportError::PairingError(_) => "PairError",
            TransportError::LowerLevelError(_) => "LowerLevelError",
            TransportError::Status(status) => status.code(),
        }
    }
}

/// Classification of the two-byte status word trailing every device response,
/// plus the parse failures of the app-info body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("user rejected the request on the device")]
    UserRejected,
    #[error("requested app is not available on the device")]
    AppNotAvailableInDevice,
    #[error("device returned status {0}")]
    Unknown(String),
    #[error("response too short to carry a status word")]
    NoStatus,
    #[error("app information format not supported")]
    FormatNotSupported,
    #[error("could not parse response data")]
    CouldNotParseResponseData,
}

impl StatusError {
    pub fn code(&self) -> &'static str {
        match self {
            StatusError::UserRejected => "UserRejected",
            StatusError::AppNotAvailableInDevice => "AppNotAvailableInDevice",
            StatusError::Unknown(_) => "Unknown",
            StatusError::NoStatus => "NoStatus",
            StatusError::FormatNotSupported => "FormatNotSupported",
            StatusError::CouldNotParseResponseData => "CouldNotParseResponseData",
        }
    }
}
