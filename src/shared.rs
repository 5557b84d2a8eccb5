//! Optional process-wide transport slot.
//!
//! The explicit [`BleTransport`] value is the primary API; this is a thin
//! convenience for applications that want one transport reachable from
//! anywhere without threading the handle through.

use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::transport::BleTransport;

static SHARED: Lazy<Mutex<Option<BleTransport>>> = Lazy::new(|| Mutex::new(None));

/// Install a transport as the process-wide shared instance.
pub fn set_shared(transport: BleTransport) {
    *SHARED.lock().unwrap() = Some(transport);
}

/// A clone of the shared transport, if one is installed.
pub fn shared() -> Option<BleTransport> {
    SHARED.lock().unwrap().clone()
}

/// Remove the shared transport.
pub fn clear_shared() {
    *SHARED.lock().unwrap() = None;
}
