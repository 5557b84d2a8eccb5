//! App-management commands layered on top of the exchange engine.

use crate::apdu::{split_status, Apdu, StatusWord};
use crate::error::{StatusError, TransportError};
use crate::link::GattLink;

use super::WalletSession;

/// Name the device dashboard reports for itself when no app is running.
pub const LAUNCHER_NAME: &str = "BOLOS";

/// Upper bound on foreign apps quit on the way to the launcher. One hop is the
/// normal case; the bound only guards against a device that never lands on
/// the dashboard.
const MAX_QUIT_HOPS: u8 = 2;

/// The APDUs the helpers put on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppCommand {
    GetAppAndVersion,
    QuitApp,
    OpenApp(String),
}

impl AppCommand {
    fn header(&self) -> [u8; 4] {
        match self {
            AppCommand::GetAppAndVersion => [0xb0, 0x01, 0x00, 0x00],
            AppCommand::QuitApp => [0xb0, 0xa7, 0x00, 0x00],
            AppCommand::OpenApp(_) => [0xe0, 0xd8, 0x00, 0x00],
        }
    }

    pub fn apdu(&self) -> Apdu {
        let mut bytes = self.header().to_vec();
        if let AppCommand::OpenApp(name) = self {
            bytes.push(name.len() as u8);
            bytes.extend_from_slice(name.as_bytes());
        }
        Apdu::new(bytes)
    }
}

/// What the device reports as currently running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl AppInfo {
    /// Body layout: format byte, then two length-prefixed UTF-8 fields.
    fn parse(body: &[u8]) -> Result<Self, StatusError> {
        if body.is_empty() {
            return Err(StatusError::FormatNotSupported);
        }
        let mut pos = 1usize;
        let name = read_field(body, &mut pos)?;
        let version = read_field(body, &mut pos)?;
        Ok(Self { name, version })
    }
}

fn read_field(body: &[u8], pos: &mut usize) -> Result<String, StatusError> {
    let len = *body.get(*pos).ok_or(StatusError::FormatNotSupported)? as usize;
    *pos += 1;
    let bytes = body
        .get(*pos..*pos + len)
        .ok_or(StatusError::FormatNotSupported)?;
    *pos += len;
    String::from_utf8(bytes.to_vec()).map_err(|_| StatusError::CouldNotParseResponseData)
}

/// `6985` on an app-management command means the user declined on the device.
fn check_app_status(status: StatusWord) -> Result<(), TransportError> {
    match status.check() {
        Ok(()) => Ok(()),
        Err(StatusError::UserRejected) => Err(TransportError::UserRefusedOnDevice),
        Err(other) => Err(other.into()),
    }
}

impl<L: GattLink> WalletSession<L> {
    /// Ask the device which app is running and at which version.
    pub async fn app_and_version(&self) -> Result<AppInfo, TransportError> {
        let response = self.exchange(&AppCommand::GetAppAndVersion.apdu()).await?;
        let (body, status) = split_status(&response)?;
        status.check()?;
        Ok(AppInfo::parse(body)?)
    }

    /// Return to the launcher.
    pub async fn quit_app(&self) -> Result<(), TransportError> {
        let response = self.exchange(&AppCommand::QuitApp.apdu()).await?;
        let (_, status) = split_status(&response)?;
        check_app_status(status)
    }

    /// Make sure `name` is the running app, quitting whatever else runs and
    /// launching it from the dashboard if necessary. Name comparison is
    /// case-sensitive.
    pub async fn open_app_if_needed(&self, name: &str) -> Result<(), TransportError> {
        let mut hops = 0u8;
        loop {
            let info = self.app_and_version().await?;
            if info.name == name {
                return Ok(());
            }
            if info.name != LAUNCHER_NAME && hops < MAX_QUIT_HOPS {
                tracing::debug!(running = %info.name, "quitting app to reach the dashboard");
                hops += 1;
                self.quit_app().await?;
                continue;
            }
            return self.open_app(name).await;
        }
    }

    async fn open_app(&self, name: &str) -> Result<(), TransportError> {
        tracing::info!(app = name, "requesting app launch");
        let response = self
            .exchange(&AppCommand::OpenApp(name.to_owned()).apdu())
            .await?;
        let (_, status) = split_status(&response)?;
        check_app_status(status)
    }
}
