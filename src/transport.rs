//! What the engine needs from the USB layer, and nothing more.

use std::time::Duration;

/// Option byte sent along with FFU headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlashOptions(u8);

impl FlashOptions {
    pub const SKIP_WRITE: Self = Self(1 << 0);
    pub const SKIP_SIGNATURE_CHECK: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FlashOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Whether the flash app still holds a header from an interrupted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAppState {
    Idle,
    HeaderPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneInfo {
    pub platform_id: String,
    pub firmware_version: String,
    pub protocol_version_major: u8,
    pub app_state: FlashAppState,
}

impl PhoneInfo {
    /// Protocol 2 phones take V2 headers and payloads.
    pub const fn supports_v2(&self) -> bool {
        self.protocol_version_major >= 2
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Phone disconnected")]
    Disconnected,
    #[error("Phone rejected the command: {0}")]
    Rejected(String),
    #[error("Phone did not respond within {0:?}")]
    Timeout(Duration),
    #[error("Transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Commands of the flash application, one blocking round trip each.
pub trait FlashTransport {
    fn read_phone_info(&mut self) -> Result<PhoneInfo, TransportError>;

    /// First `size` bytes of the eMMC, holding the MBR and the GPT.
    fn read_gpt_chunk(&mut self, size: usize) -> Result<Vec<u8>, TransportError>;

    fn send_header_v1(&mut self, header: &[u8], options: FlashOptions)
    -> Result<(), TransportError>;

    /// Sends `data` at `offset` of a header the phone expects to be
    /// `declared_size` bytes long. The phone only parses it once complete.
    fn send_header_v2(
        &mut self,
        declared_size: u32,
        offset: u32,
        data: &[u8],
        options: FlashOptions,
    ) -> Result<(), TransportError>;

    fn send_payload(&mut self, chunk: &[u8], progress_percent: u8) -> Result<(), TransportError>;

    fn reset_phone(&mut self) -> Result<(), TransportError>;

    fn switch_to_flash_app_context(&mut self) -> Result<(), TransportError>;
}

/// Mode a phone showed up in.
pub enum DeviceSession<T> {
    FlashApp(T),
    BootManager(T),
    Emergency,
    Normal,
}

impl<T> DeviceSession<T> {
    pub const fn mode_name(&self) -> &'static str {
        match self {
            DeviceSession::FlashApp(_) => "flash app",
            DeviceSession::BootManager(_) => "boot manager",
            DeviceSession::Emergency => "emergency download",
            DeviceSession::Normal => "normal",
        }
    }
}

impl<T: FlashTransport> DeviceSession<T> {
    /// Brings the session into the flash app, `None` when the phone is in a
    /// mode that can't get there over this transport.
    pub fn into_flash_app(self) -> Result<Option<T>, TransportError> {
        match self {
            DeviceSession::FlashApp(transport) => Ok(Some(transport)),
            DeviceSession::BootManager(mut transport) => {
                tracing::debug!("Switching from boot manager to flash app");
                transport.switch_to_flash_app_context()?;
                Ok(Some(transport))
            }
            DeviceSession::Emergency | DeviceSession::Normal => Ok(None),
        }
    }
}

/// Device arrival notifications.
pub trait DeviceNotifier {
    type Transport: FlashTransport;

    /// Blocks until a phone arrives. `None` timeout waits forever, an elapsed
    /// timeout yields `Ok(None)`.
    fn wait_for_arrival(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<DeviceSession<Self::Transport>>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_bits() {
        assert_eq!(FlashOptions::SKIP_WRITE.bits(), 0b01);
        assert_eq!(FlashOptions::SKIP_SIGNATURE_CHECK.bits(), 0b10);

        let both = FlashOptions::SKIP_WRITE | FlashOptions::SKIP_SIGNATURE_CHECK;
        assert_eq!(both.bits(), 0b11);
        assert!(both.contains(FlashOptions::SKIP_WRITE));
        assert!(!FlashOptions::empty().contains(FlashOptions::SKIP_SIGNATURE_CHECK));
    }
}
