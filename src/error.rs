use crate::{
    ffu::FfuError, gpt::GptError, heap::HeapError, profile::ProfileError,
    transport::TransportError,
};

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("Phone disconnected: {0}")]
    TransportDisconnected(String),
    #[error("Phone rejected the request: {0}")]
    DeviceProtocolRejected(String),
    #[error("Allocation of {0:#X} bytes is below the page size")]
    UnsupportedAllocation(usize),
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),
    #[error("No working flashing profile found after {attempts} attempts")]
    NoWorkingProfileFound { attempts: usize },
    #[error("Flashing aborted after {chunks_written} chunks were written: {reason}")]
    AbortFlash { chunks_written: usize, reason: String },
    #[error("Flashing was cancelled")]
    Cancelled,
    #[error("Phone is in {0} mode, the flash app is needed")]
    WrongMode(&'static str),
    #[error("Failed to read flash part: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl FlashError {
    /// Longer hint for the operator, where one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            FlashError::TransportDisconnected(_) => {
                Some("Reconnect the phone, or reboot manually by holding the power button")
            }
            FlashError::AbortFlash { .. } => Some(
                "The phone may not boot. Reboot manually by holding the power button and flash a stock image",
            ),
            FlashError::NoWorkingProfileFound { .. } => {
                Some("Retry in experimental mode to widen the search")
            }
            FlashError::WrongMode(_) => Some("Reboot the phone into flash mode"),
            _ => None,
        }
    }
}

impl From<TransportError> for FlashError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Disconnected | TransportError::Timeout(_) => {
                FlashError::TransportDisconnected(value.to_string())
            }
            TransportError::Rejected(reason) => FlashError::DeviceProtocolRejected(reason),
            TransportError::Io(why) => FlashError::Io(why),
        }
    }
}

impl From<HeapError> for FlashError {
    fn from(value: HeapError) -> Self {
        match value {
            HeapError::UnsupportedAllocation(size) => FlashError::UnsupportedAllocation(size),
            why => FlashError::InvalidLayout(why.to_string()),
        }
    }
}

impl From<GptError> for FlashError {
    fn from(value: GptError) -> Self {
        match value {
            GptError::InvalidLayout(reason) => FlashError::InvalidLayout(reason),
            why => FlashError::InvalidLayout(why.to_string()),
        }
    }
}

impl From<FfuError> for FlashError {
    fn from(value: FfuError) -> Self {
        FlashError::InvalidLayout(value.to_string())
    }
}

/// Result of one try with one set of exploit parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome<T = ()> {
    Succeeded(T),
    /// The phone refused before any payload was accepted; the search goes on.
    Failed(String),
}
