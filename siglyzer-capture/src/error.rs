use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no analyzer interface claimed")]
    NotConnected,
    #[error("a trace is already running")]
    AlreadyRunning,
    #[error("cannot claim interface {interface}")]
    Claim {
        interface: u8,
        #[source]
        source: std::io::Error,
    },
    #[error("device reports no bulk-in endpoint")]
    MissingEndpoint,
    #[error("no channels enabled")]
    NoChannels,
    #[error("sample frequency {0} Hz out of range")]
    InvalidFrequency(f64),
    #[error("short control response: expected {expected} bytes, got {got}")]
    ShortResponse { expected: usize, got: usize },
    #[error("usb transfer failed")]
    Transfer(#[from] nusb::transfer::TransferError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("acquisition cancelled")]
    Cancelled,
}

impl CaptureError {
    /// True for failures that mean the device itself is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            CaptureError::Transfer(nusb::transfer::TransferError::Disconnected)
        )
    }
}
