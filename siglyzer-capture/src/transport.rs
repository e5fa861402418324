use async_trait::async_trait;

use crate::error::CaptureError;

/// A vendor/interface control request, `bmRequestType` plus `bRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCode {
    pub request_type: u8,
    pub request: u8,
}

pub const CMD_SET_WRADDR: ControlCode = ControlCode { request_type: 0x41, request: 0x01 };
pub const CMD_SET_RDADDR: ControlCode = ControlCode { request_type: 0x41, request: 0x02 };
pub const CMD_START: ControlCode = ControlCode { request_type: 0x41, request: 0x03 };
pub const CMD_STOP: ControlCode = ControlCode { request_type: 0x41, request: 0x04 };
pub const CMD_GET_SAMPLE_INDEX: ControlCode = ControlCode { request_type: 0xC1, request: 0x05 };
pub const CMD_GET_CONFIG: ControlCode = ControlCode { request_type: 0xC1, request: 0x06 };
pub const CMD_UNCHOKE: ControlCode = ControlCode { request_type: 0xC1, request: 0x07 };
pub const CMD_MOVE_CHOKE: ControlCode = ControlCode { request_type: 0x41, request: 0x08 };

/// Control and bulk access to one claimed analyzer interface.
///
/// The acquisition loop is written against this trait so it can run against
/// the real device or a scripted stand-in. All requests address the claimed
/// interface; `wValue` is zero for every command the loop issues.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Issues an IN control request and returns the device's response,
    /// which may be shorter than `len`.
    async fn control_in(&self, code: ControlCode, len: usize) -> Result<Vec<u8>, CaptureError>;

    /// Issues an OUT control request carrying `data`.
    async fn control_out(&self, code: ControlCode, data: &[u8]) -> Result<(), CaptureError>;

    /// Reads up to `len` bytes from the bulk-in endpoint. `len` must be a
    /// multiple of 64.
    async fn bulk_in(&self, len: usize) -> Result<Vec<u8>, CaptureError>;
}
