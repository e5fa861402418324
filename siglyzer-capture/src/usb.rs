use async_trait::async_trait;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Direction, EndpointType, Recipient, RequestBuffer};

use crate::error::CaptureError;
use crate::transport::{ControlCode, DeviceTransport};

/// Endpoint addresses discovered on the analyzer interface.
///
/// The bulk-in endpoint carries the sample stream. The bulk-out and the
/// interrupt notify endpoints exist on the device but the continuous
/// protocol does not use them; they are recorded for completeness.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: Option<u8>,
    pub notify: Option<u8>,
}

/// Identity of the underlying device, for connection listings.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    pub fn from_info(info: &nusb::DeviceInfo) -> Self {
        DeviceIdentity {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial_number: info.serial_number().map(str::to_owned),
        }
    }

    pub fn details(&self) -> String {
        match &self.serial_number {
            Some(serial) => format!("SN {serial}"),
            None => String::new(),
        }
    }
}

/// [`DeviceTransport`] backed by a claimed nusb interface.
pub struct UsbDeviceTransport {
    interface: nusb::Interface,
    interface_number: u8,
    endpoints: Endpoints,
}

impl UsbDeviceTransport {
    /// Claims `interface_number` on the device and locates its endpoints.
    pub fn claim(device: &nusb::Device, interface_number: u8) -> Result<Self, CaptureError> {
        let interface = device
            .claim_interface(interface_number)
            .map_err(|source| CaptureError::Claim {
                interface: interface_number,
                source,
            })?;
        let endpoints = discover_endpoints(&interface)?;
        log::debug!(
            "claimed interface {interface_number}, bulk-in endpoint {:#04x}",
            endpoints.bulk_in
        );

        Ok(UsbDeviceTransport {
            interface,
            interface_number,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }
}

fn discover_endpoints(interface: &nusb::Interface) -> Result<Endpoints, CaptureError> {
    let mut bulk_in = None;
    let mut bulk_out = None;
    let mut notify = None;

    if let Some(setting) = interface.descriptors().next() {
        for endpoint in setting.endpoints() {
            match (endpoint.transfer_type(), endpoint.direction()) {
                (EndpointType::Bulk, Direction::In) => bulk_in = bulk_in.or(Some(endpoint.address())),
                (EndpointType::Bulk, Direction::Out) => bulk_out = bulk_out.or(Some(endpoint.address())),
                (EndpointType::Interrupt, Direction::In) => notify = notify.or(Some(endpoint.address())),
                _ => {}
            }
        }
    }

    Ok(Endpoints {
        bulk_in: bulk_in.ok_or(CaptureError::MissingEndpoint)?,
        bulk_out,
        notify,
    })
}

#[async_trait]
impl DeviceTransport for UsbDeviceTransport {
    async fn control_in(&self, code: ControlCode, len: usize) -> Result<Vec<u8>, CaptureError> {
        debug_assert_eq!(code.request_type & 0x80, 0x80, "IN request expected");
        let response = self
            .interface
            .control_in(ControlIn {
                control_type: ControlType::Vendor,
                recipient: Recipient::Interface,
                request: code.request,
                value: 0,
                index: u16::from(self.interface_number),
                length: len as u16,
            })
            .await
            .into_result()?;
        Ok(response)
    }

    async fn control_out(&self, code: ControlCode, data: &[u8]) -> Result<(), CaptureError> {
        debug_assert_eq!(code.request_type & 0x80, 0, "OUT request expected");
        self.interface
            .control_out(ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Interface,
                request: code.request,
                value: 0,
                index: u16::from(self.interface_number),
                data,
            })
            .await
            .into_result()?;
        Ok(())
    }

    async fn bulk_in(&self, len: usize) -> Result<Vec<u8>, CaptureError> {
        debug_assert_eq!(len % 64, 0);
        let completion = self
            .interface
            .bulk_in(self.endpoints.bulk_in, RequestBuffer::new(len))
            .await;
        Ok(completion.into_result()?)
    }
}
