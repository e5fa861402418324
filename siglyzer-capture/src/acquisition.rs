use std::future::Future;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use futures::future::{self, Either};
use futures::pin_mut;

use crate::bridge::SegmentBuffer;
use crate::cancel::{CancelLevel, CancelToken};
use crate::error::CaptureError;
use crate::transport::{
    DeviceTransport, CMD_GET_SAMPLE_INDEX, CMD_MOVE_CHOKE, CMD_SET_RDADDR, CMD_UNCHOKE,
};

/// Ceiling for a single bulk read, matching the device-side chunk ring.
pub(crate) const IO_BUFFER_LEN: usize = 64 * 1024;

/// Device addresses are 24-bit sample-word indices.
const ADDR_MASK: u32 = 0x00FF_FFFF;

/// Transfer byte counts clamp to 25 bits.
const LEN_MASK: u32 = 0x01FF_FFFF;

/// Control responses are requested at the device's fixed report size.
const CONTROL_RESPONSE_LEN: usize = 64;

/// A `get_sample_index` response of exactly this size means the device is
/// choked and will produce no bulk data until the next `unchoke`.
const CHOKED_RESPONSE_LEN: usize = 12;

/// Races a USB submission against the abort level of the token. Dropping
/// the transfer future cancels the submission on the device side.
async fn submit<F, T>(cancel: &CancelToken, transfer: F) -> Result<T, CaptureError>
where
    F: Future<Output = Result<T, CaptureError>>,
{
    pin_mut!(transfer);
    match future::select(cancel.wait_for(CancelLevel::Abort), transfer).await {
        Either::Left(((), _)) => Err(CaptureError::Cancelled),
        Either::Right((result, _)) => result,
    }
}

/// The continuous read loop.
///
/// Each turn resolves the device's write pointer, bulk-reads the delta
/// since the previous turn and advances the device-side choke point. The
/// loop suspends only at USB submissions and observes `cancel` between any
/// two of them; it returns on `Quit`, on an aborted submission or on a
/// transfer failure.
pub(crate) async fn run(
    transport: Arc<dyn DeviceTransport>,
    bridge: Arc<SegmentBuffer>,
    cancel: CancelToken,
) -> Result<(), CaptureError> {
    // The device starts out choked; the first unchoke yields the initial
    // read position and the segment marker.
    let mut choked = true;
    let mut start_addr = 0u32;
    let mut start_index = 0u64;

    loop {
        if cancel.reached(CancelLevel::Quit) {
            return Ok(());
        }

        if choked {
            let response = submit(
                &cancel,
                transport.control_in(CMD_UNCHOKE, CONTROL_RESPONSE_LEN),
            )
            .await?;
            if response.len() < 12 {
                return Err(CaptureError::ShortResponse {
                    expected: 12,
                    got: response.len(),
                });
            }
            start_addr = LittleEndian::read_u32(&response[0..4]) & ADDR_MASK;
            start_index = LittleEndian::read_u64(&response[4..12]);
            choked = false;
            log::debug!("unchoked at address {start_addr:#x}, segment index {start_index:#x}");
        }

        if cancel.reached(CancelLevel::Quit) {
            return Ok(());
        }

        let response = submit(
            &cancel,
            transport.control_in(CMD_GET_SAMPLE_INDEX, CONTROL_RESPONSE_LEN),
        )
        .await?;
        if response.len() < 4 {
            return Err(CaptureError::ShortResponse {
                expected: 4,
                got: response.len(),
            });
        }
        choked = response.len() == CHOKED_RESPONSE_LEN;
        let end_addr = LittleEndian::read_u32(&response[0..4]) & ADDR_MASK;

        // Bulk reads start at a 32-word alignment block; the prefix before
        // the true read position is dropped after the transfer.
        let mut addr_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut addr_bytes, start_addr & !31);
        submit(&cancel, transport.control_out(CMD_SET_RDADDR, &addr_bytes)).await?;

        while start_addr != end_addr {
            if cancel.reached(CancelLevel::Quit) {
                return Ok(());
            }

            let aligned_addr = start_addr & !31;
            let pending_bytes = end_addr.wrapping_sub(aligned_addr).wrapping_mul(2);
            let request_len = (pending_bytes.wrapping_add(63) & !63) & LEN_MASK;
            let request_len = (request_len as usize).min(IO_BUFFER_LEN);
            debug_assert_eq!(request_len % 64, 0);

            let data = submit(&cancel, transport.bulk_in(request_len)).await?;
            if data.is_empty() {
                return Err(CaptureError::ShortResponse {
                    expected: request_len,
                    got: 0,
                });
            }

            // The transfer may run short and may overshoot the unaligned
            // remainder; clamp to what the device actually holds.
            let device_len = (pending_bytes & LEN_MASK) as usize;
            let len = device_len.min(data.len());
            let skip = (2 * (start_addr & 31)) as usize;
            if len > skip {
                bridge.push(start_index, &data[skip..len]);
            }
            start_addr = aligned_addr.wrapping_add(len as u32 / 2) & ADDR_MASK;
        }

        LittleEndian::write_u32(&mut addr_bytes, end_addr);
        submit(&cancel, transport.control_out(CMD_MOVE_CHOKE, &addr_bytes)).await?;
    }
}
