use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, LittleEndian};
use futures::executor::block_on;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use siglyzer_trace::{ChannelId, SharedTraceSet, StreamDecoder, DISABLED_INPUT};

use crate::acquisition;
use crate::bridge::SegmentBuffer;
use crate::cancel::{CancelLevel, CancelToken};
use crate::error::CaptureError;
use crate::transport::{DeviceTransport, CMD_GET_CONFIG, CMD_START, CMD_STOP};
use crate::types::SessionState;
use crate::usb::{DeviceIdentity, UsbDeviceTransport};

/// The analyzer samples at most 100 MHz.
const MAX_SAMPLE_RATE: f64 = 100_000_000.0;

/// Physical inputs selectable by the mux, generic slots first.
static INPUT_NAMES: Lazy<BTreeMap<ChannelId, &'static str>> = Lazy::new(|| {
    const NAMES: [&str; 30] = [
        "ch0", "ch1", "ch2", "ch3", "ch4", "ch5", "ch6", "ch7", "ch8", "ch9", "ch10", "ch11",
        "ch12", "ch13", "ch14", "ch15", "usb_tx_se0", "usb_tx_j", "usb_tx_en", "usb_rx_se0",
        "usb_rx_j", "usb_pullup", "usb_dn", "usb_dp", "spi_miso", "spi_mosi", "spi_clk", "spi_cs",
        "clk_24", "clk_33",
    ];
    NAMES.iter().enumerate().map(|(id, &name)| (id, name)).collect()
});

/// Common surface of the supported analyzer connections.
pub trait Analyzer {
    fn max_channel_count(&self) -> usize;
    fn max_frequency(&self) -> f64;
    fn input_names(&self) -> &BTreeMap<ChannelId, &'static str>;
    fn default_inputs(&self) -> Vec<ChannelId>;

    /// Assigns a physical input to a mux slot. Inputs above the disable
    /// sentinel clamp to it.
    fn set_channel(&mut self, slot: usize, input: ChannelId);

    /// Disables every slot at `channels` and above.
    fn set_channel_count(&mut self, channels: usize);

    /// Configures the device and starts streaming into `output`.
    fn start_trace(&mut self, output: SharedTraceSet, frequency: f64) -> Result<(), CaptureError>;

    /// Stops streaming. A no-op when no trace is running.
    fn stop_trace(&mut self) -> Result<(), CaptureError>;
}

/// Number of leading mux slots in use, ignoring trailing disabled ones.
fn enabled_channel_count(mux: &[u8; 16]) -> usize {
    let mut count = mux.len();
    while count > 0 && mux[count - 1] == DISABLED_INPUT {
        count -= 1;
    }
    count
}

/// Packs the sixteen 5-bit mux assignments into the three start-packet
/// words, with the disable sentinel trailing the last slot. The layout is
/// what the device firmware expects; slot 12 loses its top bit and slot 13
/// everything but its top bit at the word seams.
fn pack_mux(mux: &[u8; 16]) -> [u32; 3] {
    let m = mux.map(u32::from);
    [
        m[0] | m[1] << 5 | m[2] << 10 | m[3] << 15 | m[4] << 20 | m[5] << 25 | m[6] << 30,
        m[6] >> 2 | m[7] << 3 | m[8] << 8 | m[9] << 13 | m[10] << 18 | m[11] << 23 | m[12] << 28,
        m[13] >> 4 | m[14] << 1 | m[15] << 6 | 31 << 11,
    ]
}

/// Recovers the mux assignments a packed start packet carries. Only the
/// bits `pack_mux` stores come back; the rest read as zero.
fn parse_mux(words: [u32; 3]) -> [u8; 16] {
    let [w1, w2, w3] = words;
    let mut mux = [0u8; 16];
    for (slot, value) in mux.iter_mut().enumerate().take(6) {
        *value = (w1 >> (5 * slot) & 31) as u8;
    }
    mux[6] = (w1 >> 30 | (w2 & 0b111) << 2) as u8;
    for slot in 7..12 {
        mux[slot] = (w2 >> (3 + 5 * (slot - 7)) & 31) as u8;
    }
    mux[12] = (w2 >> 28 & 0b1111) as u8;
    mux[13] = ((w3 & 1) << 4) as u8;
    mux[14] = (w3 >> 1 & 31) as u8;
    mux[15] = (w3 >> 6 & 31) as u8;
    mux
}

/// Session against the continuous-streaming analyzer.
///
/// Owns the claimed interface, the channel mux configuration and the
/// decode pipeline. The thread owning the session is the consumer side:
/// it calls [`UsbAnalyzer::process_pending`] whenever
/// [`UsbAnalyzer::data_ready`] fires. State changes, including an
/// asynchronous drop to `Disconnected` when the device goes away, arrive
/// on the receiver returned at construction.
pub struct UsbAnalyzer {
    transport: Arc<dyn DeviceTransport>,
    identity: DeviceIdentity,
    mux: [u8; 16],
    state: Arc<Mutex<SessionState>>,
    events: mpsc::Sender<SessionState>,
    cancel: CancelToken,
    bridge: Arc<SegmentBuffer>,
    decoder: Option<StreamDecoder>,
    output: Option<SharedTraceSet>,
    read_loop: Option<JoinHandle<()>>,
}

impl UsbAnalyzer {
    /// Opens `device` and claims its analyzer interface.
    pub fn open(
        info: &nusb::DeviceInfo,
        interface_number: u8,
    ) -> Result<(Self, mpsc::Receiver<SessionState>), CaptureError> {
        let device = info.open()?;
        let transport = UsbDeviceTransport::claim(&device, interface_number)?;

        // The descriptor readout is unused, but a device that cannot answer
        // it will not survive acquisition either.
        block_on(transport.control_in(CMD_GET_CONFIG, 64))?;

        let (mut session, events) = Self::new(Arc::new(transport));
        session.identity = DeviceIdentity::from_info(info);
        Ok((session, events))
    }

    /// Builds a session over an already claimed transport.
    pub fn new(transport: Arc<dyn DeviceTransport>) -> (Self, mpsc::Receiver<SessionState>) {
        let (events, receiver) = mpsc::channel();
        let session = UsbAnalyzer {
            transport,
            identity: DeviceIdentity::default(),
            mux: [DISABLED_INPUT; 16],
            state: Arc::new(Mutex::new(SessionState::Stopped)),
            events,
            cancel: CancelToken::new(),
            bridge: Arc::new(SegmentBuffer::new()),
            decoder: None,
            output: None,
            read_loop: None,
        };
        (session, receiver)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn details(&self) -> String {
        self.identity.details()
    }

    pub fn vendor_id(&self) -> u16 {
        self.identity.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.identity.product_id
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.identity.serial_number.as_deref()
    }

    /// Token observed by the acquisition loop. Raising `Abort` additionally
    /// cancels the USB submission in flight.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Wake-up channel for the consumer thread; fires on every buffer the
    /// acquisition loop hands over.
    pub fn data_ready(&self) -> crossbeam::channel::Receiver<()> {
        self.bridge.wake_receiver()
    }

    /// The raw producer/consumer buffer. Consumers normally go through
    /// [`UsbAnalyzer::process_pending`] instead; draining here bypasses the
    /// decoder.
    pub fn segment_buffer(&self) -> Arc<SegmentBuffer> {
        self.bridge.clone()
    }

    /// Decodes everything the acquisition loop queued so far into the
    /// output trace set. Returns whether any new data arrived. Framing
    /// errors drop the affected buffer and are logged, not propagated.
    pub fn process_pending(&mut self) -> bool {
        let batch = self.bridge.drain();
        if batch.is_empty() {
            return false;
        }
        let (Some(decoder), Some(output)) = (self.decoder.as_mut(), self.output.as_ref()) else {
            return false;
        };

        let mut new_data = false;
        for (marker, bytes) in batch {
            let mut set = output.write();
            match decoder.feed(marker, &bytes, &mut set) {
                Ok(()) => new_data = true,
                Err(e) => log::warn!("dropping malformed capture buffer: {e}"),
            }
        }
        new_data
    }

    fn transition(
        state: &Mutex<SessionState>,
        events: &mpsc::Sender<SessionState>,
        next: SessionState,
    ) {
        let mut current = state.lock();
        if *current != next {
            *current = next;
            let _ = events.send(next);
        }
    }

    fn fail(&self, error: CaptureError) -> CaptureError {
        if error.is_disconnect() {
            Self::transition(&self.state, &self.events, SessionState::Disconnected);
        }
        error
    }
}

impl Analyzer for UsbAnalyzer {
    fn max_channel_count(&self) -> usize {
        16
    }

    fn max_frequency(&self) -> f64 {
        MAX_SAMPLE_RATE
    }

    fn input_names(&self) -> &BTreeMap<ChannelId, &'static str> {
        &INPUT_NAMES
    }

    fn default_inputs(&self) -> Vec<ChannelId> {
        // The USB receive pair makes a useful capture out of the box.
        vec![20, 19]
    }

    fn set_channel(&mut self, slot: usize, input: ChannelId) {
        assert!(slot < self.mux.len());
        self.mux[slot] = input.min(usize::from(DISABLED_INPUT)) as u8;
    }

    fn set_channel_count(&mut self, channels: usize) {
        for slot in channels..self.mux.len() {
            self.mux[slot] = DISABLED_INPUT;
        }
    }

    fn start_trace(&mut self, output: SharedTraceSet, frequency: f64) -> Result<(), CaptureError> {
        match self.state() {
            SessionState::Disconnected => return Err(CaptureError::NotConnected),
            SessionState::Running => return Err(CaptureError::AlreadyRunning),
            SessionState::Stopped => {}
        }

        let channel_count = enabled_channel_count(&self.mux);
        if channel_count == 0 {
            return Err(CaptureError::NoChannels);
        }

        let ratio = MAX_SAMPLE_RATE / frequency;
        if !(1.0..=u32::MAX as f64).contains(&ratio) {
            return Err(CaptureError::InvalidFrequency(frequency));
        }
        let period = ratio as u32 - 1;

        let rounded = channel_count.next_power_of_two();
        let [mux1, mux2, mux3] = pack_mux(&self.mux);

        let mut packet = [0u8; 18];
        packet[0] = rounded.trailing_zeros() as u8;
        packet[1] = 0;
        LittleEndian::write_u32(&mut packet[2..6], period);
        LittleEndian::write_u32(&mut packet[6..10], mux1);
        LittleEndian::write_u32(&mut packet[10..14], mux2);
        LittleEndian::write_u32(&mut packet[14..18], mux3);

        log::info!("starting trace: {channel_count} channels at {frequency} Hz");
        block_on(self.transport.control_out(CMD_START, &packet)).map_err(|e| self.fail(e))?;

        self.decoder = Some(StreamDecoder::new(self.mux, frequency));
        self.output = Some(output);
        // Leftovers of a previous run must not leak into the new trace.
        let _ = self.bridge.drain();
        self.cancel.reset();

        // Running has to be visible before the loop thread starts, so an
        // immediate device loss still ends up in Disconnected.
        Self::transition(&self.state, &self.events, SessionState::Running);

        let handle = thread::Builder::new()
            .name("siglyzer-acquisition".to_owned())
            .spawn({
                let transport = self.transport.clone();
                let bridge = self.bridge.clone();
                let cancel = self.cancel.clone();
                let state = self.state.clone();
                let events = self.events.clone();
                move || {
                    match block_on(acquisition::run(transport, bridge, cancel)) {
                        Ok(()) | Err(CaptureError::Cancelled) => {
                            log::debug!("acquisition loop stopped");
                        }
                        Err(e) => {
                            log::error!("acquisition loop failed: {e}");
                            Self::transition(&state, &events, SessionState::Disconnected);
                        }
                    }
                }
            })
            .map_err(|e| {
                Self::transition(&self.state, &self.events, SessionState::Stopped);
                CaptureError::from(e)
            })?;
        self.read_loop = Some(handle);

        Ok(())
    }

    fn stop_trace(&mut self) -> Result<(), CaptureError> {
        let Some(handle) = self.read_loop.take() else {
            return Ok(());
        };

        self.cancel.raise(CancelLevel::Quit);
        if handle.join().is_err() {
            log::error!("acquisition thread panicked");
        }

        // The loop may have already lost the device; the stop request would
        // only fail again.
        if !self.state().is_connected() {
            return Ok(());
        }

        match block_on(self.transport.control_out(CMD_STOP, &[])) {
            Ok(()) => {
                Self::transition(&self.state, &self.events, SessionState::Stopped);
                Ok(())
            }
            Err(e) => {
                let e = self.fail(e);
                if self.state().is_connected() {
                    Self::transition(&self.state, &self.events, SessionState::Stopped);
                }
                Err(e)
            }
        }
    }
}

impl Drop for UsbAnalyzer {
    fn drop(&mut self) {
        if let Err(e) = self.stop_trace() {
            log::warn!("stopping trace on session drop failed: {e}");
        }
    }
}
