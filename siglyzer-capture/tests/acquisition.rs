use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use siglyzer_capture::{
    Analyzer, CancelLevel, CaptureError, ControlCode, DeviceTransport, SessionState, UsbAnalyzer,
};
use siglyzer_trace::SharedTraceSet;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// What a scripted queue does once its responses run out.
#[derive(Clone, Copy)]
enum OnDry {
    /// Fail the transfer as if the device was unplugged.
    Disconnect,
    /// Never complete, like a device with nothing to say.
    Park,
}

/// Stand-in for the USB device: canned control responses, canned bulk
/// payloads and a log of every OUT request.
struct ScriptedTransport {
    unchoke: Mutex<VecDeque<Vec<u8>>>,
    sample_index: Mutex<VecDeque<Vec<u8>>>,
    bulk: Mutex<VecDeque<Vec<u8>>>,
    writes: Mutex<Vec<(u8, Vec<u8>)>>,
    on_dry: OnDry,
}

impl ScriptedTransport {
    fn new(on_dry: OnDry) -> Self {
        ScriptedTransport {
            unchoke: Mutex::new(VecDeque::new()),
            sample_index: Mutex::new(VecDeque::new()),
            bulk: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            on_dry,
        }
    }

    fn push_unchoke(&self, start_addr: u32, start_index: u64) {
        let mut response = vec![0u8; 64];
        response[0..4].copy_from_slice(&start_addr.to_le_bytes());
        response[4..12].copy_from_slice(&start_index.to_le_bytes());
        self.unchoke.lock().push_back(response);
    }

    fn push_end_addr(&self, end_addr: u32) {
        let mut response = vec![0u8; 64];
        response[0..4].copy_from_slice(&end_addr.to_le_bytes());
        self.sample_index.lock().push_back(response);
    }

    /// A 12-byte response reports the device choked.
    fn push_choked(&self, end_addr: u32) {
        let mut response = vec![0u8; 12];
        response[0..4].copy_from_slice(&end_addr.to_le_bytes());
        self.sample_index.lock().push_back(response);
    }

    fn push_bulk(&self, data: Vec<u8>) {
        self.bulk.lock().push_back(data);
    }

    fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.writes.lock().clone()
    }

    async fn next_or_dry(&self, queue: &Mutex<VecDeque<Vec<u8>>>) -> Result<Vec<u8>, CaptureError> {
        let next = queue.lock().pop_front();
        match next {
            Some(response) => Ok(response),
            None => match self.on_dry {
                OnDry::Disconnect => {
                    Err(CaptureError::from(nusb::transfer::TransferError::Disconnected))
                }
                OnDry::Park => futures::future::pending().await,
            },
        }
    }
}

#[async_trait]
impl DeviceTransport for ScriptedTransport {
    async fn control_in(&self, code: ControlCode, _len: usize) -> Result<Vec<u8>, CaptureError> {
        match code.request {
            0x05 => self.next_or_dry(&self.sample_index).await,
            0x06 => Ok(vec![0u8; 64]),
            0x07 => self.next_or_dry(&self.unchoke).await,
            other => panic!("unexpected IN request {other:#04x}"),
        }
    }

    async fn control_out(&self, code: ControlCode, data: &[u8]) -> Result<(), CaptureError> {
        self.writes.lock().push((code.request, data.to_vec()));
        Ok(())
    }

    async fn bulk_in(&self, len: usize) -> Result<Vec<u8>, CaptureError> {
        assert_eq!(len % 64, 0, "bulk reads must be in 64-byte multiples");
        let data = self.next_or_dry(&self.bulk).await?;
        assert!(data.len() <= len);
        Ok(data)
    }
}

/// Device memory image: every 16-bit word holds its own address.
fn device_words(range: std::ops::Range<u32>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for addr in range {
        bytes.extend_from_slice(&(addr as u16).to_le_bytes());
    }
    bytes
}

fn single_channel_session(
    transport: Arc<ScriptedTransport>,
) -> (UsbAnalyzer, std::sync::mpsc::Receiver<SessionState>, SharedTraceSet) {
    let (mut session, events) = UsbAnalyzer::new(transport);
    session.set_channel(0, 0);
    let output = SharedTraceSet::new();
    session
        .start_trace(output.clone(), 1_000_000.0)
        .expect("start_trace");
    (session, events, output)
}

#[test]
fn streams_unaligned_start_and_drops_the_prefix() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Disconnect));
    // Capture starts at word 5 inside an alignment block; the device has
    // written up to word 37.
    transport.push_unchoke(5, 0xABC);
    transport.push_end_addr(37);
    transport.push_bulk(device_words(0..64));

    let (session, events, _output) = single_channel_session(transport.clone());
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), SessionState::Running);
    // The scripts run dry and the loop reports the device gone.
    assert_eq!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        SessionState::Disconnected
    );

    let raw = session.segment_buffer().drain();
    assert_eq!(raw.len(), 1);
    let (marker, bytes) = &raw[0];
    assert_eq!(*marker, 0xABC);
    // Words 5..37: the 10-byte alignment prefix is gone.
    assert_eq!(bytes, &device_words(5..37));

    let writes = transport.writes();
    // start, then rdaddr at the alignment block, then the choke move.
    assert_eq!(writes[0].0, 0x03);
    assert_eq!(writes[0].1.len(), 18);
    assert_eq!(writes[0].1[0], 0, "log2 of one rounded channel");
    let period = u32::from_le_bytes(writes[0].1[2..6].try_into().unwrap());
    assert_eq!(period, 99, "100 MHz / 1 MHz - 1");
    assert_eq!(writes[1], (0x02, 0u32.to_le_bytes().to_vec()));
    assert_eq!(writes[2], (0x08, 37u32.to_le_bytes().to_vec()));
}

#[test]
fn choke_cycle_starts_a_new_segment() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Disconnect));
    transport.push_unchoke(0, 100);
    transport.push_end_addr(32);
    transport.push_bulk(device_words(0..32));
    // The device runs out of data and chokes; the next unchoke restarts
    // at a later address with a new segment marker.
    transport.push_choked(32);
    transport.push_unchoke(64, 200);
    transport.push_end_addr(96);
    transport.push_bulk(device_words(64..96));

    let (session, events, _output) = single_channel_session(transport.clone());
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), SessionState::Running);
    assert_eq!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        SessionState::Disconnected
    );

    let raw = session.segment_buffer().drain();
    assert_eq!(raw.len(), 2);
    assert_eq!(raw[0], (100, device_words(0..32)));
    assert_eq!(raw[1], (200, device_words(64..96)));

    // Every consumed range was acknowledged with a choke move.
    let moves: Vec<u32> = transport
        .writes()
        .iter()
        .filter(|(request, _)| *request == 0x08)
        .map(|(_, data)| u32::from_le_bytes(data[..4].try_into().unwrap()))
        .collect();
    assert_eq!(moves, vec![32, 32, 96]);
}

#[test]
fn device_addresses_wrap_at_24_bits() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Disconnect));
    transport.push_unchoke(0xFF_FFE0, 9);
    transport.push_end_addr(0x10);
    // 48 words pending across the wrap; the transfer is rounded up to 128
    // bytes.
    transport.push_bulk(vec![0x5A; 128]);

    let (session, events, _output) = single_channel_session(transport.clone());
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), SessionState::Running);
    assert_eq!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        SessionState::Disconnected
    );

    let raw = session.segment_buffer().drain();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].1.len(), 96, "48 words survive the clamp");

    let moves: Vec<u32> = transport
        .writes()
        .iter()
        .filter(|(request, _)| *request == 0x08)
        .map(|(_, data)| u32::from_le_bytes(data[..4].try_into().unwrap()))
        .collect();
    assert_eq!(moves, vec![0x10]);
}

#[test]
fn abort_cancels_an_inflight_submission_and_stop_is_idempotent() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Park));
    transport.push_unchoke(0, 1);
    transport.push_end_addr(32);
    // No bulk response scripted: the loop parks inside the transfer.

    let (mut session, events, _output) = single_channel_session(transport.clone());
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), SessionState::Running);

    session.cancel_token().raise(CancelLevel::Abort);
    session.stop_trace().expect("stop_trace");
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), SessionState::Stopped);

    // The stop request went to the device exactly once.
    let stops = transport
        .writes()
        .iter()
        .filter(|(request, _)| *request == 0x04)
        .count();
    assert_eq!(stops, 1);

    // Stopping again changes nothing.
    session.stop_trace().expect("repeated stop_trace");
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(events.try_recv().is_err());
    let stops = transport
        .writes()
        .iter()
        .filter(|(request, _)| *request == 0x04)
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn stop_without_start_is_a_no_op() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Park));
    let (mut session, events) = UsbAnalyzer::new(transport);
    session.stop_trace().expect("stop_trace");
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(events.try_recv().is_err());
}

#[test]
fn start_requires_channels_and_a_sane_frequency() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Park));
    let (mut session, _events) = UsbAnalyzer::new(transport);

    let err = session.start_trace(SharedTraceSet::new(), 1_000_000.0).unwrap_err();
    assert!(matches!(err, CaptureError::NoChannels));

    session.set_channel(0, 3);
    let err = session.start_trace(SharedTraceSet::new(), 0.0).unwrap_err();
    assert!(matches!(err, CaptureError::InvalidFrequency(_)));
    let err = session
        .start_trace(SharedTraceSet::new(), 200_000_000.0)
        .unwrap_err();
    assert!(matches!(err, CaptureError::InvalidFrequency(_)));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn capture_decodes_into_the_shared_trace_set() {
    let transport = Arc::new(ScriptedTransport::new(OnDry::Disconnect));
    transport.push_unchoke(0, 3);
    transport.push_end_addr(4);
    // A doubled word closed by a zero count token, then a plain word.
    let mut memory = Vec::new();
    for word in [0x00FFu16, 0x00FF, 0x0000, 0x1234] {
        memory.extend_from_slice(&word.to_le_bytes());
    }
    memory.resize(64, 0);
    transport.push_bulk(memory);

    let (mut session, events, output) = single_channel_session(transport);
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), SessionState::Running);
    assert_eq!(
        events.recv_timeout(RECV_TIMEOUT).unwrap(),
        SessionState::Disconnected
    );
    assert!(session.data_ready().try_recv().is_ok());

    assert!(session.process_pending());
    // Draining an already drained pipeline reports nothing new.
    assert!(!session.process_pending());

    let set = output.read();
    assert_eq!(set.trace_count(), 1);
    let trace = &set.entries()[0].trace;
    assert_eq!(trace.len(), 48);
    assert_eq!(trace.samples_from_epoch, 3 * 16);
    for i in 0..32 {
        assert_eq!(trace.sample(i), i % 16 < 8, "bit {i} of 0x00FF");
    }
    for i in 0..16 {
        assert_eq!(trace.sample(32 + i), (0x1234 >> i) & 1 != 0);
    }
}
