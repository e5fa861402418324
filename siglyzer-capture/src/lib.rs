//! Continuous acquisition from a USB logic analyzer.
//!
//! The pipeline has two sides. An acquisition loop owns the claimed USB
//! interface and runs on its own single-threaded executor, streaming raw
//! sample bytes into a lossless buffer. The consumer thread drains that
//! buffer through [`UsbAnalyzer::process_pending`], which decodes into a
//! [`siglyzer_trace::SharedTraceSet`] that renderers read concurrently.

mod acquisition;
pub mod bridge;
pub mod cancel;
pub mod error;
pub mod session;
pub mod transport;
pub mod types;
pub mod usb;

pub use bridge::SegmentBuffer;
pub use cancel::{CancelLevel, CancelToken};
pub use error::CaptureError;
pub use session::{Analyzer, UsbAnalyzer};
pub use transport::{ControlCode, DeviceTransport};
pub use types::SessionState;
