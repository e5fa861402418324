//! In-memory representation of captured digital traces.
//!
//! A capture is stored as a set of per-channel [`Trace`]s. Each trace keeps
//! its samples run-length encoded in [`Block`]s over a shared bit vector,
//! which keeps hour-long captures of mostly-idle signals small while still
//! answering point and range queries in logarithmic time. The
//! [`StreamDecoder`] turns the analyzer's escape-encoded sample stream into
//! block appends.

pub mod decoder;
pub mod error;
pub mod set;
pub mod trace;
pub mod view;

pub use bit_vec::BitVec;

pub use decoder::{CompressState, StreamDecoder, DISABLED_INPUT};
pub use error::DecodeError;
pub use set::{ChannelId, TraceEntry, TraceSet};
pub use trace::{Block, SamplePtr, Trace};
pub use view::SharedTraceSet;
