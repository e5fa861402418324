use bit_vec::BitVec;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::DecodeError;
use crate::set::{ChannelId, TraceSet};
use crate::trace::Trace;

/// Mux input id marking a slot as disabled.
pub const DISABLED_INPUT: u8 = 31;

/// State of the on-wire repeat escape.
///
/// The analyzer collapses runs of identical sample words: the second
/// occurrence of a word switches the stream into `Count`, where subsequent
/// words are repeat counts rather than samples. `0xFFFF` continues the
/// count, anything else terminates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressState {
    PreFirst,
    Idle,
    Count,
}

impl CompressState {
    fn from_marker(bits: u8) -> Result<Self, DecodeError> {
        match bits {
            0 => Ok(CompressState::PreFirst),
            1 => Ok(CompressState::Idle),
            2 => Ok(CompressState::Count),
            other => Err(DecodeError::InvalidMarker(other)),
        }
    }
}

/// Mask of the marker bits holding the segment's starting sample-word index.
const MARKER_INDEX_MASK: u64 = (1 << 46) - 1;

/// Streaming decoder turning capture buffers into trace blocks.
///
/// Buffers arrive as `(marker, bytes)` pairs; buffers sharing a marker
/// continue one segment, a marker change seals the open traces and starts
/// fresh ones. Within a segment the decoder demultiplexes each 16-bit
/// sample word into the configured channels and undoes the repeat escape,
/// appending finished blocks to every open trace in lockstep.
pub struct StreamDecoder {
    mux: [u8; 16],
    channel_count: usize,
    rounded_channel_count: usize,
    /// Bits each channel gains per sample word, `16 / rounded_channel_count`.
    steps_per_word: usize,
    samples_per_second: f64,

    compress_state: CompressState,
    compress_sample: u16,
    /// Logical index at which the next completed block will be placed.
    sample_index: u64,
    open_marker: Option<u64>,
    /// Trace-set entry per mux slot; disabled slots are decoded but
    /// discarded.
    open_traces: Vec<Option<usize>>,
    /// Per-slot bits of the block under construction. Bits only reach the
    /// trace set when the block closes, so the store invariants hold
    /// between calls.
    pending: Vec<BitVec>,
    /// Length of the block under construction, in bits per channel.
    pending_len: usize,
    /// Set after a framing error until the next marker change.
    skipping: bool,
}

impl StreamDecoder {
    /// Creates a decoder for one capture run. `mux` assigns an input to each
    /// of the sixteen slots, `DISABLED_INPUT` marking unused ones; trailing
    /// disabled slots do not count towards the channel total.
    pub fn new(mux: [u8; 16], samples_per_second: f64) -> Self {
        let mut channel_count = mux.len();
        while channel_count > 0 && mux[channel_count - 1] == DISABLED_INPUT {
            channel_count -= 1;
        }
        let rounded_channel_count = channel_count.max(1).next_power_of_two();

        StreamDecoder {
            mux,
            channel_count,
            rounded_channel_count,
            steps_per_word: 16 / rounded_channel_count,
            samples_per_second,
            compress_state: CompressState::PreFirst,
            compress_sample: 0,
            sample_index: 0,
            open_marker: None,
            open_traces: Vec::new(),
            pending: (0..channel_count).map(|_| BitVec::new()).collect(),
            pending_len: 0,
            skipping: false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn rounded_channel_count(&self) -> usize {
        self.rounded_channel_count
    }

    pub fn compress_state(&self) -> CompressState {
        self.compress_state
    }

    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    /// Decodes one capture buffer into `set`.
    ///
    /// On a framing error the open partial block is discarded and every
    /// further buffer of the same segment is ignored; the next marker
    /// change resynchronizes.
    pub fn feed(&mut self, marker: u64, bytes: &[u8], set: &mut TraceSet) -> Result<(), DecodeError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let continuing = self.open_marker == Some(marker);
        if continuing && self.skipping {
            return Ok(());
        }

        match self.feed_inner(marker, !continuing, bytes, set) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open_marker = Some(marker);
                self.abandon_segment();
                Err(e)
            }
        }
    }

    fn feed_inner(
        &mut self,
        marker: u64,
        new_segment: bool,
        bytes: &[u8],
        set: &mut TraceSet,
    ) -> Result<(), DecodeError> {
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::OddBufferLength(bytes.len()));
        }
        if new_segment {
            self.begin_segment(marker, set)?;
        }
        self.skipping = false;

        // Repeat total of the block under construction. A segment resumed
        // mid-count re-emits the repeated word and accumulates from zero:
        // the occurrences before the discontinuity already live in earlier
        // blocks.
        let mut repeat: u64 = if self.compress_state == CompressState::Count {
            self.store_sample(self.compress_sample);
            0
        } else {
            1
        };

        for word in bytes.chunks_exact(2) {
            let word = LittleEndian::read_u16(word);

            match self.compress_state {
                CompressState::PreFirst => {
                    self.store_sample(word);
                    self.compress_sample = word;
                    self.compress_state = CompressState::Idle;
                }
                CompressState::Idle => {
                    if word == self.compress_sample {
                        if self.pending_len != 0 {
                            // Move the previous occurrence out of the plain
                            // block; the repeat count will cover it.
                            self.pop_sample();
                            if self.pending_len != 0 {
                                debug_assert_eq!(repeat, 1);
                                self.close_block(repeat, set);
                            }
                            repeat = 2;
                        } else {
                            // The previous occurrence is sealed in an
                            // earlier block and cannot be reclaimed, so the
                            // new block only accounts for this one.
                            repeat = 1;
                        }
                        self.store_sample(word);
                        self.compress_state = CompressState::Count;
                    } else {
                        self.store_sample(word);
                        self.compress_sample = word;
                    }
                }
                CompressState::Count => {
                    repeat = repeat.wrapping_add(u64::from(word));
                    if word != 0xFFFF {
                        if repeat == 0 {
                            // The count closed without covering any samples
                            // in this segment; drop the re-emitted word.
                            self.pop_sample();
                            if self.pending_len != 0 {
                                return Err(DecodeError::InvalidEscape);
                            }
                        } else {
                            self.close_block(repeat, set);
                        }
                        repeat = 1;
                        self.compress_state = CompressState::PreFirst;
                    }
                }
            }
        }

        // Partial data has to become visible to readers between buffers, so
        // an in-progress block closes with whatever repeat total it reached.
        if self.pending_len != 0 {
            self.close_block(repeat, set);
        }

        Ok(())
    }

    fn begin_segment(&mut self, marker: u64, set: &mut TraceSet) -> Result<(), DecodeError> {
        let state = CompressState::from_marker(((marker >> 46) & 0x3) as u8)?;

        self.open_marker = Some(marker);
        self.compress_state = state;
        self.compress_sample = (marker >> 48) as u16;
        self.sample_index = 0;
        for bits in &mut self.pending {
            bits.clear();
        }
        self.pending_len = 0;

        let samples_from_epoch = (marker & MARKER_INDEX_MASK) * self.steps_per_word as u64;
        log::debug!(
            "opening segment at sample index {samples_from_epoch} with {} channels",
            self.channel_count
        );

        let mut open_traces = Vec::with_capacity(self.channel_count);
        for slot in 0..self.channel_count {
            if self.mux[slot] == DISABLED_INPUT {
                open_traces.push(None);
            } else {
                let trace = Trace::new(self.samples_per_second, samples_from_epoch);
                open_traces.push(Some(set.push(ChannelId::from(self.mux[slot]), trace)));
            }
        }
        self.open_traces = open_traces;

        Ok(())
    }

    /// Demultiplexes one sample word into the pending buffers, least
    /// significant channel group first. Channel `i` owns bit `i` of each
    /// group.
    fn store_sample(&mut self, word: u16) {
        let mut groups = u32::from(word);
        for _ in 0..self.steps_per_word {
            for slot in 0..self.channel_count {
                if self.open_traces[slot].is_some() {
                    self.pending[slot].push((groups >> slot) & 1 != 0);
                }
            }
            groups >>= self.rounded_channel_count;
        }
        self.pending_len += self.steps_per_word;
    }

    /// Removes the most recently stored sample word from the pending
    /// buffers.
    fn pop_sample(&mut self) {
        debug_assert!(self.pending_len >= self.steps_per_word);
        for slot in 0..self.channel_count {
            if self.open_traces[slot].is_some() {
                let bits = &mut self.pending[slot];
                let keep = bits.len() - self.steps_per_word;
                bits.truncate(keep);
            }
        }
        self.pending_len -= self.steps_per_word;
    }

    /// Publishes the block under construction into every open trace.
    fn close_block(&mut self, repeat_count: u64, set: &mut TraceSet) {
        debug_assert!(self.pending_len > 0);
        debug_assert!(repeat_count >= 1);

        for slot in 0..self.channel_count {
            if let Some(index) = self.open_traces[slot] {
                let trace = set.trace_mut(index);
                debug_assert_eq!(trace.len(), self.sample_index);
                trace.append_block(self.pending_len, repeat_count, &self.pending[slot]);
                self.pending[slot].clear();
            }
        }
        self.sample_index += self.pending_len as u64 * repeat_count;
        self.pending_len = 0;
    }

    fn abandon_segment(&mut self) {
        for bits in &mut self.pending {
            bits.clear();
        }
        self.pending_len = 0;
        self.open_traces.clear();
        self.skipping = true;
    }
}
