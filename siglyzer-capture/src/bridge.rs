use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// Lossless handoff of raw capture bytes from the acquisition loop to the
/// consumer thread.
///
/// Entries are `(marker, bytes)` runs: a push whose marker matches the tail
/// entry extends it, so consecutive chunks of one segment arrive as a
/// single growing buffer. The wake channel is edge triggered and
/// collapsing; a missed notification is harmless because the next drain
/// sees everything queued so far.
pub struct SegmentBuffer {
    queue: Mutex<Vec<(u64, Vec<u8>)>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        SegmentBuffer {
            queue: Mutex::new(Vec::new()),
            wake_tx,
            wake_rx,
        }
    }
}

impl SegmentBuffer {
    pub fn new() -> Self {
        SegmentBuffer::default()
    }

    /// Appends bytes to the segment identified by `marker`. Never blocks on
    /// the consumer.
    pub fn push(&self, marker: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        {
            let mut queue = self.queue.lock();
            match queue.last_mut() {
                Some((tail_marker, data)) if *tail_marker == marker => {
                    data.extend_from_slice(bytes)
                }
                _ => queue.push((marker, bytes.to_vec())),
            }
        }

        // A full channel means a wake-up is already pending.
        let _ = self.wake_tx.try_send(());
    }

    /// Takes the whole queue, releasing the lock before the caller iterates.
    pub fn drain(&self) -> Vec<(u64, Vec<u8>)> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Receiver signalled on every push. Intended for the consumer thread
    /// to block on between drains.
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_same_marker_runs() {
        let bridge = SegmentBuffer::new();
        bridge.push(1, &[0xAA, 0xBB]);
        bridge.push(1, &[0xCC]);
        bridge.push(2, &[0xDD]);
        bridge.push(1, &[0xEE]);

        let drained = bridge.drain();
        assert_eq!(
            drained,
            vec![
                (1, vec![0xAA, 0xBB, 0xCC]),
                (2, vec![0xDD]),
                (1, vec![0xEE]),
            ]
        );
    }

    #[test]
    fn drain_empties_and_is_idempotent() {
        let bridge = SegmentBuffer::new();
        bridge.push(7, &[1, 2, 3]);
        assert!(!bridge.is_empty());

        assert_eq!(bridge.drain().len(), 1);
        assert!(bridge.is_empty());
        assert!(bridge.drain().is_empty());
        assert!(bridge.drain().is_empty());
    }

    #[test]
    fn empty_pushes_are_ignored() {
        let bridge = SegmentBuffer::new();
        bridge.push(1, &[]);
        assert!(bridge.is_empty());
        assert!(bridge.wake_receiver().try_recv().is_err());
    }

    #[test]
    fn wake_channel_collapses() {
        let bridge = SegmentBuffer::new();
        bridge.push(1, &[1]);
        bridge.push(1, &[2]);
        bridge.push(1, &[3]);

        let rx = bridge.wake_receiver();
        assert!(rx.try_recv().is_ok());
        // All further pushes collapsed into the single pending wake-up.
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.drain(), vec![(1, vec![1, 2, 3])]);
    }
}
