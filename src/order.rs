use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::wire::{flags, Envelope};

/// Out-of-order envelopes buffered per sender stream before giving up on
/// strict ordering
const MAX_PENDING_PER_STREAM: usize = 1_000;

#[derive(Default)]
struct StreamState {
    next_expected: u64,
    pending: BTreeMap<u64, Envelope>,
}

/// Re-sequences inbound envelopes so that messages from the same sender to
/// the same domain are delivered in send order.
///
/// Only envelopes carrying the ordering option participate; everything else
/// passes straight through. The first ordered envelope seen from a sender
/// establishes that stream's baseline, so a node that joins mid-stream does
/// not wait for sequences sent before it existed.
pub struct OrderingFilter {
    streams: Mutex<HashMap<(String, Vec<u8>), StreamState>>,
}

impl OrderingFilter {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Submit an inbound envelope; returns the envelopes now deliverable, in
    /// order. May be empty (buffered) or contain several (a gap closed).
    pub fn submit(&self, envelope: Envelope) -> Vec<Envelope> {
        if !envelope.has_option(flags::PRESERVE_ORDER) || envelope.sequence == 0 {
            return vec![envelope];
        }

        let key = (envelope.sender.clone(), envelope.domain.clone());
        let mut streams = self.streams.lock();
        let state = streams.entry(key).or_insert_with(|| StreamState {
            next_expected: envelope.sequence,
            pending: BTreeMap::new(),
        });

        if envelope.sequence < state.next_expected {
            debug!(
                sender = %envelope.sender,
                sequence = envelope.sequence,
                expected = state.next_expected,
                "dropping stale ordered envelope"
            );
            return Vec::new();
        }

        let mut ready = Vec::new();
        if envelope.sequence == state.next_expected {
            state.next_expected += 1;
            ready.push(envelope);
            while let Some(next) = state.pending.remove(&state.next_expected) {
                state.next_expected += 1;
                ready.push(next);
            }
        } else {
            state.pending.insert(envelope.sequence, envelope);
            if state.pending.len() > MAX_PENDING_PER_STREAM {
                warn!(
                    pending = state.pending.len(),
                    expected = state.next_expected,
                    "ordering buffer overflow, flushing stream out of strict order"
                );
                let drained = std::mem::take(&mut state.pending);
                for (sequence, buffered) in drained {
                    state.next_expected = sequence + 1;
                    ready.push(buffered);
                }
            }
        }
        ready
    }
}

impl Default for OrderingFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Payload;

    fn ordered(sender: &str, sequence: u64) -> Envelope {
        let mut envelope = Envelope::new(
            b"grp1".to_vec(),
            flags::PRESERVE_ORDER,
            Payload::Command {
                command: sequence.to_be_bytes().to_vec(),
            },
        );
        envelope.sender = sender.to_string();
        envelope.sequence = sequence;
        envelope
    }

    fn sequences(envelopes: &[Envelope]) -> Vec<u64> {
        envelopes.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn test_in_order_passes_through() {
        let filter = OrderingFilter::new();
        assert_eq!(sequences(&filter.submit(ordered("a:1", 1))), vec![1]);
        assert_eq!(sequences(&filter.submit(ordered("a:1", 2))), vec![2]);
    }

    #[test]
    fn test_gap_is_buffered_then_released() {
        let filter = OrderingFilter::new();
        assert_eq!(sequences(&filter.submit(ordered("a:1", 1))), vec![1]);
        assert!(filter.submit(ordered("a:1", 3)).is_empty());
        assert!(filter.submit(ordered("a:1", 4)).is_empty());
        assert_eq!(
            sequences(&filter.submit(ordered("a:1", 2))),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let filter = OrderingFilter::new();
        filter.submit(ordered("a:1", 5));
        assert!(filter.submit(ordered("a:1", 4)).is_empty());
        assert_eq!(sequences(&filter.submit(ordered("a:1", 6))), vec![6]);
    }

    #[test]
    fn test_streams_are_independent_per_sender() {
        let filter = OrderingFilter::new();
        assert_eq!(sequences(&filter.submit(ordered("a:1", 1))), vec![1]);
        // A different sender starting at 7 establishes its own baseline.
        assert_eq!(sequences(&filter.submit(ordered("b:1", 7))), vec![7]);
        assert!(filter.submit(ordered("b:1", 9)).is_empty());
        assert_eq!(sequences(&filter.submit(ordered("b:1", 8))), vec![8, 9]);
    }

    #[test]
    fn test_unordered_envelopes_bypass() {
        let filter = OrderingFilter::new();
        let mut envelope = ordered("a:1", 3);
        envelope.options = 0;
        assert_eq!(filter.submit(envelope).len(), 1);
    }
}
