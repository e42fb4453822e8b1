//! Per-conversation reordering of inbound envelopes.

use std::collections::BTreeMap;
use std::time::Duration;

use nanobot_common::Envelope;
use tokio::time::Instant;

/// Bridges number inbound envelopes from 1 in every conversation.
pub const FIRST_SEQUENCE: u64 = 1;

/// Sequence numbers that were given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub first_missing: u64,
    pub last_missing: u64,
}

impl Gap {
    pub fn len(&self) -> u64 {
        self.last_missing - self.first_missing + 1
    }
}

/// What a buffer operation released.
#[derive(Debug, Default)]
pub struct Release {
    /// Envelopes ready for delivery, in sequence order.
    pub ready: Vec<Envelope>,
    pub gaps: Vec<Gap>,
    /// Sequence of an envelope dropped as a duplicate or late arrival.
    pub stale: Option<u64>,
}

impl Release {
    fn merge(&mut self, other: Release) {
        self.ready.extend(other.ready);
        self.gaps.extend(other.gaps);
        if other.stale.is_some() {
            self.stale = other.stale;
        }
    }
}

/// Holds envelopes that arrived ahead of a missing predecessor.
///
/// Delivery is always strictly increasing. An envelope at or below the last
/// delivered sequence is stale and dropped. A missing sequence is skipped when
/// the buffered span would exceed the window, or once the oldest waiting
/// envelope has waited for the gap timeout.
#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: u64,
    window: u64,
    pending: BTreeMap<u64, (Envelope, Instant)>,
}

impl ReorderBuffer {
    pub fn new(window: u64) -> Self {
        Self::resume(window, FIRST_SEQUENCE)
    }

    /// A buffer that has already delivered everything below `next_expected`.
    pub fn resume(window: u64, next_expected: u64) -> Self {
        Self {
            next_expected,
            window: window.max(1),
            pending: BTreeMap::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, envelope: Envelope, now: Instant) -> Release {
        let sequence = envelope.sequence;
        if sequence < self.next_expected || self.pending.contains_key(&sequence) {
            return Release {
                stale: Some(sequence),
                ..Release::default()
            };
        }

        self.pending.insert(sequence, (envelope, now));
        let mut release = self.drain_in_order();
        while self.overflows() {
            release.merge(self.skip_gap());
        }
        release
    }

    /// Skip a gap whose oldest waiting envelope has been held for `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Release {
        let oldest = self.pending.values().map(|(_, at)| *at).min();
        match oldest {
            Some(at) if now.saturating_duration_since(at) >= timeout => self.skip_gap(),
            _ => Release::default(),
        }
    }

    /// Release everything still held, skipping over every gap.
    pub fn flush(&mut self) -> Release {
        let mut release = Release::default();
        while !self.pending.is_empty() {
            release.merge(self.skip_gap());
        }
        release
    }

    fn overflows(&self) -> bool {
        self.pending
            .keys()
            .next_back()
            .is_some_and(|highest| highest - self.next_expected >= self.window)
    }

    fn skip_gap(&mut self) -> Release {
        let Some(&lowest) = self.pending.keys().next() else {
            return Release::default();
        };
        let mut release = Release::default();
        if lowest > self.next_expected {
            release.gaps.push(Gap {
                first_missing: self.next_expected,
                last_missing: lowest - 1,
            });
            self.next_expected = lowest;
        }
        release.merge(self.drain_in_order());
        release
    }

    fn drain_in_order(&mut self) -> Release {
        let mut release = Release::default();
        while let Some((envelope, _)) = self.pending.remove(&self.next_expected) {
            release.ready.push(envelope);
            self.next_expected += 1;
        }
        release
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_common::{ConnectorId, ConversationId};

    fn env(sequence: u64) -> Envelope {
        Envelope::inbound(
            ConnectorId::from_string("wa1"),
            ConversationId::from_string("c1"),
            sequence,
            serde_json::json!({"n": sequence}),
        )
    }

    fn sequences(release: &Release) -> Vec<u64> {
        release.ready.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn in_order_envelopes_pass_straight_through() {
        let mut buffer = ReorderBuffer::new(64);
        let now = Instant::now();
        for seq in 1..=3 {
            assert_eq!(sequences(&buffer.push(env(seq), now)), vec![seq]);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn later_sequence_waits_for_predecessor() {
        let mut buffer = ReorderBuffer::new(64);
        let now = Instant::now();
        assert_eq!(sequences(&buffer.push(env(1), now)), vec![1]);
        assert!(buffer.push(env(3), now).ready.is_empty());
        assert_eq!(sequences(&buffer.push(env(2), now)), vec![2, 3]);
    }

    #[test]
    fn duplicates_and_late_arrivals_are_stale() {
        let mut buffer = ReorderBuffer::new(64);
        let now = Instant::now();
        buffer.push(env(1), now);
        buffer.push(env(3), now);
        assert_eq!(buffer.push(env(1), now).stale, Some(1));
        assert_eq!(buffer.push(env(3), now).stale, Some(3));
        assert_eq!(buffer.next_expected(), 2);
    }

    #[test]
    fn window_overflow_skips_the_gap() {
        let mut buffer = ReorderBuffer::new(4);
        let now = Instant::now();
        buffer.push(env(1), now);
        for seq in 3..=5 {
            assert!(buffer.push(env(seq), now).ready.is_empty());
        }
        let release = buffer.push(env(6), now);
        assert_eq!(
            release.gaps,
            vec![Gap {
                first_missing: 2,
                last_missing: 2
            }]
        );
        assert_eq!(sequences(&release), vec![3, 4, 5, 6]);
        assert_eq!(buffer.push(env(2), now).stale, Some(2));
    }

    #[test]
    fn gap_timeout_releases_held_envelopes() {
        let mut buffer = ReorderBuffer::new(64);
        let start = Instant::now();
        buffer.push(env(1), start);
        buffer.push(env(4), start);
        buffer.push(env(5), start + Duration::from_millis(500));

        let timeout = Duration::from_secs(2);
        assert!(buffer.expire(start + Duration::from_secs(1), timeout).ready.is_empty());

        let release = buffer.expire(start + Duration::from_secs(2), timeout);
        assert_eq!(release.gaps[0].len(), 2);
        assert_eq!(sequences(&release), vec![4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn flush_skips_every_gap() {
        let mut buffer = ReorderBuffer::new(64);
        let now = Instant::now();
        buffer.push(env(2), now);
        buffer.push(env(5), now);
        let release = buffer.flush();
        assert_eq!(sequences(&release), vec![2, 5]);
        assert_eq!(release.gaps.len(), 2);
        assert_eq!(buffer.next_expected(), 6);
    }

    #[test]
    fn any_arrival_order_within_window_delivers_in_order() {
        // Deterministic shuffles from a small LCG; no gaps, so every
        // permutation must come out as 1..=n exactly once.
        let n = 32u64;
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..200 {
            let mut order: Vec<u64> = (1..=n).collect();
            for i in (1..order.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (seed >> 33) as usize % (i + 1);
                order.swap(i, j);
            }

            let mut buffer = ReorderBuffer::new(n);
            let now = Instant::now();
            let mut delivered = Vec::new();
            for seq in order {
                let release = buffer.push(env(seq), now);
                assert!(release.gaps.is_empty());
                assert!(release.stale.is_none());
                delivered.extend(sequences(&release));
            }
            assert_eq!(delivered, (1..=n).collect::<Vec<_>>());
        }
    }
}
