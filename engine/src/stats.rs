//! Per-connection statistics and connection identity.
//!
//! Each connection carries one of these structs inside its pattern, mutated
//! under the pattern lock, and folds the totals into the run-wide
//! [`metrics`](crate::metrics) counters on teardown.

use std::time::Instant;

use rand::RngCore;

use crate::id_pool::CONNECTION_ID_LENGTH;
use crate::metrics;

/// Generate a fresh 32-byte printable connection identifier: the hex
/// encoding of 16 random bytes.
pub fn generate_connection_id() -> [u8; CONNECTION_ID_LENGTH] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut raw = [0u8; CONNECTION_ID_LENGTH / 2];
    rand::rng().fill_bytes(&mut raw);
    let mut id = [0u8; CONNECTION_ID_LENGTH];
    for (i, byte) in raw.iter().enumerate() {
        id[2 * i] = HEX[(byte >> 4) as usize];
        id[2 * i + 1] = HEX[(byte & 0xf) as usize];
    }
    id
}

/// Byte accounting for one TCP connection.
#[derive(Debug)]
pub struct TcpStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub started: Instant,
}

impl TcpStats {
    pub fn new() -> Self {
        Self { bytes_sent: 0, bytes_recv: 0, started: Instant::now() }
    }

    fn publish(&self) {
        metrics::BYTES_SENT.add(self.bytes_sent);
        metrics::BYTES_RECV.add(self.bytes_recv);
    }
}

impl Default for TcpStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame accounting for one UDP media-stream connection.
#[derive(Debug, Default)]
pub struct UdpStats {
    pub bits_received: u64,
    pub successful_frames: u64,
    pub dropped_frames: u64,
    pub duplicate_frames: u64,
    pub error_frames: u64,
    tracker: FrameTracker,
}

impl UdpStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one received data frame: classify its sequence number and
    /// measure jitter from the sender's qpc/qpf timestamps.
    pub fn record_frame(&mut self, sequence: i64, qpc: i64, qpf: i64, wire_bytes: usize) {
        self.bits_received += wire_bytes as u64 * 8;
        match self.tracker.classify(sequence) {
            FrameClass::InOrder => self.successful_frames += 1,
            FrameClass::Gap(missed) => {
                self.dropped_frames += missed;
                self.successful_frames += 1;
            }
            FrameClass::Duplicate => {
                self.duplicate_frames += 1;
                return;
            }
        }
        if let Some(jitter_us) = self.tracker.jitter_us(qpc, qpf) {
            let _ = metrics::UDP_JITTER.increment(jitter_us);
        }
    }

    /// Record a datagram that failed framing validation.
    pub fn record_error_frame(&mut self) {
        self.error_frames += 1;
    }

    fn publish(&self) {
        metrics::UDP_BITS_RECV.add(self.bits_received);
        metrics::UDP_FRAMES_OK.add(self.successful_frames);
        metrics::UDP_FRAMES_DROPPED.add(self.dropped_frames);
        metrics::UDP_FRAMES_DUPLICATE.add(self.duplicate_frames);
        metrics::UDP_FRAMES_ERROR.add(self.error_frames);
    }
}

/// Statistics carried by one connection's pattern.
#[derive(Debug)]
pub enum ConnectionStats {
    Tcp(TcpStats),
    Udp(UdpStats),
}

impl ConnectionStats {
    pub fn tcp(&mut self) -> &mut TcpStats {
        match self {
            ConnectionStats::Tcp(stats) => stats,
            ConnectionStats::Udp(_) => panic!("tcp stats requested on a udp connection"),
        }
    }

    pub fn udp(&mut self) -> &mut UdpStats {
        match self {
            ConnectionStats::Udp(stats) => stats,
            ConnectionStats::Tcp(_) => panic!("udp stats requested on a tcp connection"),
        }
    }

    /// Fold this connection's totals into the run-wide counters.
    pub fn publish(&self) {
        match self {
            ConnectionStats::Tcp(stats) => stats.publish(),
            ConnectionStats::Udp(stats) => stats.publish(),
        }
    }
}

/// How a frame's sequence number relates to what was expected.
#[derive(Debug, PartialEq, Eq)]
enum FrameClass {
    InOrder,
    /// The frame arrived after a gap of this many missing frames.
    Gap(u64),
    Duplicate,
}

/// Sequence and timing tracker for a received media stream.
#[derive(Debug, Default)]
struct FrameTracker {
    next_expected: i64,
    /// Sender clock of the previous in-order frame.
    prev_qpc: Option<i64>,
    prev_arrival: Option<Instant>,
}

impl FrameTracker {
    fn classify(&mut self, sequence: i64) -> FrameClass {
        if sequence == self.next_expected {
            self.next_expected += 1;
            FrameClass::InOrder
        } else if sequence > self.next_expected {
            let missed = (sequence - self.next_expected) as u64;
            self.next_expected = sequence + 1;
            FrameClass::Gap(missed)
        } else {
            FrameClass::Duplicate
        }
    }

    /// Jitter is how far the receiver-side inter-arrival gap deviates from
    /// the sender-side inter-send gap, in microseconds.
    fn jitter_us(&mut self, qpc: i64, qpf: i64) -> Option<u64> {
        let arrival = Instant::now();
        let result = match (self.prev_qpc, self.prev_arrival) {
            (Some(prev_qpc), Some(prev_arrival)) if qpf > 0 && qpc >= prev_qpc => {
                let sender_us = (qpc - prev_qpc) as u128 * 1_000_000 / qpf as u128;
                let receiver_us = arrival.duration_since(prev_arrival).as_micros();
                Some(receiver_us.abs_diff(sender_us) as u64)
            }
            _ => None,
        };
        self.prev_qpc = Some(qpc);
        self.prev_arrival = Some(arrival);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_printable_and_distinct() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_ne!(a, b);
        assert!(a.iter().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn frame_tracker_classifies_sequences() {
        let mut tracker = FrameTracker::default();
        assert_eq!(tracker.classify(0), FrameClass::InOrder);
        assert_eq!(tracker.classify(1), FrameClass::InOrder);
        // Frames 2 and 3 never arrive.
        assert_eq!(tracker.classify(4), FrameClass::Gap(2));
        assert_eq!(tracker.classify(5), FrameClass::InOrder);
        // A late retransmit of an already-accounted frame.
        assert_eq!(tracker.classify(3), FrameClass::Duplicate);
    }

    #[test]
    fn udp_stats_accumulate_frames() {
        let mut stats = UdpStats::new();
        stats.record_frame(0, 1_000, 1_000_000, 1_200);
        stats.record_frame(1, 2_000, 1_000_000, 1_200);
        stats.record_frame(3, 4_000, 1_000_000, 1_200);
        stats.record_frame(2, 3_000, 1_000_000, 1_200);
        stats.record_error_frame();

        assert_eq!(stats.successful_frames, 3);
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(stats.duplicate_frames, 1);
        assert_eq!(stats.error_frames, 1);
        assert_eq!(stats.bits_received, 4 * 1_200 * 8);
    }
}
