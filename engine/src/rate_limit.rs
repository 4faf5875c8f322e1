//! Quantum-based send pacing.
//!
//! A throttled policy tracks how many bytes were sent within the current
//! wall-clock quantum and assigns each send task a delay that keeps the byte
//! rate at or below the configured budget. Callers snap the monotonic clock
//! once per call and pass it in, which keeps the policy deterministic and
//! testable.

use crate::task::{IoTask, TaskAction};

/// Send pacing policy attached to a pattern.
pub enum RateLimit {
    /// Identity: tasks are never delayed.
    None,
    Throttled(Throttle),
}

impl RateLimit {
    /// Build the policy from a bytes-per-second budget; `None` disables
    /// pacing entirely.
    pub fn from_config(bytes_per_second: Option<u64>, quantum_ms: u64, now_ms: u64) -> Self {
        match bytes_per_second {
            Some(rate) if rate > 0 => RateLimit::Throttled(Throttle::new(rate, quantum_ms, now_ms)),
            _ => RateLimit::None,
        }
    }

    /// Assign `time_offset_ms` on a send task and account its bytes.
    pub fn update_offset(&mut self, task: &mut IoTask, buffer_size: u64, now_ms: u64) {
        match self {
            RateLimit::None => {}
            RateLimit::Throttled(throttle) => throttle.update_offset(task, buffer_size, now_ms),
        }
    }
}

/// Stateful pacing against a bytes-per-quantum budget.
pub struct Throttle {
    bytes_per_quantum: u64,
    quantum_ms: u64,
    bytes_this_quantum: u64,
    quantum_start_ms: u64,
}

impl Throttle {
    pub fn new(bytes_per_second: u64, quantum_ms: u64, now_ms: u64) -> Self {
        let bytes_per_quantum = (bytes_per_second * quantum_ms / 1_000).max(1);
        Self {
            bytes_per_quantum,
            quantum_ms,
            bytes_this_quantum: 0,
            quantum_start_ms: now_ms,
        }
    }

    pub fn update_offset(&mut self, task: &mut IoTask, buffer_size: u64, now_ms: u64) {
        if task.action != TaskAction::Send {
            return;
        }
        task.time_offset_ms = 0;

        if self.bytes_this_quantum < self.bytes_per_quantum {
            if now_ms < self.quantum_start_ms + self.quantum_ms {
                if now_ms > self.quantum_start_ms {
                    // Inside the current quantum with budget left.
                    self.bytes_this_quantum += buffer_size;
                } else {
                    // Clock reads before the recorded quantum start: earlier
                    // sends already pushed the quantum into the future, so
                    // delay to its boundary.
                    task.time_offset_ms = self.next_quantum_start_ms() - now_ms;
                    self.bytes_this_quantum += buffer_size;
                }
            } else {
                // Already in a later quantum: start over from the clock.
                self.bytes_this_quantum = buffer_size;
                self.quantum_start_ms = now_ms;
            }
        } else {
            // The current quantum's budget is spent: find the earliest
            // future quantum that accommodates the accumulated bytes.
            let new_start = self.next_quantum_start_ms();
            if now_ms < new_start {
                task.time_offset_ms = new_start - now_ms;
                self.bytes_this_quantum = buffer_size;
                self.quantum_start_ms = new_start;
            } else {
                self.bytes_this_quantum = buffer_size;
                self.quantum_start_ms = now_ms;
            }
        }
    }

    fn next_quantum_start_ms(&self) -> u64 {
        self.quantum_start_ms + self.bytes_this_quantum / self.bytes_per_quantum * self.quantum_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BufferType, IoTask};
    use bytes::Bytes;

    fn send_task(len: usize) -> IoTask {
        IoTask::send(Bytes::from(vec![0u8; len]), 0, len, BufferType::Static, true)
    }

    #[test]
    fn no_throttle_is_identity() {
        let mut policy = RateLimit::None;
        let mut task = send_task(1024);
        policy.update_offset(&mut task, 1024, 12345);
        assert_eq!(task.time_offset_ms, 0);
    }

    #[test]
    fn recv_tasks_are_never_delayed() {
        let mut throttle = Throttle::new(1_000, 100, 0);
        let mut task = IoTask::recv(1024, BufferType::Static, true);
        throttle.update_offset(&mut task, 1024, 0);
        assert_eq!(task.time_offset_ms, 0);
    }

    #[test]
    fn within_quantum_no_delay() {
        // 10_000 B/s over 100 ms quanta: 1_000 bytes per quantum.
        let mut throttle = Throttle::new(10_000, 100, 1_000);
        let mut task = send_task(500);
        throttle.update_offset(&mut task, 500, 1_010);
        assert_eq!(task.time_offset_ms, 0);

        let mut task = send_task(400);
        throttle.update_offset(&mut task, 400, 1_020);
        assert_eq!(task.time_offset_ms, 0);
    }

    #[test]
    fn full_quantum_delays_to_next_boundary() {
        let mut throttle = Throttle::new(10_000, 100, 1_000);
        let mut task = send_task(1_000);
        throttle.update_offset(&mut task, 1_000, 1_001);
        assert_eq!(task.time_offset_ms, 0);

        // Budget spent: the next send waits for the next quantum.
        let mut task = send_task(1_000);
        throttle.update_offset(&mut task, 1_000, 1_050);
        assert_eq!(task.time_offset_ms, 50);
    }

    #[test]
    fn oversized_send_skips_multiple_quanta() {
        let mut throttle = Throttle::new(10_000, 100, 0);
        // One send worth three quanta of budget.
        let mut task = send_task(3_000);
        throttle.update_offset(&mut task, 3_000, 1);
        assert_eq!(task.time_offset_ms, 0);

        // The next send must wait three full quanta from the start.
        let mut task = send_task(1_000);
        throttle.update_offset(&mut task, 1_000, 10);
        assert_eq!(task.time_offset_ms, 290);
    }

    #[test]
    fn clock_before_quantum_start_delays_to_boundary() {
        let mut throttle = Throttle::new(10_000, 100, 1_000);
        // Fill the quantum, pushing quantum_start forward.
        let mut task = send_task(1_000);
        throttle.update_offset(&mut task, 1_000, 1_001);
        let mut task = send_task(500);
        throttle.update_offset(&mut task, 500, 1_050);
        assert_eq!(task.time_offset_ms, 50);
        // quantum_start is now 1_100; a clock reading before it gets
        // pushed to the following boundary.
        let mut task = send_task(100);
        throttle.update_offset(&mut task, 100, 1_060);
        assert_eq!(task.time_offset_ms, 40);
    }

    #[test]
    fn idle_gap_resets_the_quantum() {
        let mut throttle = Throttle::new(10_000, 100, 0);
        let mut task = send_task(1_000);
        throttle.update_offset(&mut task, 1_000, 10);
        assert_eq!(task.time_offset_ms, 0);

        // A long idle gap: clock is far past the next boundary, so the
        // quantum restarts at the clock with no delay.
        let mut task = send_task(1_000);
        throttle.update_offset(&mut task, 1_000, 5_000);
        assert_eq!(task.time_offset_ms, 0);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let run = || {
            let mut throttle = Throttle::new(10_000, 100, 0);
            let mut offsets = Vec::new();
            for i in 0..10 {
                let mut task = send_task(700);
                throttle.update_offset(&mut task, 700, i * 13);
                offsets.push(task.time_offset_ms);
            }
            offsets
        };
        assert_eq!(run(), run());
    }
}
