//! The unit of work handed from an IO pattern to the transport.
//!
//! An [`IoTask`] describes one send, receive, or shutdown step. Send tasks
//! carry their bytes as a cheap [`Bytes`] slice of a shared backing buffer;
//! receive tasks carry only the requested length and are filled by the
//! transport. `track_io` marks whether the task's bytes count toward the
//! transfer total.

use bytes::Bytes;

/// What the transport should do with this task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Nothing to do right now (transfer complete, failed, or a protocol
    /// step is still outstanding).
    None,
    Send,
    Recv,
    /// Half-close the send side (FIN).
    GracefulShutdown,
    /// Force a RST by closing with linger set to zero.
    HardShutdown,
}

/// Which backing region a task's buffer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Process-wide static content (the shared send pattern, control
    /// literals such as the UDP START message).
    Static,
    /// A 32-byte connection-id region exchanged at TCP session start.
    TcpConnectionId,
    /// A flag-prefixed connection-id datagram for UDP streams.
    UdpConnectionId,
    /// A framed media-stream data datagram.
    MediaStreamData,
    /// Per-connection tracked bytes subject to content verification.
    Tracked,
}

/// One unit of requested I/O.
#[derive(Debug, Clone)]
pub struct IoTask {
    pub action: TaskAction,
    buffer: Bytes,
    offset: usize,
    length: usize,
    pub buffer_type: BufferType,
    /// Whether the bytes moved by this task count toward `max_transfer`.
    pub track_io: bool,
    /// Delay before the transport issues this task, assigned by the rate
    /// limit policy on sends.
    pub time_offset_ms: u64,
}

impl IoTask {
    /// A task carrying no work and no buffer.
    pub fn none() -> Self {
        Self {
            action: TaskAction::None,
            buffer: Bytes::new(),
            offset: 0,
            length: 0,
            buffer_type: BufferType::Static,
            track_io: false,
            time_offset_ms: 0,
        }
    }

    /// A send of `length` bytes starting at `offset` within `buffer`.
    pub fn send(buffer: Bytes, offset: usize, length: usize, buffer_type: BufferType, track_io: bool) -> Self {
        assert!(
            offset + length <= buffer.len(),
            "IoTask send region out of bounds: offset {offset} + length {length} > capacity {}",
            buffer.len()
        );
        Self {
            action: TaskAction::Send,
            buffer,
            offset,
            length,
            buffer_type,
            track_io,
            time_offset_ms: 0,
        }
    }

    /// A receive of up to `length` bytes. The transport supplies the
    /// destination; the pattern validates the received content.
    pub fn recv(length: usize, buffer_type: BufferType, track_io: bool) -> Self {
        Self {
            action: TaskAction::Recv,
            buffer: Bytes::new(),
            offset: 0,
            length,
            buffer_type,
            track_io,
            time_offset_ms: 0,
        }
    }

    /// A shutdown step (no buffer access).
    pub fn shutdown(action: TaskAction) -> Self {
        debug_assert!(matches!(
            action,
            TaskAction::GracefulShutdown | TaskAction::HardShutdown
        ));
        Self {
            action,
            buffer: Bytes::new(),
            offset: 0,
            length: 0,
            buffer_type: BufferType::Static,
            track_io: false,
            time_offset_ms: 0,
        }
    }

    /// Number of bytes this task sends or requests to receive.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// The bytes to put on the wire for a send task.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        debug_assert!(self.action == TaskAction::Send, "payload() on a non-send task");
        &self.buffer[self.offset..self.offset + self.length]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_task_has_no_buffer() {
        let task = IoTask::none();
        assert_eq!(task.action, TaskAction::None);
        assert_eq!(task.length(), 0);
        assert!(!task.track_io);
    }

    #[test]
    fn send_task_slices_backing_buffer() {
        let buffer = Bytes::from_static(b"0123456789");
        let task = IoTask::send(buffer, 2, 5, BufferType::Static, true);
        assert_eq!(task.payload(), b"23456");
        assert_eq!(task.length(), 5);
        assert!(task.track_io);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn send_task_rejects_out_of_bounds_region() {
        let buffer = Bytes::from_static(b"0123");
        let _ = IoTask::send(buffer, 2, 5, BufferType::Static, true);
    }

    #[test]
    fn recv_task_carries_requested_length() {
        let task = IoTask::recv(32, BufferType::TcpConnectionId, false);
        assert_eq!(task.action, TaskAction::Recv);
        assert_eq!(task.length(), 32);
    }
}
