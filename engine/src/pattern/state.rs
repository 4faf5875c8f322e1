//! Protocol phase tracking, independent of the traffic shape.
//!
//! Every connection moves through the same session protocol: the server
//! hands out its connection id, both sides move `max_transfer` bytes, the
//! server reports a 4-byte status, and the sides run the configured
//! shutdown handshake. This type tracks which phase the connection is in
//! and validates each completion against the phase's contract.
//!
//! UDP streams skip the id and completion phases entirely: they start in
//! `MoreIo` and complete when the confirmed byte count reaches the target.

use crate::config::{Protocol, ShutdownKind};
use crate::error::code;
use crate::id_pool::CONNECTION_ID_LENGTH;
use crate::task::IoTask;

/// Byte length of the server's final status word.
pub const COMPLETION_MESSAGE_LENGTH: usize = 4;

/// What the protocol wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTask {
    NoIo,
    SendConnectionId,
    RecvConnectionId,
    MoreIo,
    SendCompletion,
    RecvCompletion,
    GracefulShutdown,
    HardShutdown,
    RequestFin,
}

/// Outcome of completing a protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOutcome {
    NoError,
    TooManyBytes,
    TooFewBytes,
    CorruptedBytes,
    IoFailed,
    SuccessfullyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalState {
    Initialized,
    MoreIo,
    ServerSendConnectionId,
    ClientRecvConnectionId,
    ServerSendCompletion,
    ClientRecvCompletion,
    GracefulShutdown,
    HardShutdown,
    RequestFin,
    CompletedTransfer,
    ErrorIoFailed,
}

/// Per-connection protocol state machine.
pub struct IoPatternState {
    confirmed_bytes: u64,
    inflight_bytes: u64,
    max_transfer: u64,
    ideal_send_backlog: u64,
    state: InternalState,
    /// Set while a non-MoreIo step is outstanding so the same step is not
    /// issued twice.
    pended: bool,
    protocol: Protocol,
    listening: bool,
    shutdown: ShutdownKind,
}

impl IoPatternState {
    pub fn new(
        protocol: Protocol,
        listening: bool,
        shutdown: ShutdownKind,
        max_transfer: u64,
        ideal_send_backlog: u64,
    ) -> Self {
        Self {
            confirmed_bytes: 0,
            inflight_bytes: 0,
            max_transfer,
            ideal_send_backlog,
            state: if protocol == Protocol::Udp {
                InternalState::MoreIo
            } else {
                InternalState::Initialized
            },
            pended: false,
            protocol,
            listening,
            shutdown,
        }
    }

    /// Bytes left before the transfer target, counting in-flight IO.
    pub fn remaining_transfer(&self) -> u64 {
        let already = self
            .confirmed_bytes
            .checked_add(self.inflight_bytes)
            .unwrap_or_else(|| {
                panic!(
                    "pattern byte tracking overflowed: confirmed {} inflight {}",
                    self.confirmed_bytes, self.inflight_bytes
                )
            });
        assert!(
            already <= self.max_transfer,
            "bytes transferred ({already}) exceed the transfer target ({})",
            self.max_transfer
        );
        self.max_transfer - already
    }

    pub fn max_transfer(&self) -> u64 {
        self.max_transfer
    }

    pub fn set_max_transfer(&mut self, max_transfer: u64) {
        self.max_transfer = max_transfer;
    }

    pub fn ideal_send_backlog(&self) -> u64 {
        self.ideal_send_backlog
    }

    pub fn set_ideal_send_backlog(&mut self, isb: u64) {
        self.ideal_send_backlog = isb;
    }

    pub fn inflight_bytes(&self) -> u64 {
        self.inflight_bytes
    }

    pub fn confirmed_bytes(&self) -> u64 {
        self.confirmed_bytes
    }

    /// The connection reached a terminal state, successful or not.
    pub fn is_completed(&self) -> bool {
        matches!(
            self.state,
            InternalState::CompletedTransfer | InternalState::ErrorIoFailed
        )
    }

    pub fn is_current_task_more_io(&self) -> bool {
        self.state == InternalState::MoreIo
    }

    /// Advance the machine and return the next protocol step. Non-MoreIo
    /// steps pend until their completion arrives; MoreIo repeats until the
    /// transfer target is covered by confirmed plus in-flight bytes.
    pub fn next_task(&mut self) -> ProtocolTask {
        if self.pended {
            return ProtocolTask::NoIo;
        }

        match self.state {
            InternalState::Initialized => {
                self.pended = true;
                if self.listening {
                    tracing::trace!("pattern state: ServerSendConnectionId");
                    self.state = InternalState::ServerSendConnectionId;
                    ProtocolTask::SendConnectionId
                } else {
                    tracing::trace!("pattern state: ClientRecvConnectionId");
                    self.state = InternalState::ClientRecvConnectionId;
                    ProtocolTask::RecvConnectionId
                }
            }

            // Both sides start moving bytes once the id is exchanged.
            InternalState::ServerSendConnectionId | InternalState::ClientRecvConnectionId => {
                self.state = InternalState::MoreIo;
                ProtocolTask::MoreIo
            }

            InternalState::MoreIo => {
                if self.confirmed_bytes + self.inflight_bytes < self.max_transfer {
                    ProtocolTask::MoreIo
                } else {
                    ProtocolTask::NoIo
                }
            }

            InternalState::ServerSendCompletion => {
                self.pended = true;
                ProtocolTask::SendCompletion
            }
            InternalState::ClientRecvCompletion => {
                self.pended = true;
                ProtocolTask::RecvCompletion
            }
            InternalState::GracefulShutdown => {
                self.pended = true;
                ProtocolTask::GracefulShutdown
            }
            InternalState::HardShutdown => {
                self.pended = true;
                ProtocolTask::HardShutdown
            }
            InternalState::RequestFin => {
                self.pended = true;
                ProtocolTask::RequestFin
            }

            InternalState::CompletedTransfer | InternalState::ErrorIoFailed => ProtocolTask::NoIo,
        }
    }

    /// Account a just-issued task's bytes as in-flight.
    pub fn notify_task_issued(&mut self, task: &IoTask) {
        if task.track_io {
            self.inflight_bytes += task.length() as u64;
        }
    }

    /// Fold a transport error into the machine. Non-zero codes fail the
    /// connection, except that a server waiting in RequestFin treats
    /// timeout, reset, and abort as success: the client may validly RST
    /// instead of closing with a FIN.
    pub fn update_error(&mut self, error_code: u32) -> ProtocolOutcome {
        if self.state == InternalState::ErrorIoFailed {
            return ProtocolOutcome::IoFailed;
        }

        if error_code == code::OK {
            return ProtocolOutcome::NoError;
        }

        match self.protocol {
            Protocol::Udp => {
                tracing::debug!(error_code, "udp pattern failed");
                self.state = InternalState::ErrorIoFailed;
                ProtocolOutcome::IoFailed
            }
            Protocol::Tcp => {
                if self.is_completed() {
                    return ProtocolOutcome::NoError;
                }
                if self.listening
                    && self.state == InternalState::RequestFin
                    && matches!(
                        error_code,
                        code::TIMED_OUT | code::CONNECTION_RESET | code::CONNECTION_ABORTED
                    )
                {
                    ProtocolOutcome::NoError
                } else {
                    tracing::debug!(error_code, "tcp pattern failed");
                    self.state = InternalState::ErrorIoFailed;
                    ProtocolOutcome::IoFailed
                }
            }
        }
    }

    /// Mark the connection failed with a protocol violation detected above
    /// this layer (buffer content verification).
    pub fn fail_corrupted(&mut self) -> ProtocolOutcome {
        if self.state == InternalState::ErrorIoFailed {
            return ProtocolOutcome::IoFailed;
        }
        self.state = InternalState::ErrorIoFailed;
        ProtocolOutcome::CorruptedBytes
    }

    /// Validate a completed task and advance the machine.
    pub fn complete_task(&mut self, task: &IoTask, bytes_transferred: usize) -> ProtocolOutcome {
        if self.state == InternalState::ErrorIoFailed {
            return ProtocolOutcome::IoFailed;
        }

        // The connection-id exchange must arrive whole in one completion.
        if matches!(
            self.state,
            InternalState::ServerSendConnectionId | InternalState::ClientRecvConnectionId
        ) {
            if bytes_transferred != CONNECTION_ID_LENGTH {
                tracing::debug!(
                    bytes_transferred,
                    expected = CONNECTION_ID_LENGTH,
                    "connection id exchange truncated"
                );
                self.state = InternalState::ErrorIoFailed;
                return ProtocolOutcome::TooFewBytes;
            }
            self.pended = false;
        }

        if task.track_io {
            let bytes = bytes_transferred as u64;
            let requested = task.length() as u64;
            assert!(
                bytes <= self.inflight_bytes,
                "task completed more bytes ({bytes}) than were in flight ({})",
                self.inflight_bytes
            );
            assert!(
                requested <= self.inflight_bytes,
                "task requested more bytes ({requested}) than were in flight ({})",
                self.inflight_bytes
            );
            assert!(
                bytes <= requested,
                "task completed more bytes ({bytes}) than were posted ({requested})"
            );
            self.inflight_bytes -= requested;
            self.confirmed_bytes += bytes;
        }

        let already = self.confirmed_bytes + self.inflight_bytes;

        // UDP only tracks bytes.
        if self.protocol == Protocol::Udp {
            if already == self.max_transfer {
                self.state = InternalState::CompletedTransfer;
                return ProtocolOutcome::SuccessfullyCompleted;
            }
            return ProtocolOutcome::NoError;
        }

        if already < self.max_transfer {
            // A zero-byte completion mid-transfer means the peer bailed out
            // before the target was reached.
            if bytes_transferred == 0 {
                tracing::debug!(
                    transferred = already,
                    expected = self.max_transfer,
                    "peer closed before completing the transfer"
                );
                self.state = InternalState::ErrorIoFailed;
                return ProtocolOutcome::TooFewBytes;
            }
        } else if already == self.max_transfer {
            // Pended MoreIo must drain before the shutdown sequence starts.
            if self.inflight_bytes == 0 {
                return if self.listening {
                    self.server_transfer_complete(bytes_transferred)
                } else {
                    self.client_transfer_complete(bytes_transferred)
                };
            }
        } else {
            tracing::debug!(
                transferred = already,
                expected = self.max_transfer,
                "peer sent past the transfer target"
            );
            self.state = InternalState::ErrorIoFailed;
            return ProtocolOutcome::TooManyBytes;
        }

        ProtocolOutcome::NoError
    }

    /// Servers send their final status, then wait for the client's FIN.
    fn server_transfer_complete(&mut self, bytes_transferred: usize) -> ProtocolOutcome {
        match self.state {
            InternalState::MoreIo => {
                tracing::trace!("pattern state: ServerSendCompletion");
                self.state = InternalState::ServerSendCompletion;
                self.pended = false;
            }
            InternalState::ServerSendCompletion => {
                tracing::trace!("pattern state: RequestFin");
                self.state = InternalState::RequestFin;
                self.pended = false;
            }
            InternalState::RequestFin => {
                if bytes_transferred != 0 {
                    self.state = InternalState::ErrorIoFailed;
                    return ProtocolOutcome::TooManyBytes;
                }
                tracing::trace!("pattern state: CompletedTransfer");
                self.state = InternalState::CompletedTransfer;
                return ProtocolOutcome::SuccessfullyCompleted;
            }
            other => panic!("server completion in invalid pattern state {other:?}"),
        }
        ProtocolOutcome::NoError
    }

    /// Clients read the server's status, then run their shutdown sequence.
    fn client_transfer_complete(&mut self, bytes_transferred: usize) -> ProtocolOutcome {
        match self.state {
            InternalState::MoreIo => {
                tracing::trace!("pattern state: ClientRecvCompletion");
                self.state = InternalState::ClientRecvCompletion;
                self.pended = false;
            }
            InternalState::ClientRecvCompletion => {
                if bytes_transferred != COMPLETION_MESSAGE_LENGTH {
                    tracing::debug!(
                        bytes_transferred,
                        "server did not return a completion status"
                    );
                    self.state = InternalState::ErrorIoFailed;
                    return ProtocolOutcome::TooFewBytes;
                }
                self.pended = false;
                if self.shutdown == ShutdownKind::Graceful {
                    tracing::trace!("pattern state: GracefulShutdown");
                    self.state = InternalState::GracefulShutdown;
                } else {
                    tracing::trace!("pattern state: HardShutdown");
                    self.state = InternalState::HardShutdown;
                }
            }
            InternalState::GracefulShutdown => {
                tracing::trace!("pattern state: RequestFin");
                self.state = InternalState::RequestFin;
                self.pended = false;
            }
            InternalState::RequestFin => {
                if bytes_transferred != 0 {
                    self.state = InternalState::ErrorIoFailed;
                    return ProtocolOutcome::TooManyBytes;
                }
                tracing::trace!("pattern state: CompletedTransfer");
                self.state = InternalState::CompletedTransfer;
                return ProtocolOutcome::SuccessfullyCompleted;
            }
            InternalState::HardShutdown => {
                tracing::trace!("pattern state: CompletedTransfer");
                self.state = InternalState::CompletedTransfer;
                return ProtocolOutcome::SuccessfullyCompleted;
            }
            other => panic!("client completion in invalid pattern state {other:?}"),
        }
        ProtocolOutcome::NoError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BufferType, IoTask};
    use bytes::Bytes;

    fn tcp_client(max: u64) -> IoPatternState {
        IoPatternState::new(Protocol::Tcp, false, ShutdownKind::Graceful, max, 65_536)
    }

    fn tcp_server(max: u64) -> IoPatternState {
        IoPatternState::new(Protocol::Tcp, true, ShutdownKind::Graceful, max, 65_536)
    }

    fn tracked_task(len: usize) -> IoTask {
        IoTask::send(Bytes::from(vec![0u8; len]), 0, len, BufferType::Static, true)
    }

    fn untracked_recv(len: usize) -> IoTask {
        IoTask::recv(len, BufferType::Static, false)
    }

    /// Drive `bytes` of MoreIo through the machine in `chunk`-sized tasks.
    fn pump_more_io(state: &mut IoPatternState, bytes: u64, chunk: usize) {
        let mut moved = 0u64;
        while moved < bytes {
            assert_eq!(state.next_task(), ProtocolTask::MoreIo);
            let len = chunk.min((bytes - moved) as usize);
            let task = tracked_task(len);
            state.notify_task_issued(&task);
            assert_eq!(state.complete_task(&task, len), ProtocolOutcome::NoError);
            moved += len as u64;
        }
    }

    #[test]
    fn client_graceful_trajectory() {
        let mut state = tcp_client(65_536);

        assert_eq!(state.next_task(), ProtocolTask::RecvConnectionId);
        // The step pends: asking again yields nothing.
        assert_eq!(state.next_task(), ProtocolTask::NoIo);
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        assert_eq!(
            state.complete_task(&id_task, CONNECTION_ID_LENGTH),
            ProtocolOutcome::NoError
        );

        pump_more_io(&mut state, 65_536, 16_384);

        assert_eq!(state.next_task(), ProtocolTask::RecvCompletion);
        let completion = untracked_recv(COMPLETION_MESSAGE_LENGTH);
        assert_eq!(
            state.complete_task(&completion, COMPLETION_MESSAGE_LENGTH),
            ProtocolOutcome::NoError
        );

        assert_eq!(state.next_task(), ProtocolTask::GracefulShutdown);
        let shutdown = IoTask::shutdown(crate::task::TaskAction::GracefulShutdown);
        assert_eq!(state.complete_task(&shutdown, 0), ProtocolOutcome::NoError);

        assert_eq!(state.next_task(), ProtocolTask::RequestFin);
        let fin = untracked_recv(16);
        assert_eq!(
            state.complete_task(&fin, 0),
            ProtocolOutcome::SuccessfullyCompleted
        );
        assert!(state.is_completed());
    }

    #[test]
    fn client_hard_shutdown_skips_fin() {
        let mut state =
            IoPatternState::new(Protocol::Tcp, false, ShutdownKind::Hard, 1_024, 65_536);

        assert_eq!(state.next_task(), ProtocolTask::RecvConnectionId);
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);
        pump_more_io(&mut state, 1_024, 1_024);

        assert_eq!(state.next_task(), ProtocolTask::RecvCompletion);
        let completion = untracked_recv(COMPLETION_MESSAGE_LENGTH);
        state.complete_task(&completion, COMPLETION_MESSAGE_LENGTH);

        assert_eq!(state.next_task(), ProtocolTask::HardShutdown);
        let shutdown = IoTask::shutdown(crate::task::TaskAction::HardShutdown);
        assert_eq!(
            state.complete_task(&shutdown, 0),
            ProtocolOutcome::SuccessfullyCompleted
        );
        assert!(state.is_completed());
    }

    #[test]
    fn server_trajectory() {
        let mut state = tcp_server(4_096);

        assert_eq!(state.next_task(), ProtocolTask::SendConnectionId);
        let id_task = IoTask::send(
            Bytes::from(vec![0u8; CONNECTION_ID_LENGTH]),
            0,
            CONNECTION_ID_LENGTH,
            BufferType::TcpConnectionId,
            false,
        );
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);

        pump_more_io(&mut state, 4_096, 4_096);

        assert_eq!(state.next_task(), ProtocolTask::SendCompletion);
        let completion = IoTask::send(
            Bytes::from(vec![0u8; COMPLETION_MESSAGE_LENGTH]),
            0,
            COMPLETION_MESSAGE_LENGTH,
            BufferType::Static,
            false,
        );
        assert_eq!(
            state.complete_task(&completion, COMPLETION_MESSAGE_LENGTH),
            ProtocolOutcome::NoError
        );

        assert_eq!(state.next_task(), ProtocolTask::RequestFin);
        let fin = untracked_recv(16);
        assert_eq!(
            state.complete_task(&fin, 0),
            ProtocolOutcome::SuccessfullyCompleted
        );
        assert!(state.is_completed());
    }

    #[test]
    fn udp_skips_handshake_and_completes_on_target() {
        let mut state =
            IoPatternState::new(Protocol::Udp, false, ShutdownKind::Graceful, 2_000, 65_536);

        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
        let task = tracked_task(1_500);
        state.notify_task_issued(&task);
        assert_eq!(state.complete_task(&task, 1_500), ProtocolOutcome::NoError);

        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
        let task = tracked_task(500);
        state.notify_task_issued(&task);
        assert_eq!(
            state.complete_task(&task, 500),
            ProtocolOutcome::SuccessfullyCompleted
        );
        assert!(state.is_completed());
    }

    #[test]
    fn zero_byte_more_io_is_too_few_bytes() {
        let mut state = tcp_client(65_536);
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        state.next_task();
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);

        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
        let task = tracked_task(4_096);
        state.notify_task_issued(&task);
        assert_eq!(state.complete_task(&task, 0), ProtocolOutcome::TooFewBytes);
        assert!(state.is_completed());
    }

    #[test]
    fn bytes_on_request_fin_are_too_many() {
        let mut state = tcp_server(512);
        state.next_task();
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);
        pump_more_io(&mut state, 512, 512);

        assert_eq!(state.next_task(), ProtocolTask::SendCompletion);
        let completion = IoTask::send(
            Bytes::from(vec![0u8; COMPLETION_MESSAGE_LENGTH]),
            0,
            COMPLETION_MESSAGE_LENGTH,
            BufferType::Static,
            false,
        );
        state.complete_task(&completion, COMPLETION_MESSAGE_LENGTH);

        assert_eq!(state.next_task(), ProtocolTask::RequestFin);
        let fin = untracked_recv(16);
        assert_eq!(state.complete_task(&fin, 3), ProtocolOutcome::TooManyBytes);
        assert!(state.is_completed());
    }

    #[test]
    fn truncated_connection_id_is_too_few_bytes() {
        let mut state = tcp_client(65_536);
        assert_eq!(state.next_task(), ProtocolTask::RecvConnectionId);
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        assert_eq!(state.complete_task(&id_task, 16), ProtocolOutcome::TooFewBytes);
        assert!(state.is_completed());
    }

    #[test]
    fn more_io_stops_while_inflight_covers_target() {
        let mut state = tcp_client(8_192);
        state.next_task();
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);

        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
        let task = tracked_task(8_192);
        state.notify_task_issued(&task);
        // The whole target is in flight: nothing more to issue yet.
        assert_eq!(state.next_task(), ProtocolTask::NoIo);
        assert_eq!(state.complete_task(&task, 8_192), ProtocolOutcome::NoError);
        // Drained: the client moves on to the completion exchange.
        assert_eq!(state.next_task(), ProtocolTask::RecvCompletion);
    }

    #[test]
    fn server_tolerates_reset_while_awaiting_fin() {
        let mut state = tcp_server(512);
        state.next_task();
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);
        pump_more_io(&mut state, 512, 512);

        state.next_task();
        let completion = IoTask::send(
            Bytes::from(vec![0u8; COMPLETION_MESSAGE_LENGTH]),
            0,
            COMPLETION_MESSAGE_LENGTH,
            BufferType::Static,
            false,
        );
        state.complete_task(&completion, COMPLETION_MESSAGE_LENGTH);

        assert_eq!(state.next_task(), ProtocolTask::RequestFin);
        assert_eq!(
            state.update_error(code::CONNECTION_RESET),
            ProtocolOutcome::NoError
        );
        assert!(!state.is_completed());

        // A refused error is still fatal there.
        assert_eq!(
            state.update_error(code::CONNECTION_REFUSED),
            ProtocolOutcome::IoFailed
        );
        assert!(state.is_completed());
    }

    #[test]
    fn client_never_gets_request_fin_leniency() {
        let mut state = tcp_client(512);
        state.next_task();
        assert_eq!(
            state.update_error(code::CONNECTION_RESET),
            ProtocolOutcome::IoFailed
        );
        assert!(state.is_completed());
    }

    #[test]
    #[should_panic(expected = "exceed the transfer target")]
    fn overshooting_inflight_is_fatal() {
        let mut state = tcp_client(1_024);
        state.next_task();
        let id_task = untracked_recv(CONNECTION_ID_LENGTH);
        state.complete_task(&id_task, CONNECTION_ID_LENGTH);
        state.next_task();
        let task = tracked_task(2_048);
        state.notify_task_issued(&task);
        let _ = state.remaining_transfer();
    }
}
