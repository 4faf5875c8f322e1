//! Concrete traffic patterns.
//!
//! An [`IoPattern`] turns the protocol phase machine into actual work: it
//! hands [`IoTask`]s to the transport, validates their completions, paces
//! sends through the rate-limit policy, and keeps the per-connection
//! statistics. The pattern lock serializes every `initiate_io` /
//! `complete_io` pair on the same connection.
//!
//! Send content is a repeating 256-byte ramp so the receive side can verify
//! any chunk from its cumulative stream position alone.

pub mod state;

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::config::{PatternKind, Protocol, Settings};
use crate::error::code;
use crate::id_pool::{CONNECTION_ID_LENGTH, IdPool, Slot};
use crate::media_stream::{self, MAX_DATAGRAM_BYTES, SendRequests, START_MESSAGE};
use crate::metrics;
use crate::rate_limit::RateLimit;
use crate::stats::{ConnectionStats, TcpStats, UdpStats};
use crate::task::{BufferType, IoTask, TaskAction};

use state::{COMPLETION_MESSAGE_LENGTH, IoPatternState, ProtocolOutcome, ProtocolTask};

/// Receive size posted while waiting for the peer's FIN. Anything that
/// actually arrives there is a protocol violation.
const FIN_RECV_LENGTH: usize = 16;

/// Ticks per second for the qpc/qpf fields stamped into media frames.
const QPF_NANOS: i64 = 1_000_000_000;

/// What the transport should do after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Ask for the next task.
    ContinueIo,
    /// The transfer finished successfully; tear the connection down.
    CompletedIo,
    /// The transfer failed; tear the connection down.
    FailedIo,
}

/// Result of one completed task, as observed by the transport.
#[derive(Debug, Clone, Copy)]
pub enum IoCompletion<'a> {
    Sent { bytes: usize },
    Received { data: &'a [u8] },
    /// A graceful or hard shutdown step finished.
    Shutdown,
}

/// Which half of the connection a driver loop owns.
///
/// Transports that run one loop per direction (a duplex connection needs a
/// receive loop draining while the send loop blocks) ask for tasks through
/// [`IoPattern::initiate_io_directed`] so each loop only ever holds work
/// for its own half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Send,
    Recv,
}

/// The half of the connection a task belongs to. Shutdown steps ride with
/// the send side; a no-op task belongs to neither.
fn task_direction(task: &IoTask) -> Option<IoDirection> {
    match task.action {
        TaskAction::Send | TaskAction::GracefulShutdown | TaskAction::HardShutdown => {
            Some(IoDirection::Send)
        }
        TaskAction::Recv => Some(IoDirection::Recv),
        TaskAction::None => None,
    }
}

fn direction_allows(want: Option<IoDirection>, task: &IoTask) -> bool {
    match (want, task_direction(task)) {
        (None, _) | (_, None) => true,
        (Some(want), Some(direction)) => want == direction,
    }
}

impl IoCompletion<'_> {
    fn bytes_transferred(&self) -> usize {
        match self {
            IoCompletion::Sent { bytes } => *bytes,
            IoCompletion::Received { data } => data.len(),
            IoCompletion::Shutdown => 0,
        }
    }
}

/// Direction-specific bookkeeping per pattern shape.
enum Shape {
    /// One-way sender (Push client, Pull server).
    Send,
    /// One-way receiver (Push server, Pull client).
    Recv,
    /// Half-duplex, flipping direction every configured segment.
    PushPull {
        sending: bool,
        segment_remaining: u64,
        outstanding: bool,
    },
    /// Both directions concurrently, each owning half the transfer.
    Duplex {
        send_unissued: u64,
        recv_unissued: u64,
        prefer_send: bool,
    },
    /// UDP server: streams framed datagrams at the configured frame rate.
    MediaServer {
        id_sent: bool,
        sequence: i64,
        frame: Option<SendRequests>,
    },
    /// UDP client: sends START once, then receives and classifies frames.
    MediaClient { started: bool },
}

impl Shape {
    fn new(settings: &Settings, listening: bool, max_transfer: u64) -> Self {
        match (settings.pattern, listening) {
            (PatternKind::Push, false) | (PatternKind::Pull, true) => Shape::Send,
            (PatternKind::Push, true) | (PatternKind::Pull, false) => Shape::Recv,
            // The client pushes first; the server mirrors with receives.
            (PatternKind::PushPull, _) => Shape::PushPull {
                sending: !listening,
                segment_remaining: settings.push_bytes,
                outstanding: false,
            },
            (PatternKind::Duplex, _) => {
                let send_unissued = max_transfer / 2;
                Shape::Duplex {
                    send_unissued,
                    recv_unissued: max_transfer - send_unissued,
                    // The client leads with a send, the server with a
                    // receive, so the first exchange always has a reader.
                    prefer_send: !listening,
                }
            }
            (PatternKind::MediaStream, true) => Shape::MediaServer {
                id_sent: false,
                sequence: 0,
                frame: None,
            },
            (PatternKind::MediaStream, false) => Shape::MediaClient { started: false },
        }
    }
}

#[doc(hidden)]
pub struct PatternInner {
    state: IoPatternState,
    shape: Shape,
    rate_limit: RateLimit,
    stats: ConnectionStats,
    send_buffer: Bytes,
    /// Cumulative bytes this side has sent, for ramp alignment.
    send_position: u64,
    /// Cumulative tracked bytes received, for content verification.
    recv_position: u64,
    recv_outstanding: u32,
    /// A built task whose direction did not match the asking loop, held
    /// for the loop that owns it.
    parked: Option<IoTask>,
    connection_id: [u8; CONNECTION_ID_LENGTH],
    slot: Option<Slot>,
    last_error: u32,
    protocol_error: bool,
    completed_successfully: bool,
    finalized: bool,
}

/// One connection's traffic driver.
pub struct IoPattern {
    inner: Mutex<PatternInner>,
    settings: Arc<Settings>,
    pool: Arc<IdPool>,
    epoch: Instant,
}

impl IoPattern {
    /// Build the pattern for a connection. Servers generate the connection
    /// id here and write it into a checked-out pool slot; clients fill their
    /// slot when the id arrives.
    pub fn new(settings: Arc<Settings>, pool: Arc<IdPool>) -> Result<Arc<Self>, crate::error::Error> {
        let listening = settings.is_listening();
        let max_transfer = settings.max_transfer();
        let epoch = Instant::now();

        let slot = pool.checkout()?;
        let connection_id = if listening {
            let id = crate::stats::generate_connection_id();
            pool.write(slot, &id);
            id
        } else {
            [0u8; CONNECTION_ID_LENGTH]
        };

        let rate_limit = match settings.protocol {
            Protocol::Tcp => {
                RateLimit::from_config(settings.tcp_bytes_per_second, settings.tcp_quantum_ms, 0)
            }
            // One frame's worth of bytes per frame interval paces the
            // stream at the configured frame rate.
            Protocol::Udp if listening => {
                let quantum_ms = (1_000 / settings.udp_frames_per_second).max(1);
                RateLimit::from_config(Some(settings.udp_bits_per_second / 8), quantum_ms, 0)
            }
            Protocol::Udp => RateLimit::None,
        };

        let stats = match settings.protocol {
            Protocol::Tcp => ConnectionStats::Tcp(TcpStats::new()),
            Protocol::Udp => ConnectionStats::Udp(UdpStats::new()),
        };

        let inner = PatternInner {
            state: IoPatternState::new(
                settings.protocol,
                listening,
                settings.shutdown,
                max_transfer,
                settings.ideal_send_backlog(),
            ),
            shape: Shape::new(&settings, listening, max_transfer),
            rate_limit,
            stats,
            send_buffer: send_content(&settings),
            send_position: 0,
            recv_position: 0,
            recv_outstanding: 0,
            parked: None,
            connection_id,
            slot: Some(slot),
            last_error: code::OK,
            protocol_error: false,
            completed_successfully: false,
            finalized: false,
        };

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            settings,
            pool,
            epoch,
        }))
    }

    /// Scoped mutual exclusion over the pattern, for transports that need
    /// to couple a task to surrounding bookkeeping.
    pub fn acquire_pattern_lock(&self) -> MutexGuard<'_, PatternInner> {
        self.inner.lock()
    }

    /// Produce the next task to issue. Returns an action of `None` when the
    /// transfer is complete, failed, or waiting on outstanding IO.
    pub fn initiate_io(&self) -> IoTask {
        self.initiate(None)
    }

    /// Produce the next task for one half of the connection, for transports
    /// that run a dedicated loop per direction. A protocol step belonging
    /// to the other half is parked for that loop and this call returns a
    /// task with an action of `None`.
    pub fn initiate_io_directed(&self, direction: IoDirection) -> IoTask {
        self.initiate(Some(direction))
    }

    fn initiate(&self, want: Option<IoDirection>) -> IoTask {
        let mut inner = self.inner.lock();
        let now_ms = self.now_ms();

        // A parked step blocks nothing: the state machine pends it until
        // its loop collects it here. While it waits, the other loop builds
        // nothing new for it.
        if let Some(parked) = inner.parked.take() {
            if direction_allows(want, &parked) {
                return inner.issue(parked, now_ms);
            }
            inner.parked = Some(parked);
            return IoTask::none();
        }

        let task = match inner.state.next_task() {
            ProtocolTask::NoIo => IoTask::none(),
            ProtocolTask::SendConnectionId => {
                let id = Bytes::copy_from_slice(&inner.connection_id);
                IoTask::send(id, 0, CONNECTION_ID_LENGTH, BufferType::TcpConnectionId, false)
            }
            ProtocolTask::RecvConnectionId => {
                IoTask::recv(CONNECTION_ID_LENGTH, BufferType::TcpConnectionId, false)
            }
            ProtocolTask::MoreIo => inner.next_more_io(want, &self.settings, self.epoch),
            ProtocolTask::SendCompletion => {
                let status = Bytes::copy_from_slice(&inner.last_error.to_le_bytes());
                IoTask::send(status, 0, COMPLETION_MESSAGE_LENGTH, BufferType::Static, false)
            }
            ProtocolTask::RecvCompletion => {
                IoTask::recv(COMPLETION_MESSAGE_LENGTH, BufferType::Static, false)
            }
            ProtocolTask::GracefulShutdown => IoTask::shutdown(TaskAction::GracefulShutdown),
            ProtocolTask::HardShutdown => IoTask::shutdown(TaskAction::HardShutdown),
            ProtocolTask::RequestFin => IoTask::recv(FIN_RECV_LENGTH, BufferType::Static, false),
        };

        if !direction_allows(want, &task) {
            inner.parked = Some(task);
            return IoTask::none();
        }
        inner.issue(task, now_ms)
    }

    /// Validate a completion, update counters, and report whether the
    /// transport should continue, finish, or fail the connection.
    pub fn complete_io(&self, task: &IoTask, completion: IoCompletion<'_>, error_code: u32) -> IoStatus {
        let mut inner = self.inner.lock();

        if task.action == TaskAction::Recv {
            debug_assert!(inner.recv_outstanding > 0);
            inner.recv_outstanding -= 1;
        }

        if error_code != code::OK
            && inner.state.update_error(error_code) == ProtocolOutcome::IoFailed
        {
            inner.record_error(error_code);
            return IoStatus::FailedIo;
        }
        // A benign error (a server waiting for the FIN seeing the client's
        // RST) falls through: the zero-byte completion finishes the session.

        // Content and framing validation before the state machine moves.
        // Non-data media frames (id, START, framing errors) do not count
        // toward the transfer.
        let bytes = match completion {
            IoCompletion::Received { data } => {
                match inner.validate_received(task, data, &self.settings, &self.pool) {
                    Ok(counted) => counted,
                    Err(status) => return status,
                }
            }
            other => other.bytes_transferred(),
        };

        if task.track_io {
            match task.action {
                TaskAction::Send => {
                    inner.send_position += bytes as u64;
                    if self.settings.protocol == Protocol::Tcp {
                        inner.stats.tcp().bytes_sent += bytes as u64;
                    }
                }
                TaskAction::Recv => {
                    inner.recv_position += bytes as u64;
                    if self.settings.protocol == Protocol::Tcp {
                        inner.stats.tcp().bytes_recv += bytes as u64;
                    }
                }
                _ => {}
            }
        }

        inner.update_shape(task, bytes, &self.settings);

        match inner.state.complete_task(task, bytes) {
            ProtocolOutcome::NoError => IoStatus::ContinueIo,
            ProtocolOutcome::SuccessfullyCompleted => {
                inner.completed_successfully = true;
                IoStatus::CompletedIo
            }
            ProtocolOutcome::TooManyBytes
            | ProtocolOutcome::TooFewBytes
            | ProtocolOutcome::CorruptedBytes => {
                inner.record_protocol_error();
                IoStatus::FailedIo
            }
            ProtocolOutcome::IoFailed => IoStatus::FailedIo,
        }
    }

    /// The sticky first error recorded on this connection.
    pub fn last_error(&self) -> u32 {
        self.inner.lock().last_error
    }

    /// Whether the transfer reached successful completion.
    pub fn completed_successfully(&self) -> bool {
        self.inner.lock().completed_successfully
    }

    /// Whether the pattern reached a terminal state, successful or failed.
    /// While this is false, a task returned with an action of `None` means
    /// other in-flight work must complete before more exists.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().state.is_completed()
    }

    /// Whether the failure was a transfer-protocol violation rather than a
    /// transport error.
    pub fn protocol_error(&self) -> bool {
        self.inner.lock().protocol_error
    }

    /// The connection id: generated locally on servers, learned from the
    /// peer on clients.
    pub fn connection_id(&self) -> [u8; CONNECTION_ID_LENGTH] {
        self.inner.lock().connection_id
    }

    /// Fold statistics into the run-wide counters and return the id slot.
    /// Called once from the owning socket's teardown.
    pub fn finalize(&self) {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return;
        }
        inner.finalized = true;
        inner.stats.publish();
        if let Some(slot) = inner.slot.take() {
            self.pool.checkin(slot);
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl PatternInner {
    /// Final bookkeeping on a task leaving the pattern: pacing, receive
    /// accounting, and in-flight byte tracking.
    fn issue(&mut self, mut task: IoTask, now_ms: u64) -> IoTask {
        if task.action == TaskAction::Send {
            let len = task.length() as u64;
            self.rate_limit.update_offset(&mut task, len, now_ms);
        }
        if task.action == TaskAction::Recv {
            self.recv_outstanding += 1;
        }
        self.state.notify_task_issued(&task);
        task
    }

    /// Shape-specific MoreIo task selection. `want` restricts the task to
    /// one half of the connection for direction-pinned driver loops.
    fn next_more_io(
        &mut self,
        want: Option<IoDirection>,
        settings: &Settings,
        epoch: Instant,
    ) -> IoTask {
        let remaining = self.state.remaining_transfer();
        if remaining == 0 {
            return IoTask::none();
        }
        let buffer_size = settings.max_buffer_size as u64;

        match &mut self.shape {
            Shape::Send => {
                if want == Some(IoDirection::Recv) {
                    return IoTask::none();
                }
                let backlog = self.state.ideal_send_backlog();
                let inflight = self.state.inflight_bytes();
                if inflight >= backlog {
                    return IoTask::none();
                }
                let len = buffer_size.min(remaining).min(backlog - inflight) as usize;
                ramp_send(&self.send_buffer, self.send_position, len, settings)
            }
            Shape::Recv => {
                if want == Some(IoDirection::Send) {
                    return IoTask::none();
                }
                if self.recv_outstanding >= settings.prepost_recvs.max(1) {
                    return IoTask::none();
                }
                let len = buffer_size.min(remaining) as usize;
                IoTask::recv(len, tracked_type(settings), true)
            }
            Shape::PushPull { sending, segment_remaining, outstanding } => {
                if *outstanding {
                    return IoTask::none();
                }
                match want {
                    Some(IoDirection::Send) if !*sending => return IoTask::none(),
                    Some(IoDirection::Recv) if *sending => return IoTask::none(),
                    _ => {}
                }
                let len = buffer_size.min(remaining).min(*segment_remaining) as usize;
                *outstanding = true;
                if *sending {
                    ramp_send(&self.send_buffer, self.send_position, len, settings)
                } else {
                    IoTask::recv(len, tracked_type(settings), true)
                }
            }
            Shape::Duplex { send_unissued, recv_unissued, prefer_send } => {
                let do_send = match want {
                    // A direction-pinned loop only ever takes its own half.
                    Some(IoDirection::Send) => *send_unissued > 0,
                    Some(IoDirection::Recv) => false,
                    // A single serial loop alternates so neither half
                    // starves the other.
                    None => {
                        let send_first = *prefer_send;
                        *prefer_send = !*prefer_send;
                        if send_first {
                            *send_unissued > 0
                        } else {
                            *recv_unissued == 0 && *send_unissued > 0
                        }
                    }
                };
                if do_send {
                    let len = buffer_size.min(*send_unissued) as usize;
                    *send_unissued -= len as u64;
                    ramp_send(&self.send_buffer, self.send_position, len, settings)
                } else if want != Some(IoDirection::Send) && *recv_unissued > 0 {
                    if self.recv_outstanding >= settings.prepost_recvs.max(1) {
                        return IoTask::none();
                    }
                    let len = buffer_size.min(*recv_unissued) as usize;
                    *recv_unissued -= len as u64;
                    IoTask::recv(len, tracked_type(settings), true)
                } else {
                    IoTask::none()
                }
            }
            Shape::MediaServer { id_sent, sequence, frame } => {
                if want == Some(IoDirection::Recv) {
                    return IoTask::none();
                }
                if !*id_sent {
                    *id_sent = true;
                    let datagram = media_stream::encode_connection_id(&self.connection_id);
                    let len = datagram.len();
                    return IoTask::send(datagram, 0, len, BufferType::UdpConnectionId, false);
                }
                let spec = loop {
                    match frame {
                        Some(requests) => match requests.next() {
                            Some(spec) => break spec,
                            None => {
                                *frame = None;
                                *sequence += 1;
                            }
                        },
                        // A new frame starts on a frame-size boundary of
                        // the remaining transfer.
                        None => *frame = Some(SendRequests::new(
                            settings.udp_bytes_per_frame().min(remaining),
                        )),
                    }
                };
                let qpc = epoch.elapsed().as_nanos() as i64;
                let offset = (self.send_position % 256) as usize;
                let payload = &self.send_buffer[offset..offset + spec.payload_len];
                let datagram = media_stream::encode_data(*sequence, qpc, QPF_NANOS, payload);
                let len = datagram.len();
                IoTask::send(datagram, 0, len, BufferType::MediaStreamData, true)
            }
            Shape::MediaClient { started } => {
                if !*started {
                    if want == Some(IoDirection::Recv) {
                        return IoTask::none();
                    }
                    *started = true;
                    let start = Bytes::from_static(START_MESSAGE);
                    let len = start.len();
                    return IoTask::send(start, 0, len, BufferType::Static, false);
                }
                if want == Some(IoDirection::Send) {
                    return IoTask::none();
                }
                if self.recv_outstanding >= settings.prepost_recvs.max(1) {
                    return IoTask::none();
                }
                let len = (MAX_DATAGRAM_BYTES as u64).min(remaining) as usize;
                IoTask::recv(len, BufferType::MediaStreamData, true)
            }
        }
    }

    /// Validate received content before the state machine advances and
    /// return the byte count that counts toward the transfer. A content
    /// violation fails the connection immediately.
    fn validate_received(
        &mut self,
        task: &IoTask,
        data: &[u8],
        settings: &Settings,
        pool: &IdPool,
    ) -> Result<usize, IoStatus> {
        match task.buffer_type {
            BufferType::TcpConnectionId => {
                if data.len() == CONNECTION_ID_LENGTH {
                    self.connection_id.copy_from_slice(data);
                    if let Some(slot) = self.slot {
                        pool.write(slot, &self.connection_id);
                    }
                }
                Ok(data.len())
            }
            BufferType::MediaStreamData => match media_stream::decode(data) {
                Ok(media_stream::Frame::Data { sequence, qpc, qpf, .. }) => {
                    self.stats.udp().record_frame(sequence, qpc, qpf, data.len());
                    Ok(data.len())
                }
                Ok(media_stream::Frame::ConnectionId(id)) => {
                    self.connection_id.copy_from_slice(id);
                    if let Some(slot) = self.slot {
                        pool.write(slot, &self.connection_id);
                    }
                    Ok(0)
                }
                Ok(media_stream::Frame::Start) | Err(_) => {
                    self.stats.udp().record_error_frame();
                    Ok(0)
                }
            },
            BufferType::Static | BufferType::Tracked => {
                if task.track_io && settings.verify_buffers {
                    let position = self.recv_position;
                    if let Some(at) = verify_ramp(position, data) {
                        tracing::debug!(
                            position = position + at as u64,
                            "received byte diverges from the send pattern"
                        );
                        self.state.fail_corrupted();
                        self.record_protocol_error();
                        return Err(IoStatus::FailedIo);
                    }
                }
                Ok(data.len())
            }
            BufferType::UdpConnectionId => Ok(data.len()),
        }
    }

    /// Per-shape bookkeeping after a completion.
    fn update_shape(&mut self, task: &IoTask, bytes: usize, settings: &Settings) {
        if !task.track_io {
            return;
        }
        let listening = settings.is_listening();
        match &mut self.shape {
            Shape::PushPull { sending, segment_remaining, outstanding } => {
                *outstanding = false;
                *segment_remaining = segment_remaining.saturating_sub(bytes as u64);
                if *segment_remaining == 0 {
                    *sending = !*sending;
                    // Push segments are the client's sends; pull segments
                    // are the server's.
                    *segment_remaining = if *sending != listening {
                        settings.push_bytes
                    } else {
                        settings.pull_bytes
                    };
                }
            }
            Shape::Duplex { send_unissued, recv_unissued, .. } => {
                // A short completion returns the shortfall to its direction
                // so the tail is re-issued.
                let shortfall = task.length().saturating_sub(bytes) as u64;
                if shortfall > 0 {
                    match task.action {
                        TaskAction::Send => *send_unissued += shortfall,
                        TaskAction::Recv => *recv_unissued += shortfall,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    fn record_error(&mut self, error_code: u32) {
        if self.last_error == code::OK {
            self.last_error = error_code;
        }
    }

    fn record_protocol_error(&mut self) {
        if !self.protocol_error {
            self.protocol_error = true;
            metrics::PROTOCOL_ERRORS.increment();
        }
        self.record_error(code::PROTOCOL_VIOLATION);
    }
}

/// Build a tracked send task slicing the ramp at the stream position.
fn ramp_send(send_buffer: &Bytes, position: u64, len: usize, settings: &Settings) -> IoTask {
    let offset = (position % 256) as usize;
    IoTask::send(send_buffer.clone(), offset, len, tracked_type(settings), true)
}

fn tracked_type(settings: &Settings) -> BufferType {
    if settings.use_shared_buffer { BufferType::Static } else { BufferType::Tracked }
}

/// Check received bytes against the ramp from `position`; returns the
/// offset of the first diverging byte.
fn verify_ramp(position: u64, data: &[u8]) -> Option<usize> {
    data.iter()
        .enumerate()
        .find(|&(i, &byte)| byte != ((position + i as u64) & 0xff) as u8)
        .map(|(i, _)| i)
}

/// The send content: a repeating 0..=255 ramp with one extra period so a
/// send of any supported size can start at any ramp offset.
fn send_content(settings: &Settings) -> Bytes {
    static SHARED: OnceLock<Bytes> = OnceLock::new();
    let span = settings.max_buffer_size.max(MAX_DATAGRAM_BYTES);
    let build = move || -> Bytes {
        (0..span + 256).map(|i| (i & 0xff) as u8).collect::<Vec<u8>>().into()
    };
    if settings.use_shared_buffer {
        SHARED.get_or_init(build).clone()
    } else {
        build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, ShutdownKind};

    fn client_settings(max_transfer: u64) -> Arc<Settings> {
        Arc::new(Settings {
            target_addresses: vec!["127.0.0.1:4444".parse().unwrap()],
            transfer_size: max_transfer,
            max_buffer_size: 4_096,
            min_buffer_size: 4_096,
            ..Settings::default()
        })
    }

    fn drive_send(pattern: &IoPattern, task: &IoTask) -> IoStatus {
        let bytes = task.length();
        pattern.complete_io(task, IoCompletion::Sent { bytes }, code::OK)
    }

    #[test]
    fn push_client_runs_the_full_session() {
        let settings = client_settings(8_192);
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        // Connection id first.
        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::Recv);
        assert_eq!(task.buffer_type, BufferType::TcpConnectionId);
        let id = crate::stats::generate_connection_id();
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Received { data: &id }, code::OK),
            IoStatus::ContinueIo
        );
        assert_eq!(pattern.connection_id(), id);

        // Two buffer-sized sends cover the transfer.
        for _ in 0..2 {
            let task = pattern.initiate_io();
            assert_eq!(task.action, TaskAction::Send);
            assert!(task.track_io);
            assert_eq!(task.length(), 4_096);
            assert_eq!(drive_send(&pattern, &task), IoStatus::ContinueIo);
        }

        // Completion status word from the server.
        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::Recv);
        assert_eq!(task.length(), COMPLETION_MESSAGE_LENGTH);
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Received { data: &[0; 4] }, code::OK),
            IoStatus::ContinueIo
        );

        // Graceful shutdown, then the FIN.
        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::GracefulShutdown);
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Shutdown, code::OK),
            IoStatus::ContinueIo
        );

        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::Recv);
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Received { data: &[] }, code::OK),
            IoStatus::CompletedIo
        );
        assert!(pattern.completed_successfully());
        assert_eq!(pattern.last_error(), code::OK);
        pattern.finalize();
    }

    #[test]
    fn send_content_follows_the_ramp() {
        let settings = client_settings(8_192);
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        let task = pattern.initiate_io();
        let id = crate::stats::generate_connection_id();
        pattern.complete_io(&task, IoCompletion::Received { data: &id }, code::OK);

        let first = pattern.initiate_io();
        let head: Vec<u8> = first.payload().to_vec();
        assert_eq!(head[0], 0);
        assert_eq!(head[255], 255);
        assert_eq!(head[256], 0);
        drive_send(&pattern, &first);

        // The second send picks up the ramp where the first left off.
        let second = pattern.initiate_io();
        assert_eq!(second.payload()[0], (4_096 % 256) as u8);
    }

    #[test]
    fn pull_client_verifies_received_content() {
        let settings = Arc::new(Settings {
            pattern: PatternKind::Pull,
            verify_buffers: true,
            ..(*client_settings(4_096)).clone()
        });
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        let task = pattern.initiate_io();
        let id = crate::stats::generate_connection_id();
        pattern.complete_io(&task, IoCompletion::Received { data: &id }, code::OK);

        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::Recv);
        assert!(task.track_io);

        // Valid ramp content continues the transfer.
        let good: Vec<u8> = (0..2_048u64).map(|i| (i & 0xff) as u8).collect();
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Received { data: &good }, code::OK),
            IoStatus::ContinueIo
        );

        // Content off the ramp is a protocol violation.
        let task = pattern.initiate_io();
        let bad = vec![0xFFu8; 512];
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Received { data: &bad }, code::OK),
            IoStatus::FailedIo
        );
        assert!(pattern.protocol_error());
        assert_eq!(pattern.last_error(), code::PROTOCOL_VIOLATION);
        pattern.finalize();
    }

    #[test]
    fn duplex_splits_the_transfer_between_directions() {
        let settings = Arc::new(Settings {
            pattern: PatternKind::Duplex,
            ..(*client_settings(16_384)).clone()
        });
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        let task = pattern.initiate_io();
        let id = crate::stats::generate_connection_id();
        pattern.complete_io(&task, IoCompletion::Received { data: &id }, code::OK);

        let mut sent = 0u64;
        let mut received = 0u64;
        let mut last = IoStatus::ContinueIo;
        while last == IoStatus::ContinueIo {
            let task = pattern.initiate_io();
            match task.action {
                TaskAction::Send => {
                    sent += task.length() as u64;
                    last = drive_send(&pattern, &task);
                }
                TaskAction::Recv if task.track_io => {
                    let data: Vec<u8> = (received..received + task.length() as u64)
                        .map(|i| (i & 0xff) as u8)
                        .collect();
                    received += task.length() as u64;
                    last = pattern.complete_io(
                        &task,
                        IoCompletion::Received { data: &data },
                        code::OK,
                    );
                }
                TaskAction::Recv => {
                    // The 4-byte completion word, then the zero-byte FIN.
                    let data: &[u8] =
                        if task.length() == COMPLETION_MESSAGE_LENGTH { &[0; 4] } else { &[] };
                    last = pattern.complete_io(
                        &task,
                        IoCompletion::Received { data },
                        code::OK,
                    );
                }
                TaskAction::GracefulShutdown => {
                    last = pattern.complete_io(&task, IoCompletion::Shutdown, code::OK);
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(last, IoStatus::CompletedIo);
        assert_eq!(sent, 8_192);
        assert_eq!(received, 8_192);
        pattern.finalize();
    }

    #[test]
    fn duplex_directed_loops_only_see_their_own_half() {
        let settings = Arc::new(Settings {
            pattern: PatternKind::Duplex,
            ..(*client_settings(16_384)).clone()
        });
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        // The protocol opens with the id recv; the send loop cannot take
        // it, so it parks for the receive loop.
        let task = pattern.initiate_io_directed(IoDirection::Send);
        assert_eq!(task.action, TaskAction::None);
        let id_task = pattern.initiate_io_directed(IoDirection::Recv);
        assert_eq!(id_task.action, TaskAction::Recv);
        assert_eq!(id_task.buffer_type, BufferType::TcpConnectionId);
        let id = crate::stats::generate_connection_id();
        pattern.complete_io(&id_task, IoCompletion::Received { data: &id }, code::OK);

        // Both halves make independent progress, 4_096 bytes per task.
        let mut received = 0u64;
        for _ in 0..2 {
            let send = pattern.initiate_io_directed(IoDirection::Send);
            assert_eq!(send.action, TaskAction::Send);
            let recv = pattern.initiate_io_directed(IoDirection::Recv);
            assert_eq!(recv.action, TaskAction::Recv);

            assert_eq!(drive_send(&pattern, &send), IoStatus::ContinueIo);
            let data: Vec<u8> = (received..received + recv.length() as u64)
                .map(|i| (i & 0xff) as u8)
                .collect();
            received += recv.length() as u64;
            pattern.complete_io(&recv, IoCompletion::Received { data: &data }, code::OK);
        }

        // The send half is spent: its loop idles while the receive loop
        // runs the completion exchange.
        assert_eq!(pattern.initiate_io_directed(IoDirection::Send).action, TaskAction::None);
        assert!(!pattern.is_complete());

        let completion = pattern.initiate_io_directed(IoDirection::Recv);
        assert_eq!(completion.action, TaskAction::Recv);
        assert_eq!(completion.length(), COMPLETION_MESSAGE_LENGTH);
        pattern.complete_io(&completion, IoCompletion::Received { data: &[0; 4] }, code::OK);

        // The shutdown step belongs to the send side and parks until that
        // loop asks.
        assert_eq!(pattern.initiate_io_directed(IoDirection::Recv).action, TaskAction::None);
        let shutdown = pattern.initiate_io_directed(IoDirection::Send);
        assert_eq!(shutdown.action, TaskAction::GracefulShutdown);
        pattern.complete_io(&shutdown, IoCompletion::Shutdown, code::OK);

        // And the FIN wait goes back to the receive side.
        assert_eq!(pattern.initiate_io_directed(IoDirection::Send).action, TaskAction::None);
        let fin = pattern.initiate_io_directed(IoDirection::Recv);
        assert_eq!(fin.action, TaskAction::Recv);
        assert_eq!(
            pattern.complete_io(&fin, IoCompletion::Received { data: &[] }, code::OK),
            IoStatus::CompletedIo
        );
        assert!(pattern.is_complete());
        pattern.finalize();
    }

    #[test]
    fn pushpull_flips_direction_every_segment() {
        let settings = Arc::new(Settings {
            pattern: PatternKind::PushPull,
            push_bytes: 4_096,
            pull_bytes: 8_192,
            ..(*client_settings(24_576)).clone()
        });
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        let task = pattern.initiate_io();
        let id = crate::stats::generate_connection_id();
        pattern.complete_io(&task, IoCompletion::Received { data: &id }, code::OK);

        // Client: push 4_096, pull 8_192, push 4_096, pull 8_192.
        let mut expect_send = true;
        let mut segment = 4_096u64;
        let mut received = 0u64;
        for _ in 0..4 {
            let mut segment_left = segment;
            while segment_left > 0 {
                let task = pattern.initiate_io();
                if expect_send {
                    assert_eq!(task.action, TaskAction::Send, "expected a push segment");
                    segment_left -= task.length() as u64;
                    assert_eq!(drive_send(&pattern, &task), IoStatus::ContinueIo);
                } else {
                    assert_eq!(task.action, TaskAction::Recv, "expected a pull segment");
                    let data: Vec<u8> = (received..received + task.length() as u64)
                        .map(|i| (i & 0xff) as u8)
                        .collect();
                    received += task.length() as u64;
                    segment_left -= task.length() as u64;
                    assert_eq!(
                        pattern.complete_io(&task, IoCompletion::Received { data: &data }, code::OK),
                        IoStatus::ContinueIo
                    );
                }
            }
            expect_send = !expect_send;
            segment = if expect_send { 4_096 } else { 8_192 };
        }

        // Transfer covered: the completion exchange follows.
        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::Recv);
        assert_eq!(task.length(), COMPLETION_MESSAGE_LENGTH);
        pattern.finalize();
    }

    #[test]
    fn media_server_leads_with_id_then_paced_frames() {
        let settings = Arc::new(Settings {
            protocol: Protocol::Udp,
            role: Role::Listen,
            pattern: PatternKind::MediaStream,
            listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            udp_bits_per_second: 80_000,
            udp_frames_per_second: 10,
            udp_stream_duration: std::time::Duration::from_secs(1),
            ..Settings::default()
        });
        settings.validate().unwrap();
        // 10 KB/s at 10 fps: 1_000 bytes per frame, 10 frames total.
        assert_eq!(settings.udp_bytes_per_frame(), 1_000);
        let pool = Arc::new(IdPool::server());
        let pattern = IoPattern::new(settings, pool).unwrap();

        let id_task = pattern.initiate_io();
        assert_eq!(id_task.buffer_type, BufferType::UdpConnectionId);
        assert!(!id_task.track_io);
        assert_eq!(id_task.length(), media_stream::ID_FRAME_LENGTH);
        assert_eq!(drive_send(&pattern, &id_task), IoStatus::ContinueIo);

        let mut frames = 0;
        loop {
            let task = pattern.initiate_io();
            assert_eq!(task.action, TaskAction::Send);
            assert_eq!(task.buffer_type, BufferType::MediaStreamData);
            assert_eq!(task.length(), 1_000);
            match media_stream::decode(task.payload()).unwrap() {
                media_stream::Frame::Data { sequence, .. } => assert_eq!(sequence, frames),
                other => panic!("unexpected frame {other:?}"),
            }
            frames += 1;
            match drive_send(&pattern, &task) {
                IoStatus::ContinueIo => {}
                IoStatus::CompletedIo => break,
                IoStatus::FailedIo => panic!("stream failed"),
            }
        }
        assert_eq!(frames, 10);
        assert!(pattern.completed_successfully());
        pattern.finalize();
    }

    #[test]
    fn media_client_ignores_id_frames_for_transfer_accounting() {
        let settings = Arc::new(Settings {
            protocol: Protocol::Udp,
            pattern: PatternKind::MediaStream,
            target_addresses: vec!["127.0.0.1:4444".parse().unwrap()],
            udp_bits_per_second: 80_000,
            udp_frames_per_second: 10,
            udp_stream_duration: std::time::Duration::from_secs(1),
            ..Settings::default()
        });
        let pool = Arc::new(IdPool::client(2));
        let pattern = IoPattern::new(settings, pool).unwrap();

        // START control message goes out first.
        let start = pattern.initiate_io();
        assert_eq!(start.action, TaskAction::Send);
        assert_eq!(start.payload(), b"START");
        assert!(!start.track_io);
        assert_eq!(drive_send(&pattern, &start), IoStatus::ContinueIo);

        // The server's id frame arrives; it does not advance the transfer.
        let task = pattern.initiate_io();
        assert_eq!(task.action, TaskAction::Recv);
        let server_id = crate::stats::generate_connection_id();
        let id_frame = media_stream::encode_connection_id(&server_id);
        assert_eq!(
            pattern.complete_io(&task, IoCompletion::Received { data: &id_frame }, code::OK),
            IoStatus::ContinueIo
        );
        assert_eq!(pattern.connection_id(), server_id);

        // Ten 1_000-byte data frames complete the stream.
        for sequence in 0..10 {
            let task = pattern.initiate_io();
            assert_eq!(task.action, TaskAction::Recv);
            let payload = vec![0x42u8; 1_000 - media_stream::DATA_HEADER_LENGTH];
            let frame = media_stream::encode_data(sequence, sequence * 100, QPF_NANOS, &payload);
            let status =
                pattern.complete_io(&task, IoCompletion::Received { data: &frame }, code::OK);
            if sequence == 9 {
                assert_eq!(status, IoStatus::CompletedIo);
            } else {
                assert_eq!(status, IoStatus::ContinueIo);
            }
        }
        assert!(pattern.completed_successfully());
        pattern.finalize();
    }
}
