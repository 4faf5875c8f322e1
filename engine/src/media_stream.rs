//! UDP media-stream wire format.
//!
//! Datagrams are little-endian. A data frame carries a 2-byte protocol flag,
//! an 8-byte sequence number, the sender's 8-byte monotonic counter (QPC)
//! and its 8-byte frequency (QPF), then the payload. An id frame carries the
//! flag followed by the 32-byte connection id. The session-start control
//! message is the bare ASCII bytes `START` with no header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::id_pool::CONNECTION_ID_LENGTH;

/// Protocol flag for a data frame.
pub const PROTOCOL_FLAG_DATA: u16 = 0x0000;
/// Protocol flag for a connection-id frame.
pub const PROTOCOL_FLAG_ID: u16 = 0x1000;

pub const PROTOCOL_FLAG_LENGTH: usize = 2;
pub const SEQUENCE_NUMBER_LENGTH: usize = 8;
pub const QPC_LENGTH: usize = 8;
pub const QPF_LENGTH: usize = 8;

/// Byte length of a data-frame header (flag + sequence + qpc + qpf).
pub const DATA_HEADER_LENGTH: usize =
    PROTOCOL_FLAG_LENGTH + SEQUENCE_NUMBER_LENGTH + QPC_LENGTH + QPF_LENGTH;

/// Byte length of a connection-id frame (flag + id).
pub const ID_FRAME_LENGTH: usize = PROTOCOL_FLAG_LENGTH + CONNECTION_ID_LENGTH;

/// Largest datagram the stream will emit.
pub const MAX_DATAGRAM_BYTES: usize = 64_000;

/// Session-start control message.
pub const START_MESSAGE: &[u8] = b"START";

/// A decoded datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// The 5-byte START control message.
    Start,
    /// A connection-id frame.
    ConnectionId(&'a [u8; CONNECTION_ID_LENGTH]),
    /// A data frame.
    Data {
        sequence: i64,
        qpc: i64,
        qpf: i64,
        payload: &'a [u8],
    },
}

/// Framing violations surfaced when decoding a datagram.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("datagram of {0} bytes is shorter than the protocol flag")]
    TooShort(usize),
    #[error("data frame of {0} bytes is shorter than the data header")]
    TruncatedData(usize),
    #[error("id frame of {0} bytes is shorter than flag plus connection id")]
    TruncatedId(usize),
    #[error("unknown protocol flag {0:#06x}")]
    UnknownFlag(u16),
}

/// Encode a data frame into a standalone datagram.
pub fn encode_data(sequence: i64, qpc: i64, qpf: i64, payload: &[u8]) -> Bytes {
    debug_assert!(DATA_HEADER_LENGTH + payload.len() <= MAX_DATAGRAM_BYTES);
    let mut buf = BytesMut::with_capacity(DATA_HEADER_LENGTH + payload.len());
    buf.put_u16_le(PROTOCOL_FLAG_DATA);
    buf.put_i64_le(sequence);
    buf.put_i64_le(qpc);
    buf.put_i64_le(qpf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a connection-id frame.
pub fn encode_connection_id(id: &[u8; CONNECTION_ID_LENGTH]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ID_FRAME_LENGTH);
    buf.put_u16_le(PROTOCOL_FLAG_ID);
    buf.put_slice(id);
    buf.freeze()
}

/// Decode a received datagram.
pub fn decode(datagram: &[u8]) -> Result<Frame<'_>, FrameError> {
    if datagram == START_MESSAGE {
        return Ok(Frame::Start);
    }
    if datagram.len() < PROTOCOL_FLAG_LENGTH {
        return Err(FrameError::TooShort(datagram.len()));
    }
    let flag = u16::from_le_bytes([datagram[0], datagram[1]]);
    match flag {
        PROTOCOL_FLAG_DATA => {
            if datagram.len() < DATA_HEADER_LENGTH {
                return Err(FrameError::TruncatedData(datagram.len()));
            }
            let read_i64 = |at: usize| {
                i64::from_le_bytes(datagram[at..at + 8].try_into().expect("8-byte field"))
            };
            Ok(Frame::Data {
                sequence: read_i64(PROTOCOL_FLAG_LENGTH),
                qpc: read_i64(PROTOCOL_FLAG_LENGTH + SEQUENCE_NUMBER_LENGTH),
                qpf: read_i64(PROTOCOL_FLAG_LENGTH + SEQUENCE_NUMBER_LENGTH + QPC_LENGTH),
                payload: &datagram[DATA_HEADER_LENGTH..],
            })
        }
        PROTOCOL_FLAG_ID => {
            if datagram.len() < ID_FRAME_LENGTH {
                return Err(FrameError::TruncatedId(datagram.len()));
            }
            let id: &[u8; CONNECTION_ID_LENGTH] = datagram
                [PROTOCOL_FLAG_LENGTH..ID_FRAME_LENGTH]
                .try_into()
                .expect("fixed-length connection id");
            Ok(Frame::ConnectionId(id))
        }
        other => Err(FrameError::UnknownFlag(other)),
    }
}

/// Sizes the sequence of datagrams that carries `bytes_to_send` bytes.
///
/// Each emitted datagram is at most [`MAX_DATAGRAM_BYTES`] including its
/// header. When a full-size datagram would leave a remainder of more than
/// zero but no more than a header, the current datagram is shrunk so the
/// next one still has room for the header plus at least one payload byte.
pub struct SendRequests {
    bytes_remaining: u64,
}

/// One datagram's worth of the pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramSpec {
    /// Payload bytes to place after the data header.
    pub payload_len: usize,
}

impl DatagramSpec {
    /// Total wire size of this datagram.
    #[inline]
    pub fn wire_len(&self) -> usize {
        DATA_HEADER_LENGTH + self.payload_len
    }
}

impl SendRequests {
    /// `bytes_to_send` must exceed the data header: a send request that
    /// cannot fit a single payload byte is a caller bug.
    pub fn new(bytes_to_send: u64) -> Self {
        assert!(
            bytes_to_send > DATA_HEADER_LENGTH as u64,
            "media-stream send of {bytes_to_send} bytes does not exceed the data header"
        );
        Self { bytes_remaining: bytes_to_send }
    }
}

impl Iterator for SendRequests {
    type Item = DatagramSpec;

    fn next(&mut self) -> Option<DatagramSpec> {
        if self.bytes_remaining == 0 {
            return None;
        }

        let mut total = if self.bytes_remaining > MAX_DATAGRAM_BYTES as u64 {
            MAX_DATAGRAM_BYTES
        } else {
            self.bytes_remaining as usize
        };

        let remaining_after = self.bytes_remaining - total as u64;
        if remaining_after > 0 && remaining_after <= DATA_HEADER_LENGTH as u64 {
            // Leave the next datagram enough for its header and one byte.
            let delta = DATA_HEADER_LENGTH as u64 + 1 - remaining_after;
            total -= delta as usize;
        }

        self.bytes_remaining -= total as u64;
        Some(DatagramSpec { payload_len: total - DATA_HEADER_LENGTH })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trip() {
        let payload = [0x5Au8; 300];
        let datagram = encode_data(7, 123_456_789, 10_000_000, &payload);
        match decode(&datagram).unwrap() {
            Frame::Data { sequence, qpc, qpf, payload: p } => {
                assert_eq!(sequence, 7);
                assert_eq!(qpc, 123_456_789);
                assert_eq!(qpf, 10_000_000);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn known_wire_layout() {
        let datagram = encode_data(42, 0x1122334455667788, 10_000_000, &[0xAA; 100]);
        assert_eq!(datagram.len(), 126);
        let expected_prefix: [u8; 26] = [
            0x00, 0x00, // data flag
            0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // sequence 42
            0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // qpc
            0x80, 0x96, 0x98, 0x00, 0x00, 0x00, 0x00, 0x00, // qpf 10_000_000
        ];
        assert_eq!(&datagram[..DATA_HEADER_LENGTH], expected_prefix);
        assert!(datagram[DATA_HEADER_LENGTH..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn id_frame_round_trip() {
        let id = [0x3Cu8; CONNECTION_ID_LENGTH];
        let datagram = encode_connection_id(&id);
        assert_eq!(datagram.len(), ID_FRAME_LENGTH);
        assert_eq!(decode(&datagram).unwrap(), Frame::ConnectionId(&id));
    }

    #[test]
    fn start_message_decodes() {
        assert_eq!(decode(b"START").unwrap(), Frame::Start);
    }

    #[test]
    fn rejects_unknown_flag_and_truncation() {
        assert_eq!(decode(&[0x01]), Err(FrameError::TooShort(1)));
        assert_eq!(decode(&[0x34, 0x12]), Err(FrameError::UnknownFlag(0x1234)));
        assert_eq!(decode(&[0x00, 0x00, 0x01]), Err(FrameError::TruncatedData(3)));
        assert_eq!(decode(&[0x00, 0x10, 0x01]), Err(FrameError::TruncatedId(3)));
    }

    #[test]
    fn send_requests_single_datagram() {
        let specs: Vec<_> = SendRequests::new(126).collect();
        assert_eq!(specs, vec![DatagramSpec { payload_len: 100 }]);
    }

    #[test]
    fn send_requests_splits_at_max_datagram() {
        let total = 2 * MAX_DATAGRAM_BYTES as u64;
        let specs: Vec<_> = SendRequests::new(total).collect();
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.wire_len() == MAX_DATAGRAM_BYTES));
        let sent: u64 = specs.iter().map(|s| s.wire_len() as u64).sum();
        assert_eq!(sent, total);
    }

    #[test]
    fn send_requests_never_leaves_a_header_sized_tail() {
        // A full datagram would leave exactly one header behind; the
        // current datagram shrinks so the tail fits a header plus one byte.
        let total = MAX_DATAGRAM_BYTES as u64 + DATA_HEADER_LENGTH as u64;
        let specs: Vec<_> = SendRequests::new(total).collect();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].wire_len(), MAX_DATAGRAM_BYTES - 1);
        assert_eq!(specs[1].wire_len(), DATA_HEADER_LENGTH + 1);
        let sent: u64 = specs.iter().map(|s| s.wire_len() as u64).sum();
        assert_eq!(sent, total);
    }

    #[test]
    fn send_requests_exhaustive_remainders() {
        // Every remainder in (0, header] must be rolled forward so each
        // datagram past the first still exceeds the bare header.
        for tail in 1..=DATA_HEADER_LENGTH as u64 {
            let total = MAX_DATAGRAM_BYTES as u64 + tail;
            let specs: Vec<_> = SendRequests::new(total).collect();
            let sent: u64 = specs.iter().map(|s| s.wire_len() as u64).sum();
            assert_eq!(sent, total, "tail {tail}");
            for spec in &specs {
                assert!(spec.payload_len >= 1, "tail {tail}");
                assert!(spec.wire_len() <= MAX_DATAGRAM_BYTES, "tail {tail}");
            }
        }
    }
}
