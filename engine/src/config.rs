//! Run configuration.
//!
//! [`Settings`] is built once at startup (from CLI arguments or a TOML
//! file), validated, then shared immutably across the engine as
//! `Arc<Settings>`. Nothing mutates it after the run starts.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::media_stream::DATA_HEADER_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Whether this process dials out or fields connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Connect,
    Listen,
}

/// The traffic shape driven over each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    #[default]
    Push,
    Pull,
    PushPull,
    Duplex,
    MediaStream,
}

/// How the TCP session ends after the completion exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownKind {
    /// Half-close the send side and wait for the peer's FIN.
    #[default]
    Graceful,
    /// Force a RST via close with linger set to zero.
    Hard,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub protocol: Protocol,
    pub role: Role,
    pub listen_addresses: Vec<SocketAddr>,
    pub target_addresses: Vec<SocketAddr>,

    /// Maximum concurrent connections (clients).
    pub connection_limit: u32,
    /// Maximum sockets pending accept handoff (servers).
    pub accept_limit: u32,
    /// Cap on concurrent connection attempts (clients).
    pub connection_throttle_limit: u32,
    /// Client: how many rounds of `connection_limit` connections to run.
    /// `None` runs until interrupted.
    pub iterations: Option<u64>,
    /// Server: exit after this many connections complete. `None` serves
    /// until interrupted.
    pub server_exit_limit: Option<u64>,
    /// Optional wall-clock cap on the whole run.
    #[serde(with = "humantime_serde")]
    pub time_limit: Option<Duration>,

    pub pattern: PatternKind,
    /// PushPull: bytes sent before the direction flips.
    pub push_bytes: u64,
    /// PushPull: bytes received before the direction flips back.
    pub pull_bytes: u64,

    /// Bytes moved per connection before the completion exchange.
    pub transfer_size: u64,
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    /// Receives kept in flight per connection.
    pub prepost_recvs: u32,
    /// Sends kept in flight per connection; zero means one buffer's worth.
    pub prepost_sends: u32,

    /// TCP send pacing budget. `None` disables pacing.
    pub tcp_bytes_per_second: Option<u64>,
    /// Pacing quantum in milliseconds.
    pub tcp_quantum_ms: u64,

    /// UDP stream bit rate.
    pub udp_bits_per_second: u64,
    /// UDP datagrams per second.
    pub udp_frames_per_second: u64,
    /// UDP stream length.
    #[serde(with = "humantime_serde")]
    pub udp_stream_duration: Duration,

    pub shutdown: ShutdownKind,
    /// Share one process-wide send buffer across connections instead of a
    /// per-connection tracked copy.
    pub use_shared_buffer: bool,
    /// Verify received bytes against the expected pattern content.
    pub verify_buffers: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            role: Role::default(),
            listen_addresses: Vec::new(),
            target_addresses: Vec::new(),
            connection_limit: 8,
            accept_limit: 100,
            connection_throttle_limit: 1_000,
            iterations: Some(1),
            server_exit_limit: None,
            time_limit: None,
            pattern: PatternKind::default(),
            push_bytes: 1_048_576,
            pull_bytes: 1_048_576,
            transfer_size: 0x4000_0000,
            min_buffer_size: 65_536,
            max_buffer_size: 65_536,
            prepost_recvs: 1,
            prepost_sends: 0,
            tcp_bytes_per_second: None,
            tcp_quantum_ms: 100,
            udp_bits_per_second: 1_000_000,
            udp_frames_per_second: 30,
            udp_stream_duration: Duration::from_secs(60),
            shutdown: ShutdownKind::default(),
            use_shared_buffer: false,
            verify_buffers: false,
        }
    }
}

impl Settings {
    /// Reject configurations the engine cannot run. Called once before the
    /// broker starts; nothing re-validates afterwards.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        use crate::error::Error::InvalidConfig;

        match self.role {
            Role::Listen if self.listen_addresses.is_empty() => {
                return Err(InvalidConfig("listen role requires at least one listen address".into()));
            }
            Role::Connect if self.target_addresses.is_empty() => {
                return Err(InvalidConfig("connect role requires at least one target address".into()));
            }
            _ => {}
        }
        if self.connection_limit == 0 {
            return Err(InvalidConfig("connection_limit must be at least 1".into()));
        }
        if self.min_buffer_size == 0 || self.max_buffer_size < self.min_buffer_size {
            return Err(InvalidConfig(format!(
                "buffer size bounds are inverted: min {} max {}",
                self.min_buffer_size, self.max_buffer_size
            )));
        }
        match self.protocol {
            Protocol::Tcp => {
                if self.transfer_size == 0 {
                    return Err(InvalidConfig("transfer_size must be non-zero".into()));
                }
                if self.pattern == PatternKind::MediaStream {
                    return Err(InvalidConfig("mediastream requires the udp protocol".into()));
                }
                if self.pattern == PatternKind::PushPull && (self.push_bytes == 0 || self.pull_bytes == 0) {
                    return Err(InvalidConfig("pushpull requires non-zero push and pull byte splits".into()));
                }
                if self.tcp_quantum_ms == 0 {
                    return Err(InvalidConfig("tcp_quantum_ms must be non-zero".into()));
                }
            }
            Protocol::Udp => {
                if self.pattern != PatternKind::MediaStream {
                    return Err(InvalidConfig("udp supports only the mediastream pattern".into()));
                }
                if self.udp_frames_per_second == 0 || self.udp_bits_per_second == 0 {
                    return Err(InvalidConfig("udp rate parameters must be non-zero".into()));
                }
                if self.udp_bytes_per_frame() <= DATA_HEADER_LENGTH as u64 {
                    return Err(InvalidConfig(format!(
                        "udp frame of {} bytes does not exceed the {}-byte datagram header",
                        self.udp_bytes_per_frame(),
                        DATA_HEADER_LENGTH
                    )));
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.role == Role::Listen
    }

    /// Bytes carried by one UDP frame: bits/sec over 8, split per frame.
    pub fn udp_bytes_per_frame(&self) -> u64 {
        self.udp_bits_per_second / 8 / self.udp_frames_per_second
    }

    /// Total bytes one connection transfers.
    pub fn max_transfer(&self) -> u64 {
        match self.protocol {
            Protocol::Tcp => self.transfer_size,
            Protocol::Udp => {
                self.udp_bytes_per_frame()
                    * self.udp_frames_per_second
                    * self.udp_stream_duration.as_secs()
            }
        }
    }

    /// How many connections the broker creates over the whole run.
    /// `None` is unbounded.
    pub fn total_connections(&self) -> Option<u64> {
        if self.is_listening() {
            self.server_exit_limit
        } else {
            self.iterations.map(|n| n * self.connection_limit as u64)
        }
    }

    /// The broker's cap on sockets not yet in their IO phase.
    pub fn pending_limit(&self) -> u32 {
        if self.is_listening() { self.accept_limit } else { self.connection_limit }
    }

    /// Cap on concurrent in-flight sends, in bytes.
    pub fn ideal_send_backlog(&self) -> u64 {
        if self.prepost_sends == 0 {
            self.max_buffer_size as u64
        } else {
            self.max_buffer_size as u64 * self.prepost_sends as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_settings() -> Settings {
        Settings {
            target_addresses: vec!["127.0.0.1:4444".parse().unwrap()],
            ..Settings::default()
        }
    }

    #[test]
    fn default_client_settings_validate() {
        client_settings().validate().unwrap();
    }

    #[test]
    fn listen_requires_an_address() {
        let settings = Settings { role: Role::Listen, ..Settings::default() };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn udp_requires_mediastream() {
        let settings = Settings {
            protocol: Protocol::Udp,
            pattern: PatternKind::Push,
            ..client_settings()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn udp_transfer_is_rate_times_duration() {
        let settings = Settings {
            protocol: Protocol::Udp,
            pattern: PatternKind::MediaStream,
            udp_bits_per_second: 8_000_000,
            udp_frames_per_second: 100,
            udp_stream_duration: Duration::from_secs(10),
            ..client_settings()
        };
        settings.validate().unwrap();
        // 1 MB/s split into 100 frames: 10_000 bytes per frame.
        assert_eq!(settings.udp_bytes_per_frame(), 10_000);
        assert_eq!(settings.max_transfer(), 10_000 * 100 * 10);
    }

    #[test]
    fn total_connections_scales_with_iterations() {
        let settings = Settings { iterations: Some(3), ..client_settings() };
        assert_eq!(settings.total_connections(), Some(24));

        let unbounded = Settings { iterations: None, ..client_settings() };
        assert_eq!(unbounded.total_connections(), None);
    }

    #[test]
    fn ideal_send_backlog_defaults_to_one_buffer() {
        let settings = client_settings();
        assert_eq!(settings.ideal_send_backlog(), 65_536);

        let pre = Settings { prepost_sends: 4, ..client_settings() };
        assert_eq!(pre.ideal_send_backlog(), 4 * 65_536);
    }

    #[test]
    fn settings_load_from_toml() {
        let settings: Settings = toml::from_str(
            r#"
            protocol = "tcp"
            role = "connect"
            target_addresses = ["192.0.2.1:4444"]
            connection_limit = 32
            pattern = "duplex"
            transfer_size = 1048576
            tcp_bytes_per_second = 1000000
            time_limit = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(settings.connection_limit, 32);
        assert_eq!(settings.pattern, PatternKind::Duplex);
        assert_eq!(settings.tcp_bytes_per_second, Some(1_000_000));
        assert_eq!(settings.time_limit, Some(Duration::from_secs(30)));
        settings.validate().unwrap();
    }
}
