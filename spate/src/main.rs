use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use engine::config::{PatternKind, Protocol, Role, Settings, ShutdownKind};
use engine::{Broker, IdPool, Runtime, metrics};

use spate::transport::Transport;
use spate::{logging, output, signal};

/// How often the status line refreshes while the run is in flight.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// How long in-flight connections get to drain after an interrupt or time
/// limit before the process gives up on them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "spate")]
#[command(about = "TCP/UDP traffic generator and measurement tool")]
#[command(version)]
struct Cli {
    /// Path to a TOML settings file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Protocol (tcp, udp)
    #[arg(long, value_parser = parse_protocol)]
    protocol: Option<Protocol>,

    /// Listen on this address (repeatable); selects the server role
    #[arg(long)]
    listen: Vec<std::net::SocketAddr>,

    /// Connect to this address (repeatable); selects the client role
    #[arg(long)]
    target: Vec<std::net::SocketAddr>,

    /// Maximum concurrent connections (clients)
    #[arg(long)]
    connections: Option<u32>,

    /// Maximum sockets pending accept handoff (servers)
    #[arg(long)]
    accept_limit: Option<u32>,

    /// Cap on concurrent connection attempts (clients)
    #[arg(long)]
    throttle: Option<u32>,

    /// Rounds of `connections` to run; 0 runs until interrupted
    #[arg(long)]
    iterations: Option<u64>,

    /// Server: exit after this many connections complete
    #[arg(long)]
    server_exit_limit: Option<u64>,

    /// Wall-clock cap on the run (e.g. "90s", "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    time_limit: Option<Duration>,

    /// IO pattern (push, pull, pushpull, duplex, mediastream)
    #[arg(long, value_parser = parse_pattern)]
    pattern: Option<PatternKind>,

    /// PushPull: bytes sent before the direction flips
    #[arg(long)]
    push_bytes: Option<u64>,

    /// PushPull: bytes received before the direction flips back
    #[arg(long)]
    pull_bytes: Option<u64>,

    /// Bytes moved per connection before the completion exchange
    #[arg(long)]
    transfer: Option<u64>,

    /// Send/recv buffer size in bytes
    #[arg(long)]
    buffer: Option<usize>,

    /// Receives kept in flight per connection
    #[arg(long)]
    prepost_recvs: Option<u32>,

    /// Sends kept in flight per connection
    #[arg(long)]
    prepost_sends: Option<u32>,

    /// TCP send pacing budget in bytes per second
    #[arg(long)]
    rate: Option<u64>,

    /// TCP pacing quantum in milliseconds
    #[arg(long)]
    rate_quantum_ms: Option<u64>,

    /// UDP stream bit rate
    #[arg(long)]
    bits_per_second: Option<u64>,

    /// UDP datagrams per second
    #[arg(long)]
    frame_rate: Option<u64>,

    /// UDP stream length (e.g. "60s")
    #[arg(long, value_parser = humantime::parse_duration)]
    stream_duration: Option<Duration>,

    /// TCP session end (graceful, hard)
    #[arg(long, value_parser = parse_shutdown)]
    shutdown: Option<ShutdownKind>,

    /// Share one process-wide send buffer across connections
    #[arg(long)]
    shared_buffer: bool,

    /// Verify received bytes against the expected pattern content
    #[arg(long)]
    verify: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    match s.to_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(format!("unknown protocol: {s}")),
    }
}

fn parse_pattern(s: &str) -> Result<PatternKind, String> {
    match s.to_lowercase().as_str() {
        "push" => Ok(PatternKind::Push),
        "pull" => Ok(PatternKind::Pull),
        "pushpull" | "push-pull" => Ok(PatternKind::PushPull),
        "duplex" => Ok(PatternKind::Duplex),
        "mediastream" | "media-stream" => Ok(PatternKind::MediaStream),
        _ => Err(format!("unknown pattern: {s}")),
    }
}

fn parse_shutdown(s: &str) -> Result<ShutdownKind, String> {
    match s.to_lowercase().as_str() {
        "graceful" | "fin" => Ok(ShutdownKind::Graceful),
        "hard" | "rst" => Ok(ShutdownKind::Hard),
        _ => Err(format!("unknown shutdown type: {s}")),
    }
}

fn build_settings(cli: &Cli) -> Result<Settings, String> {
    let mut settings = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse {}: {e}", path.display()))?
        }
        None => Settings::default(),
    };

    if let Some(protocol) = cli.protocol {
        settings.protocol = protocol;
    }
    if !cli.listen.is_empty() {
        settings.listen_addresses = cli.listen.clone();
    }
    if !cli.target.is_empty() {
        settings.target_addresses = cli.target.clone();
    }

    // The role follows from which address flags were given.
    match (settings.listen_addresses.is_empty(), settings.target_addresses.is_empty()) {
        (false, true) => settings.role = Role::Listen,
        (true, false) => settings.role = Role::Connect,
        (false, false) => return Err("--listen and --target are mutually exclusive".to_string()),
        (true, true) => return Err("one of --listen or --target is required".to_string()),
    }

    if let Some(connections) = cli.connections {
        settings.connection_limit = connections;
    }
    if let Some(accept_limit) = cli.accept_limit {
        settings.accept_limit = accept_limit;
    }
    if let Some(throttle) = cli.throttle {
        settings.connection_throttle_limit = throttle;
    }
    if let Some(iterations) = cli.iterations {
        settings.iterations = if iterations == 0 { None } else { Some(iterations) };
    }
    if let Some(limit) = cli.server_exit_limit {
        settings.server_exit_limit = Some(limit);
    }
    if cli.time_limit.is_some() {
        settings.time_limit = cli.time_limit;
    }
    if let Some(pattern) = cli.pattern {
        settings.pattern = pattern;
    }
    if let Some(push_bytes) = cli.push_bytes {
        settings.push_bytes = push_bytes;
    }
    if let Some(pull_bytes) = cli.pull_bytes {
        settings.pull_bytes = pull_bytes;
    }
    if let Some(transfer) = cli.transfer {
        settings.transfer_size = transfer;
    }
    if let Some(buffer) = cli.buffer {
        settings.min_buffer_size = buffer;
        settings.max_buffer_size = buffer;
    }
    if let Some(prepost_recvs) = cli.prepost_recvs {
        settings.prepost_recvs = prepost_recvs;
    }
    if let Some(prepost_sends) = cli.prepost_sends {
        settings.prepost_sends = prepost_sends;
    }
    if cli.rate.is_some() {
        settings.tcp_bytes_per_second = cli.rate;
    }
    if let Some(quantum) = cli.rate_quantum_ms {
        settings.tcp_quantum_ms = quantum;
    }
    if let Some(bits) = cli.bits_per_second {
        settings.udp_bits_per_second = bits;
    }
    if let Some(frame_rate) = cli.frame_rate {
        settings.udp_frames_per_second = frame_rate;
    }
    if let Some(duration) = cli.stream_duration {
        settings.udp_stream_duration = duration;
    }
    if let Some(shutdown) = cli.shutdown {
        settings.shutdown = shutdown;
    }
    if cli.shared_buffer {
        settings.use_shared_buffer = true;
    }
    if cli.verify {
        settings.verify_buffers = true;
    }

    Ok(settings)
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // Configuration problems abort before the engine starts.
    let settings = match build_settings(&cli) {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("error: {message}");
            std::process::exit(1);
        }
    };
    if let Err(error) = settings.validate() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
    let settings = Arc::new(settings);

    let shutdown = signal::install_signal_handler();

    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let runtime = Runtime::new(threads);

    let pool = Arc::new(if settings.is_listening() {
        IdPool::server()
    } else {
        IdPool::client(settings.connection_limit as usize)
    });

    let transport = match Transport::start(Arc::clone(&settings)) {
        Ok(transport) => transport,
        Err(error) => {
            eprintln!("error: failed to start the transport: {error}");
            std::process::exit(1);
        }
    };

    let broker = Broker::new(
        Arc::clone(&settings),
        Arc::clone(&runtime),
        pool,
        transport.step_functions(),
        Arc::clone(&shutdown),
    );

    let start = Instant::now();
    broker.start();

    // Status loop: wake for the status line, honor the time limit, and
    // stop when the broker signals done or the operator interrupts.
    let deadline = settings.time_limit.map(|limit| start + limit);
    loop {
        let mut slice = STATUS_INTERVAL;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!("time limit reached, winding down");
                broker.request_shutdown();
                break;
            }
            slice = slice.min(deadline - now);
        }
        if broker.wait(Some(slice)) {
            break;
        }
        output::print_status(start.elapsed());
    }

    // Let in-flight connections drain after an interrupt or time limit.
    let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
    while broker.counters() != (0, 0) && Instant::now() < drain_deadline {
        std::thread::sleep(Duration::from_millis(100));
    }

    transport.shutdown();
    runtime.shutdown();

    output::print_summary(&settings, start.elapsed());
    std::process::exit(metrics::exit_code());
}
