use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod notify;
pub mod probe;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo agent (each argument comes back as a txn variable).
    Serve(ServeArgs),
    /// Handshake with an agent and print the negotiated values.
    Probe(ProbeArgs),
    /// Send one NOTIFY and print the ACK actions.
    Notify(NotifyArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args).await,
        Command::Probe(args) => probe::run(args, format).await,
        Command::Notify(args) => notify::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(env = "SPOP_LISTEN", default_value = "127.0.0.1:12345")]
    pub addr: String,
    /// Concurrent connection ceiling (unlimited when omitted).
    #[arg(long, env = "SPOP_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,
    /// Largest frame the agent accepts.
    #[arg(long, env = "SPOP_MAX_FRAME_SIZE", default_value_t = spop_frame::MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
    /// Time allowed to finish reading a started frame (e.g. 1s, 500ms).
    #[arg(long, env = "SPOP_READ_TIMEOUT", default_value = "1s", value_parser = parse_duration)]
    pub read_timeout: Duration,
    /// Time allowed to write one frame.
    #[arg(long, env = "SPOP_WRITE_TIMEOUT", default_value = "1s", value_parser = parse_duration)]
    pub write_timeout: Duration,
    /// Time a connection may stay silent between frames.
    #[arg(long, env = "SPOP_IDLE_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub idle_timeout: Duration,
    /// In-flight NOTIFY ceiling per engine (unbounded when omitted).
    #[arg(long, env = "SPOP_MAX_STREAMS_PER_ENGINE")]
    pub max_streams_per_engine: Option<usize>,
    /// Capabilities to offer (comma-separated).
    #[arg(
        long,
        env = "SPOP_CAPABILITIES",
        value_delimiter = ',',
        default_value = "pipelining,async,fragmentation"
    )]
    pub capabilities: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Agent address.
    pub addr: String,
    /// Deadline for the handshake (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
    /// Send a health-check HELLO (the agent closes right after answering).
    #[arg(long)]
    pub healthcheck: bool,
    /// Engine id to announce.
    #[arg(long)]
    pub engine_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Agent address.
    pub addr: String,
    /// Message name.
    #[arg(long, short = 'm')]
    pub message: String,
    /// Message argument as `name=type:value` (types: null, bool, int32,
    /// uint32, int64, uint64, ipv4, ipv6, str, bin). Without a type the value
    /// is sent as a string. Repeatable.
    #[arg(long = "arg", short = 'a', value_name = "NAME=TYPE:VALUE")]
    pub args: Vec<String>,
    /// Stream id of the NOTIFY.
    #[arg(long, default_value_t = 1)]
    pub stream_id: u64,
    /// Frame id of the NOTIFY.
    #[arg(long, default_value_t = 1)]
    pub frame_id: u64,
    /// Engine id to announce.
    #[arg(long)]
    pub engine_id: Option<String>,
    /// Deadline for each exchange (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `500ms`, `5s`, `2m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else if let Some(num) = input.strip_suffix('m') {
        (num, "m")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {input}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        _ => Duration::from_secs(value),
    })
}
