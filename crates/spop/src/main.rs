mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::exit::{CliError, INTERNAL};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "spop", version, about = "HAProxy SPOP agent toolkit")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        env = "SPOP_LOG_FORMAT",
        default_value = "text",
        global = true
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        env = "SPOP_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))
        .and_then(|runtime| runtime.block_on(cmd::run(cli.command, format)));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parses_serve_with_defaults() {
        let cli = Cli::try_parse_from(["spop", "serve", "0.0.0.0:9000"])
            .expect("serve args should parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.addr, "0.0.0.0:9000");
        assert_eq!(args.read_timeout, Duration::from_secs(1));
        assert_eq!(args.idle_timeout, Duration::from_secs(30));
        assert_eq!(args.capabilities, ["pipelining", "async", "fragmentation"]);
    }

    #[test]
    fn parses_notify_with_repeated_args() {
        let cli = Cli::try_parse_from([
            "spop",
            "notify",
            "127.0.0.1:12345",
            "--message",
            "check",
            "--arg",
            "ip=ipv4:10.0.0.1",
            "--arg",
            "port=uint32:443",
        ])
        .expect("notify args should parse");
        let Command::Notify(args) = cli.command else {
            panic!("expected notify");
        };
        assert_eq!(args.args.len(), 2);
        assert_eq!((args.stream_id, args.frame_id), (1, 1));
    }

    #[test]
    fn notify_requires_message() {
        let err = Cli::try_parse_from(["spop", "notify", "127.0.0.1:12345"])
            .expect_err("missing --message should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn rejects_bad_duration() {
        let err = Cli::try_parse_from(["spop", "probe", "127.0.0.1:1", "--timeout", "soon"])
            .expect_err("bad duration should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
