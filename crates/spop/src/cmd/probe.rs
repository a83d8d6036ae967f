use std::time::Instant;

use spop_agent::{Client, ClientConfig};

use crate::cmd::ProbeArgs;
use crate::exit::{agent_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_probe, OutputFormat, ProbeOutput};

pub async fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = ClientConfig {
        engine_id: args.engine_id,
        healthcheck: args.healthcheck,
        timeout: Some(args.timeout),
        ..ClientConfig::default()
    };

    let started = Instant::now();
    let connect = Client::connect_with_config(args.addr.as_str(), config);
    let client = tokio::time::timeout(args.timeout, connect)
        .await
        .map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("connect to {} timed out after {:?}", args.addr, args.timeout),
            )
        })?
        .map_err(|err| agent_error("probe failed", err))?;
    let latency_ms = round_ms(started.elapsed().as_secs_f64() * 1000.0);

    let out = ProbeOutput::new(&args.addr, client.negotiated(), args.healthcheck, latency_ms);
    if !args.healthcheck {
        if let Err(err) = client.disconnect().await {
            tracing::debug!(error = %err, "disconnect after probe failed");
        }
    }

    print_probe(&out, format);
    Ok(SUCCESS)
}

pub(crate) fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}
