use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use spop_agent::{Client, ClientConfig, Message, TypedData};

use crate::cmd::probe::round_ms;
use crate::cmd::NotifyArgs;
use crate::exit::{agent_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_notify, NotifyOutput, OutputFormat};

pub async fn run(args: NotifyArgs, format: OutputFormat) -> CliResult<i32> {
    let mut message = Message::new(args.message.as_str());
    for raw in &args.args {
        let (name, value) = parse_arg(raw)?;
        message.args.push(name, value);
    }

    let config = ClientConfig {
        engine_id: args.engine_id,
        timeout: Some(args.timeout),
        ..ClientConfig::default()
    };
    let mut client = Client::connect_with_config(args.addr.as_str(), config)
        .await
        .map_err(|err| agent_error("connect failed", err))?;

    let started = Instant::now();
    let actions = client
        .notify_on(args.stream_id, args.frame_id, std::slice::from_ref(&message))
        .await
        .map_err(|err| agent_error("notify failed", err))?;
    let latency_ms = round_ms(started.elapsed().as_secs_f64() * 1000.0);

    if let Err(err) = client.disconnect().await {
        tracing::debug!(error = %err, "disconnect after notify failed");
    }

    print_notify(
        &NotifyOutput::new(args.stream_id, args.frame_id, &actions, latency_ms),
        format,
    );
    Ok(SUCCESS)
}

/// Split `name=type:value` (or `name=value` for a string).
fn parse_arg(raw: &str) -> CliResult<(String, TypedData)> {
    let (name, rest) = raw
        .split_once('=')
        .ok_or_else(|| CliError::new(USAGE, format!("argument '{raw}' is not name=type:value")))?;
    if name.is_empty() {
        return Err(CliError::new(USAGE, format!("argument '{raw}' has no name")));
    }

    let value = match rest.split_once(':') {
        Some((kind, value)) if is_type_name(kind) => parse_typed(kind, value)
            .map_err(|reason| CliError::new(USAGE, format!("argument '{name}': {reason}")))?,
        _ => TypedData::String(rest.to_string()),
    };
    Ok((name.to_string(), value))
}

fn is_type_name(kind: &str) -> bool {
    matches!(
        kind,
        "null" | "bool" | "int32" | "uint32" | "int64" | "uint64" | "ipv4" | "ipv6" | "str"
            | "string" | "bin" | "binary"
    )
}

fn parse_typed(kind: &str, value: &str) -> Result<TypedData, String> {
    Ok(match kind {
        "null" => TypedData::Null,
        "bool" => TypedData::Bool(value.parse().map_err(|e| invalid(kind, value, e))?),
        "int32" => TypedData::Int32(value.parse().map_err(|e| invalid(kind, value, e))?),
        "uint32" => TypedData::Uint32(value.parse().map_err(|e| invalid(kind, value, e))?),
        "int64" => TypedData::Int64(value.parse().map_err(|e| invalid(kind, value, e))?),
        "uint64" => TypedData::Uint64(value.parse().map_err(|e| invalid(kind, value, e))?),
        "ipv4" => TypedData::Ipv4(value.parse::<Ipv4Addr>().map_err(|e| invalid(kind, value, e))?),
        "ipv6" => TypedData::Ipv6(value.parse::<Ipv6Addr>().map_err(|e| invalid(kind, value, e))?),
        "bin" | "binary" => TypedData::from(decode_hex(value).map_err(|e| invalid(kind, value, e))?),
        _ => TypedData::String(value.to_string()),
    })
}

fn invalid(kind: &str, value: &str, err: impl std::fmt::Display) -> String {
    format!("invalid {kind} '{value}': {err}")
}

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            input
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("bad hex digits at offset {i}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_arguments_parse() {
        assert_eq!(
            parse_arg("ip=ipv4:10.0.0.1").unwrap(),
            ("ip".to_string(), TypedData::Ipv4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(parse_arg("n=int32:-7").unwrap().1, TypedData::Int32(-7));
        assert_eq!(parse_arg("ok=bool:true").unwrap().1, TypedData::Bool(true));
        assert_eq!(
            parse_arg("raw=bin:00ff").unwrap().1,
            TypedData::from(vec![0x00, 0xff])
        );
        assert_eq!(parse_arg("none=null:").unwrap().1, TypedData::Null);
    }

    #[test]
    fn untyped_values_are_strings() {
        assert_eq!(
            parse_arg("path=/a:b").unwrap().1,
            TypedData::String("/a:b".to_string())
        );
        assert_eq!(
            parse_arg("host=example.com").unwrap().1,
            TypedData::String("example.com".to_string())
        );
    }

    #[test]
    fn malformed_arguments_are_usage_errors() {
        assert_eq!(parse_arg("novalue").unwrap_err().code, USAGE);
        assert_eq!(parse_arg("=x").unwrap_err().code, USAGE);
        assert_eq!(parse_arg("n=uint32:-1").unwrap_err().code, USAGE);
        assert_eq!(parse_arg("b=bin:abc").unwrap_err().code, USAGE);
    }
}
