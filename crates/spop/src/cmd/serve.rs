use spop_agent::{Actions, Agent, AgentConfig, HandlerError, Messages, Scope};

use crate::cmd::ServeArgs;
use crate::exit::{agent_error, io_error, CliResult, SUCCESS};

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let config = AgentConfig {
        read_timeout: Some(args.read_timeout),
        write_timeout: Some(args.write_timeout),
        idle_timeout: Some(args.idle_timeout),
        max_connections: args.max_connections,
        max_frame_size: args.max_frame_size,
        capabilities: args.capabilities,
        max_streams_per_engine: args.max_streams_per_engine,
        ..AgentConfig::default()
    };
    let agent =
        Agent::with_config(config, echo).map_err(|err| agent_error("invalid configuration", err))?;

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .map_err(|err| io_error(&format!("bind {} failed", args.addr), err))?;

    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received, draining connections"),
            Err(err) => tracing::warn!(error = %err, "signal handler setup failed"),
        }
        shutdown.cancel();
    });

    agent
        .serve(listener)
        .await
        .map_err(|err| agent_error("serve failed", err))?;
    Ok(SUCCESS)
}

/// Echo every argument back as `txn.<message>.<arg>`.
fn echo(messages: Messages<'_>, actions: &mut Actions) -> Result<(), HandlerError> {
    let (stream_id, frame_id) = (messages.stream_id(), messages.frame_id());
    for message in messages {
        tracing::debug!(
            stream_id,
            frame_id,
            message = %message.name,
            args = message.args.len(),
            "echoing message"
        );
        for (name, value) in message.args.iter() {
            actions.set_var(
                Scope::Transaction,
                format!("{}.{}", message.name, name),
                value.clone(),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use spop_agent::{Action, Message, TypedData};

    use super::*;

    #[test]
    fn echo_sets_one_variable_per_argument() {
        let messages = vec![
            Message::new("check")
                .with_arg("ip", std::net::Ipv4Addr::new(10, 0, 0, 1))
                .with_arg("port", 443u32),
            Message::new("empty"),
        ];
        let mut actions = Actions::new();
        echo(Messages::new("", 1, 1, &messages), &mut actions).unwrap();

        assert_eq!(
            actions.as_slice(),
            &[
                Action::set_var(
                    Scope::Transaction,
                    "check.ip",
                    std::net::Ipv4Addr::new(10, 0, 0, 1)
                ),
                Action::set_var(Scope::Transaction, "check.port", TypedData::Uint32(443)),
            ]
        );
    }
}
