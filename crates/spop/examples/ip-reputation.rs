//! Minimal reputation agent: scores the `ip` argument of every `check-client-ip`
//! message and sets `sess.ip_score`.
//!
//! Run with:
//!   cargo run --example ip-reputation --features cli
//!
//! In another terminal:
//!   cargo run --features cli -- notify 127.0.0.1:12345 \
//!     -m check-client-ip -a ip=ipv4:10.0.0.1

use std::net::IpAddr;

use spop::{Actions, Agent, HandlerError, Messages, Scope};

fn score(ip: IpAddr) -> u32 {
    match ip {
        IpAddr::V4(v4) if v4.is_private() || v4.is_loopback() => 0,
        IpAddr::V4(v4) => u32::from(v4.octets()[3]) % 100,
        IpAddr::V6(v6) if v6.is_loopback() => 0,
        IpAddr::V6(v6) => u32::from(v6.octets()[15]) % 100,
    }
}

fn reputation(mut messages: Messages<'_>, actions: &mut Actions) -> Result<(), HandlerError> {
    let Some(message) = messages.find_named("check-client-ip") else {
        return Ok(());
    };
    let ip = message
        .args
        .get("ip")
        .and_then(|value| value.as_ip())
        .ok_or_else(|| HandlerError::from("check-client-ip without an ip argument"))?;
    actions.set_var(Scope::Session, "ip_score", score(ip));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let agent = Agent::new(reputation);
    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
    });

    eprintln!("Listening on 127.0.0.1:12345");
    agent.listen_and_serve("127.0.0.1:12345").await?;
    Ok(())
}
