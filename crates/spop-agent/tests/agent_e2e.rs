use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use spop_agent::{
    Actions, Agent, AgentConfig, AgentError, Client, ClientConfig, HandlerError, Messages, Scope,
    StatusCode, TypedData,
};
use bytes::BytesMut;
use spop_frame::{
    decode_kv, encode_frame, fragment_frame, Disconnect, Frame, FrameFlags, FrameReader,
    FrameType, FrameWriter, Hello, Message, MAX_FRAME_SIZE,
};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

fn check_handler(messages: Messages<'_>, actions: &mut Actions) -> Result<(), HandlerError> {
    for message in messages {
        match message.name.as_str() {
            "check" => actions.set_var(Scope::Session, "result", true),
            "fail" => return Err("rejected by handler".into()),
            "partial" => {
                actions.set_var(Scope::Session, "half_done", true);
                return Err("gave up halfway".into());
            }
            "panic" => panic!("handler bug"),
            "slow" => std::thread::sleep(Duration::from_millis(300)),
            _ => {}
        }
    }
    Ok(())
}

fn id_handler(messages: Messages<'_>, actions: &mut Actions) -> Result<(), HandlerError> {
    actions.set_var(Scope::Transaction, "stream", messages.stream_id());
    actions.set_var(Scope::Transaction, "frame", messages.frame_id());
    Ok(())
}

async fn start(
    config: AgentConfig,
    handler: fn(Messages<'_>, &mut Actions) -> Result<(), HandlerError>,
) -> (Arc<Agent>, SocketAddr, JoinHandle<spop_agent::Result<()>>) {
    let agent = Arc::new(Agent::with_config(config, handler).expect("config should be valid"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    let task = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.serve(listener).await })
    };
    (agent, addr, task)
}

fn proxy_hello(max_frame_size: u64, engine_id: &str) -> Hello {
    Hello {
        supported_versions: Some(vec!["2.0".to_string()]),
        max_frame_size: Some(max_frame_size),
        capabilities: Some(vec![]),
        healthcheck: false,
        engine_id: Some(engine_id.to_string()),
    }
}

fn disconnect_status(frame: &Frame) -> StatusCode {
    assert_eq!(frame.frame_type, FrameType::AgentDisconnect);
    let (kv, _) = decode_kv(&frame.payload).unwrap();
    Disconnect::from_kv(&kv).status()
}

fn check_message() -> Message {
    Message::new("check").with_arg("ip", "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap())
}

#[tokio::test]
async fn scenario_a_handshake_without_capabilities() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;

    let config = ClientConfig {
        capabilities: vec![],
        ..ClientConfig::default()
    };
    let client = Client::connect_with_config(addr, config)
        .await
        .expect("handshake should succeed");
    let hello = client.negotiated();
    assert_eq!(hello.version, "2.0");
    assert_eq!(hello.max_frame_size, 16380);
    assert!(hello.capabilities.is_empty());

    let bye = client.disconnect().await.expect("disconnect should succeed");
    assert_eq!(bye.status(), StatusCode::Normal);
    agent.shutdown();
}

#[tokio::test]
async fn scenario_b_notify_is_acked_with_actions() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    let actions = client
        .notify_on(1, 1, &[check_message()])
        .await
        .expect("NOTIFY should be acked");
    let mut expected = Actions::new();
    expected.set_var(Scope::Session, "result", true);
    assert_eq!(actions, expected);

    let stats = agent.pools().stats();
    assert_eq!(stats.requests.idle, stats.requests.created);
    assert_eq!(stats.messages.idle, stats.messages.created);

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn scenario_c_handler_error_yields_empty_ack() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    let failed = client
        .notify_on(3, 1, &[Message::new("fail")])
        .await
        .expect("failed handler should still be acked");
    assert!(failed.is_empty());

    let next = client
        .notify_on(3, 2, &[check_message()])
        .await
        .expect("connection should stay usable");
    assert_eq!(next.len(), 1);

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn three_fragment_notify_is_reassembled() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    let whole = Frame::notify(5, 9, &[check_message()]).unwrap();
    let chunk = whole.frame_len() - whole.payload.len() + whole.payload.len().div_ceil(3);
    let fragments = fragment_frame(whole, chunk).unwrap();
    assert_eq!(fragments.len(), 3);
    for fragment in fragments {
        client.send_frame(fragment).await.unwrap();
    }

    let (stream_id, frame_id, actions) = client.recv_ack().await.expect("ACK expected");
    assert_eq!((stream_id, frame_id), (5, 9));
    assert_eq!(actions.len(), 1);

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn aborted_stream_gets_no_ack() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    let whole = Frame::notify(7, 1, &[check_message()]).unwrap();
    let mut fragments = fragment_frame(whole, 16).unwrap();
    client.send_frame(fragments.remove(0)).await.unwrap();

    let mut abort = Frame::new(FrameType::Unset, 7, 1, Vec::new());
    abort.flags = FrameFlags::FIN | FrameFlags::ABORT;
    client.send_frame(abort).await.unwrap();

    let actions = client
        .notify_on(8, 1, &[check_message()])
        .await
        .expect("next stream should be acked, and nothing for the aborted one");
    assert_eq!(actions.len(), 1);

    // Abort a request whose handler is already running.
    client
        .send_frame(Frame::notify(9, 1, &[Message::new("slow")]).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut abort = Frame::new(FrameType::Notify, 9, 1, Vec::new());
    abort.flags = FrameFlags::FIN | FrameFlags::ABORT;
    client.send_frame(abort).await.unwrap();

    let silent = tokio::time::timeout(Duration::from_millis(600), client.recv_frame()).await;
    assert!(silent.is_err(), "aborted stream must not be acked");

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn acks_correlate_with_pipelined_streams() {
    let (agent, addr, _task) = start(AgentConfig::default(), id_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    for stream_id in 1..=32u64 {
        let frame = Frame::notify(stream_id, stream_id * 10, &[Message::new("ids")]).unwrap();
        client.send_frame(frame).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..32 {
        let (stream_id, frame_id, actions) = client.recv_ack().await.expect("ACK expected");
        assert_eq!(frame_id, stream_id * 10);
        let values: Vec<&TypedData> = actions
            .iter()
            .map(|action| match action {
                spop_agent::Action::SetVar { value, .. } => value,
                other => panic!("unexpected action {other}"),
            })
            .collect();
        assert_eq!(values, [&TypedData::from(stream_id), &TypedData::from(frame_id)]);
        seen.push(stream_id);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=32).collect::<Vec<_>>());

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn stream_ceiling_refuses_with_empty_ack() {
    let config = AgentConfig {
        max_streams_per_engine: Some(1),
        ..AgentConfig::default()
    };
    let (agent, addr, _task) = start(config, check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    client
        .send_frame(Frame::notify(1, 1, &[Message::new("slow")]).unwrap())
        .await
        .unwrap();
    client
        .send_frame(Frame::notify(2, 1, &[check_message()]).unwrap())
        .await
        .unwrap();

    let (stream_id, _, refused) = client.recv_ack().await.expect("refusal ACK expected");
    assert_eq!(stream_id, 2);
    assert!(refused.is_empty());

    let (stream_id, _, slow) = client.recv_ack().await.expect("slow ACK expected");
    assert_eq!(stream_id, 1);
    assert!(slow.is_empty());

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn healthcheck_closes_after_agent_hello() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;

    let hello = Client::healthcheck(addr)
        .await
        .expect("health check should succeed");
    assert_eq!(hello.version, "2.0");
    assert!(agent.registry().is_empty());
    agent.shutdown();
}

#[tokio::test]
async fn version_mismatch_is_answered_with_status() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;

    let config = ClientConfig {
        supported_versions: vec!["1.0".to_string()],
        ..ClientConfig::default()
    };
    let err = Client::connect_with_config(addr, config)
        .await
        .err()
        .expect("handshake should fail");
    assert!(matches!(err, AgentError::Disconnected { .. }));
    assert_eq!(err.status_code(), StatusCode::BadVersion);
    agent.shutdown();
}

#[tokio::test]
async fn oversized_frame_closes_with_too_big() {
    let agent = Arc::new(Agent::new(check_handler));
    let (proxy_side, agent_side) = tokio::io::duplex(64 * 1024);
    let session = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.serve_stream(agent_side).await })
    };

    let (read, write) = tokio::io::split(proxy_side);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    writer
        .write_frame(&proxy_hello(1024, "e1").to_frame())
        .await
        .unwrap();
    let reply = reader.read_frame().await.unwrap();
    assert_eq!(reply.frame_type, FrameType::AgentHello);

    let big = Frame::new(FrameType::Notify, 1, 1, vec![0u8; 2000]);
    writer.write_frame(&big).await.unwrap();

    let bye = reader.read_frame().await.unwrap();
    assert_eq!(disconnect_status(&bye), StatusCode::TooBig);

    let result = session.await.unwrap();
    assert!(result.is_err());
    assert!(agent.registry().is_empty());
}

#[tokio::test]
async fn non_hello_first_frame_closes_without_reply() {
    let agent = Arc::new(Agent::new(check_handler));
    let (proxy_side, agent_side) = tokio::io::duplex(64 * 1024);
    let session = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.serve_stream(agent_side).await })
    };

    let (read, write) = tokio::io::split(proxy_side);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    let notify = Frame::notify(1, 1, &[check_message()]).unwrap();
    writer.write_frame(&notify).await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::ProtocolViolation(_)));
    assert!(reader.read_frame().await.is_err());
}

#[tokio::test]
async fn shutdown_drains_open_connections() {
    let (agent, addr, task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");
    client
        .send_frame(Frame::notify(1, 1, &[Message::new("slow")]).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    agent.shutdown();

    let ack = client.recv_frame().await.expect("in-flight ACK expected");
    assert_eq!(ack.frame_type, FrameType::Ack);
    assert_eq!(ack.stream_id, 1);
    let bye = client.recv_frame().await.expect("AGENT-DISCONNECT expected");
    assert_eq!(bye.frame_type, FrameType::AgentDisconnect);

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("serve should return after draining")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn handler_error_discards_partial_actions() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    let actions = client
        .notify_on(4, 1, &[Message::new("partial")])
        .await
        .expect("failed handler should still be acked");
    assert!(actions.is_empty());

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn panicking_handler_yields_empty_ack_and_recycles_request() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    let actions = client
        .notify_on(6, 1, &[Message::new("panic").with_arg("n", 1u32)])
        .await
        .expect("panicking handler should still be acked");
    assert!(actions.is_empty());

    let stats = agent.pools().stats();
    assert!(stats.requests.created > 0);
    assert_eq!(stats.requests.idle, stats.requests.created);
    assert_eq!(stats.messages.idle, stats.messages.created);

    let next = client
        .notify_on(6, 2, &[check_message()])
        .await
        .expect("connection should survive a handler panic");
    assert_eq!(next.len(), 1);

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn same_stream_acks_follow_frame_order() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    client
        .send_frame(Frame::notify(1, 1, &[Message::new("slow")]).unwrap())
        .await
        .unwrap();
    client
        .send_frame(Frame::notify(1, 2, &[check_message()]).unwrap())
        .await
        .unwrap();

    let (stream_id, first, slow) = client.recv_ack().await.expect("first ACK expected");
    assert_eq!((stream_id, first), (1, 1));
    assert!(slow.is_empty());
    let (stream_id, second, checked) = client.recv_ack().await.expect("second ACK expected");
    assert_eq!((stream_id, second), (1, 2));
    assert_eq!(checked.len(), 1);

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn refusal_on_busy_stream_keeps_frame_order() {
    let config = AgentConfig {
        max_streams_per_engine: Some(1),
        ..AgentConfig::default()
    };
    let (agent, addr, _task) = start(config, check_handler).await;
    let mut client = Client::connect(addr).await.expect("client should connect");

    client
        .send_frame(Frame::notify(1, 1, &[Message::new("slow")]).unwrap())
        .await
        .unwrap();
    client
        .send_frame(Frame::notify(1, 2, &[check_message()]).unwrap())
        .await
        .unwrap();

    let (_, first, _) = client.recv_ack().await.expect("first ACK expected");
    let (_, second, refused) = client.recv_ack().await.expect("refusal ACK expected");
    assert_eq!((first, second), (1, 2));
    assert!(refused.is_empty());

    let after = client
        .notify_on(1, 3, &[check_message()])
        .await
        .expect("stream should be usable once the ceiling frees up");
    assert_eq!(after.len(), 1);

    client.disconnect().await.expect("disconnect should succeed");
    agent.shutdown();
}

#[tokio::test]
async fn hello_after_handshake_closes_with_invalid() {
    let (agent, addr, _task) = start(AgentConfig::default(), check_handler).await;

    // Same engine again, then a different one: both are protocol violations.
    for engine_id in ["engine-a", "engine-b"] {
        let config = ClientConfig {
            engine_id: Some("engine-a".to_string()),
            ..ClientConfig::default()
        };
        let mut client = Client::connect_with_config(addr, config)
            .await
            .expect("client should connect");
        client
            .send_frame(proxy_hello(16380, engine_id).to_frame())
            .await
            .unwrap();

        let bye = client.recv_frame().await.expect("AGENT-DISCONNECT expected");
        assert_eq!(disconnect_status(&bye), StatusCode::Invalid, "{engine_id}");
    }
    agent.shutdown();
}

#[tokio::test]
async fn trickling_peer_is_closed_with_timeout() {
    let config = AgentConfig {
        read_timeout: Some(Duration::from_millis(100)),
        ..AgentConfig::default()
    };
    let agent = Arc::new(Agent::with_config(config, check_handler).expect("config should be valid"));
    let (proxy_side, agent_side) = tokio::io::duplex(64 * 1024);
    let session = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.serve_stream(agent_side).await })
    };

    let (read, mut write) = tokio::io::split(proxy_side);
    let mut reader = FrameReader::new(read);
    let mut wire = BytesMut::new();
    encode_frame(&proxy_hello(16380, "e1").to_frame(), &mut wire, MAX_FRAME_SIZE).unwrap();
    write.write_all(&wire).await.unwrap();
    let reply = reader.read_frame().await.unwrap();
    assert_eq!(reply.frame_type, FrameType::AgentHello);

    let mut notify = BytesMut::new();
    let frame = Frame::notify(1, 1, &[check_message()]).unwrap();
    encode_frame(&frame, &mut notify, MAX_FRAME_SIZE).unwrap();
    let trickle = tokio::spawn(async move {
        for byte in notify.to_vec() {
            if write.write_all(&[byte]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        write
    });

    let bye = tokio::time::timeout(Duration::from_millis(600), reader.read_frame())
        .await
        .expect("agent should give up on the frame before it completes")
        .unwrap();
    assert_eq!(disconnect_status(&bye), StatusCode::Timeout);

    let result = session.await.unwrap();
    assert!(matches!(result, Err(ref err) if err.status_code() == StatusCode::Timeout));
    assert!(agent.registry().is_empty());
    drop(trickle.await.unwrap());
}
