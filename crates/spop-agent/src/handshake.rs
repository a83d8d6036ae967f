use std::collections::HashSet;

use spop_frame::payload::{CAP_FRAGMENTATION, CAP_PIPELINING};
use spop_frame::{
    decode_kv, AgentHello, Disconnect, FrameReader, FrameType, FrameWriter, Hello, StatusCode,
    MAX_FRAME_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// The only protocol version this agent speaks.
pub const SPOP_VERSION: &str = "2.0";

/// Proposals below this frame size are refused.
pub const MIN_NEGOTIATED_FRAME_SIZE: usize = 256;

const MAX_VERSION_LEN: usize = 16;
const MAX_ENGINE_ID_LEN: usize = 256;

/// Outcome of a successful HELLO exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Highest version both sides speak.
    pub version: String,
    /// Frame ceiling for both directions on this connection.
    pub max_frame_size: usize,
    /// Capabilities both sides announced, in the proxy's order.
    pub capabilities: Vec<String>,
    /// Engine id from HELLO, empty when absent.
    pub engine_id: String,
    /// The connection is a health check and closes after AGENT-HELLO.
    pub healthcheck: bool,
}

impl Negotiated {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == capability)
    }

    pub fn fragmentation(&self) -> bool {
        self.has_capability(CAP_FRAGMENTATION)
    }

    pub fn pipelining(&self) -> bool {
        self.has_capability(CAP_PIPELINING)
    }

    pub fn agent_hello(&self) -> AgentHello {
        AgentHello {
            version: self.version.clone(),
            max_frame_size: self.max_frame_size as u32,
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Compute the agent's answer to a HELLO.
pub fn negotiate(hello: &Hello, config: &AgentConfig) -> Result<Negotiated> {
    let offered = hello.supported_versions.as_ref().ok_or_else(|| {
        AgentError::HandshakeFailed {
            status: StatusCode::NoVersion,
            reason: "HELLO has no supported-versions".to_string(),
        }
    })?;
    let proposed_size = hello.max_frame_size.ok_or_else(|| AgentError::HandshakeFailed {
        status: StatusCode::NoFrameSize,
        reason: "HELLO has no max-frame-size".to_string(),
    })?;
    let requested_caps = hello
        .capabilities
        .as_ref()
        .ok_or_else(|| AgentError::HandshakeFailed {
            status: StatusCode::NoCapabilities,
            reason: "HELLO has no capabilities".to_string(),
        })?;

    let version = highest_common_version(offered, &config.supported_versions).ok_or_else(|| {
        AgentError::VersionMismatch {
            offered: offered.clone(),
        }
    })?;

    if proposed_size < MIN_NEGOTIATED_FRAME_SIZE as u64 {
        return Err(AgentError::HandshakeFailed {
            status: StatusCode::BadFrameSize,
            reason: format!(
                "max-frame-size {proposed_size} below minimum {MIN_NEGOTIATED_FRAME_SIZE}"
            ),
        });
    }
    let max_frame_size = proposed_size
        .min(config.max_frame_size as u64)
        .min(MAX_FRAME_SIZE as u64) as usize;

    let engine_id = hello.engine_id.clone().unwrap_or_default();
    if engine_id.len() > MAX_ENGINE_ID_LEN {
        return Err(AgentError::HandshakeFailed {
            status: StatusCode::Invalid,
            reason: format!("engine-id too long: {} bytes", engine_id.len()),
        });
    }

    Ok(Negotiated {
        version,
        max_frame_size,
        capabilities: intersect_capabilities(requested_caps, &config.capabilities),
        engine_id,
        healthcheck: hello.healthcheck,
    })
}

/// Run the agent side of the handshake.
///
/// A first frame that is not HELLO fails without a reply. Negotiation
/// failures are answered with AGENT-DISCONNECT carrying the status code.
/// On success AGENT-HELLO has been written and both halves are switched to
/// the negotiated frame size.
pub async fn handshake_server<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &AgentConfig,
) -> Result<Negotiated>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let frame = reader.read_frame().await?;
    if frame.frame_type != FrameType::HaproxyHello {
        return Err(AgentError::ProtocolViolation(format!(
            "expected HAPROXY-HELLO, got {}",
            frame.frame_type
        )));
    }

    let outcome = if frame.is_fin() {
        decode_kv(&frame.payload)
            .map_err(AgentError::from)
            .and_then(|(kv, _)| negotiate(&Hello::from_kv(&kv), config))
    } else {
        Err(AgentError::HandshakeFailed {
            status: StatusCode::FragmentationNotSupported,
            reason: "fragmented HELLO".to_string(),
        })
    };

    let negotiated = match outcome {
        Ok(negotiated) => negotiated,
        Err(err) => {
            let status = err.status_code();
            tracing::warn!(error = %err, status = status.code(), "handshake rejected");
            let reply = Disconnect::with_message(status, err.to_string())
                .to_frame(FrameType::AgentDisconnect);
            if let Err(write_err) = writer.write_frame(&reply).await {
                tracing::debug!(error = %write_err, "failed to deliver handshake rejection");
            }
            return Err(err);
        }
    };

    writer
        .write_frame(&negotiated.agent_hello().to_frame())
        .await?;
    reader.set_max_frame_size(negotiated.max_frame_size);
    writer.set_max_frame_size(negotiated.max_frame_size);

    tracing::debug!(
        version = %negotiated.version,
        max_frame_size = negotiated.max_frame_size,
        capabilities = ?negotiated.capabilities,
        engine_id = %negotiated.engine_id,
        healthcheck = negotiated.healthcheck,
        "handshake complete"
    );
    Ok(negotiated)
}

fn highest_common_version(offered: &[String], supported: &[String]) -> Option<String> {
    let supported: HashSet<(u16, u16)> = supported
        .iter()
        .filter_map(|version| parse_version(version))
        .collect();

    offered
        .iter()
        .filter(|version| version.len() <= MAX_VERSION_LEN)
        .filter_map(|version| parse_version(version).map(|parsed| (parsed, version)))
        .filter(|(parsed, _)| supported.contains(parsed))
        .max_by_key(|(parsed, _)| *parsed)
        .map(|((major, minor), _)| format!("{major}.{minor}"))
}

fn intersect_capabilities(requested: &[String], supported: &[String]) -> Vec<String> {
    let supported: HashSet<&str> = supported.iter().map(String::as_str).collect();
    let mut seen: HashSet<&String> = HashSet::with_capacity(requested.len());
    requested
        .iter()
        .filter(|cap| supported.contains(cap.as_str()))
        .filter(|cap| seen.insert(*cap))
        .cloned()
        .collect()
}

/// Parse `<major>.<minor>`. Anything else is not a version.
fn parse_version(version: &str) -> Option<(u16, u16)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse::<u16>().ok()?;
    let minor = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use spop_frame::payload::CAP_ASYNC;
    use spop_frame::{Frame, FrameError, Kv};

    use super::*;

    fn hello(versions: &[&str], size: u64, caps: &[&str]) -> Hello {
        Hello {
            supported_versions: Some(versions.iter().map(|v| v.to_string()).collect()),
            max_frame_size: Some(size),
            capabilities: Some(caps.iter().map(|c| c.to_string()).collect()),
            healthcheck: false,
            engine_id: Some("engine-a".to_string()),
        }
    }

    #[test]
    fn negotiates_basic_hello() {
        let negotiated = negotiate(&hello(&["2.0"], 16380, &[]), &AgentConfig::default()).unwrap();
        assert_eq!(negotiated.version, "2.0");
        assert_eq!(negotiated.max_frame_size, 16380);
        assert!(negotiated.capabilities.is_empty());
        assert_eq!(negotiated.engine_id, "engine-a");
    }

    #[test]
    fn picks_highest_common_version() {
        let config = AgentConfig {
            supported_versions: vec!["1.0".into(), "2.0".into()],
            ..AgentConfig::default()
        };
        let negotiated = negotiate(&hello(&["1.0", "2.0", "3.1"], 16380, &[]), &config).unwrap();
        assert_eq!(negotiated.version, "2.0");
    }

    #[test]
    fn no_common_version_is_mismatch() {
        let err = negotiate(&hello(&["1.0", "bogus"], 16380, &[]), &AgentConfig::default())
            .unwrap_err();
        assert!(matches!(err, AgentError::VersionMismatch { .. }));
        assert_eq!(err.status_code(), StatusCode::BadVersion);
    }

    #[test]
    fn frame_size_is_minimum_of_all_limits() {
        let config = AgentConfig {
            max_frame_size: 4096,
            ..AgentConfig::default()
        };
        assert_eq!(
            negotiate(&hello(&["2.0"], 8192, &[]), &config).unwrap().max_frame_size,
            4096
        );
        assert_eq!(
            negotiate(&hello(&["2.0"], 1024, &[]), &config).unwrap().max_frame_size,
            1024
        );
        assert_eq!(
            negotiate(&hello(&["2.0"], 1 << 20, &[]), &AgentConfig::default())
                .unwrap()
                .max_frame_size,
            MAX_FRAME_SIZE
        );
    }

    #[test]
    fn tiny_frame_size_rejected() {
        let err = negotiate(&hello(&["2.0"], 100, &[]), &AgentConfig::default()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BadFrameSize);
    }

    #[test]
    fn capabilities_are_intersected() {
        let config = AgentConfig {
            capabilities: vec![CAP_PIPELINING.into(), CAP_FRAGMENTATION.into()],
            ..AgentConfig::default()
        };
        let negotiated = negotiate(
            &hello(&["2.0"], 16380, &[CAP_ASYNC, CAP_FRAGMENTATION, "unknown", CAP_PIPELINING]),
            &config,
        )
        .unwrap();
        assert_eq!(negotiated.capabilities, vec![CAP_FRAGMENTATION, CAP_PIPELINING]);
        assert!(negotiated.fragmentation());
        assert!(negotiated.pipelining());
    }

    #[test]
    fn missing_keys_have_dedicated_status() {
        let config = AgentConfig::default();
        let mut h = hello(&["2.0"], 16380, &[]);
        h.capabilities = None;
        assert_eq!(
            negotiate(&h, &config).unwrap_err().status_code(),
            StatusCode::NoCapabilities
        );
        h.max_frame_size = None;
        assert_eq!(
            negotiate(&h, &config).unwrap_err().status_code(),
            StatusCode::NoFrameSize
        );
        h.supported_versions = None;
        assert_eq!(
            negotiate(&h, &config).unwrap_err().status_code(),
            StatusCode::NoVersion
        );
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("2.0"), Some((2, 0)));
        assert_eq!(parse_version(" 1.12 "), Some((1, 12)));
        assert_eq!(parse_version("2"), None);
        assert_eq!(parse_version("2.0.1"), None);
        assert_eq!(parse_version("a.b"), None);
    }

    async fn run_server(client_frames: Vec<Frame>) -> (Result<Negotiated>, Vec<Frame>) {
        let mut input = Vec::new();
        FrameWriter::new(&mut input)
            .write_frames(&client_frames)
            .await
            .unwrap();

        let mut output = Vec::new();
        let mut reader = FrameReader::new(&input[..]);
        let mut writer = FrameWriter::new(&mut output);
        let result = handshake_server(&mut reader, &mut writer, &AgentConfig::default()).await;
        drop(writer);

        let mut replies = Vec::new();
        let mut reply_reader = FrameReader::new(&output[..]);
        loop {
            match reply_reader.read_frame().await {
                Ok(frame) => replies.push(frame),
                Err(FrameError::ConnectionClosed) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        (result, replies)
    }

    #[tokio::test]
    async fn server_replies_with_agent_hello() {
        let (result, replies) = run_server(vec![hello(&["2.0"], 16380, &[]).to_frame()]).await;
        assert_eq!(result.unwrap().version, "2.0");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].frame_type, FrameType::AgentHello);

        let (kv, _) = decode_kv(&replies[0].payload).unwrap();
        let agent_hello = AgentHello::from_kv(&kv).unwrap();
        assert_eq!(agent_hello.version, "2.0");
        assert_eq!(agent_hello.max_frame_size, 16380);
        assert!(agent_hello.capabilities.is_empty());
    }

    #[tokio::test]
    async fn non_hello_first_frame_gets_no_reply() {
        let notify = Frame::notify(1, 1, &[]).unwrap();
        let (result, replies) = run_server(vec![notify]).await;
        assert!(matches!(result, Err(AgentError::ProtocolViolation(_))));
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn rejection_is_answered_with_disconnect() {
        let (result, replies) = run_server(vec![hello(&["9.9"], 16380, &[]).to_frame()]).await;
        assert!(result.is_err());
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].frame_type, FrameType::AgentDisconnect);

        let (kv, _) = decode_kv(&replies[0].payload).unwrap();
        assert_eq!(Disconnect::from_kv(&kv).status(), StatusCode::BadVersion);
    }

    #[tokio::test]
    async fn empty_hello_reports_missing_version() {
        let frame = Frame::with_kv(FrameType::HaproxyHello, &Kv::new());
        let (result, replies) = run_server(vec![frame]).await;
        assert_eq!(result.unwrap_err().status_code(), StatusCode::NoVersion);

        let (kv, _) = decode_kv(&replies[0].payload).unwrap();
        assert_eq!(Disconnect::from_kv(&kv).status(), StatusCode::NoVersion);
    }
}
