//! Typed bodies of connection-level frames (HELLO and DISCONNECT variants).
//!
//! All of them are plain KV lists on the wire; these types give the known
//! keys names and types. Unknown keys are ignored on decode.

use crate::codec::{Frame, FrameType};
use crate::kv::Kv;
use crate::value::TypedData;

pub const KEY_SUPPORTED_VERSIONS: &str = "supported-versions";
pub const KEY_VERSION: &str = "version";
pub const KEY_MAX_FRAME_SIZE: &str = "max-frame-size";
pub const KEY_CAPABILITIES: &str = "capabilities";
pub const KEY_HEALTHCHECK: &str = "healthcheck";
pub const KEY_ENGINE_ID: &str = "engine-id";
pub const KEY_STATUS_CODE: &str = "status-code";
pub const KEY_MESSAGE: &str = "message";

pub const CAP_PIPELINING: &str = "pipelining";
pub const CAP_ASYNC: &str = "async";
pub const CAP_FRAGMENTATION: &str = "fragmentation";

/// DISCONNECT status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Normal = 0,
    Io = 1,
    Timeout = 2,
    TooBig = 3,
    Invalid = 4,
    NoVersion = 5,
    NoFrameSize = 6,
    NoCapabilities = 7,
    BadVersion = 8,
    BadFrameSize = 9,
    FragmentationNotSupported = 10,
    InterlacedFrames = 11,
    FrameIdNotFound = 12,
    Resource = 13,
    Unknown = 99,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::Io,
            2 => Self::Timeout,
            3 => Self::TooBig,
            4 => Self::Invalid,
            5 => Self::NoVersion,
            6 => Self::NoFrameSize,
            7 => Self::NoCapabilities,
            8 => Self::BadVersion,
            9 => Self::BadFrameSize,
            10 => Self::FragmentationNotSupported,
            11 => Self::InterlacedFrames,
            12 => Self::FrameIdNotFound,
            13 => Self::Resource,
            _ => Self::Unknown,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Io => "I/O error",
            Self::Timeout => "a timeout occurred",
            Self::TooBig => "frame is too big",
            Self::Invalid => "invalid frame received",
            Self::NoVersion => "version value not found",
            Self::NoFrameSize => "max-frame-size value not found",
            Self::NoCapabilities => "capabilities value not found",
            Self::BadVersion => "unsupported version",
            Self::BadFrameSize => "max-frame-size too big or too small",
            Self::FragmentationNotSupported => "fragmentation not supported",
            Self::InterlacedFrames => "invalid interlaced frames",
            Self::FrameIdNotFound => "frame-id not found",
            Self::Resource => "resource allocation error",
            Self::Unknown => "an unknown error occurred",
        }
    }
}

/// Split a comma-separated protocol list, trimming blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// HAPROXY-HELLO body. Missing keys decode as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hello {
    pub supported_versions: Option<Vec<String>>,
    pub max_frame_size: Option<u64>,
    pub capabilities: Option<Vec<String>>,
    pub healthcheck: bool,
    pub engine_id: Option<String>,
}

impl Hello {
    pub fn from_kv(kv: &Kv) -> Self {
        let mut hello = Self::default();
        for (key, value) in kv.iter() {
            match key {
                KEY_SUPPORTED_VERSIONS => {
                    hello.supported_versions = value.as_str().map(split_list);
                }
                KEY_MAX_FRAME_SIZE => hello.max_frame_size = value.as_u64(),
                KEY_CAPABILITIES => hello.capabilities = value.as_str().map(split_list),
                KEY_HEALTHCHECK => hello.healthcheck = value.as_bool().unwrap_or(false),
                KEY_ENGINE_ID => hello.engine_id = value.as_str().map(str::to_owned),
                _ => {}
            }
        }
        hello
    }

    pub fn to_kv(&self) -> Kv {
        let mut kv = Kv::with_capacity(5);
        if let Some(versions) = &self.supported_versions {
            kv.push(KEY_SUPPORTED_VERSIONS, versions.join(","));
        }
        if let Some(size) = self.max_frame_size {
            kv.push(KEY_MAX_FRAME_SIZE, TypedData::Uint32(size as u32));
        }
        if let Some(capabilities) = &self.capabilities {
            kv.push(KEY_CAPABILITIES, capabilities.join(","));
        }
        if self.healthcheck {
            kv.push(KEY_HEALTHCHECK, true);
        }
        if let Some(engine_id) = &self.engine_id {
            kv.push(KEY_ENGINE_ID, engine_id.as_str());
        }
        kv
    }

    pub fn to_frame(&self) -> Frame {
        Frame::with_kv(FrameType::HaproxyHello, &self.to_kv())
    }
}

/// AGENT-HELLO body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHello {
    pub version: String,
    pub max_frame_size: u32,
    pub capabilities: Vec<String>,
}

impl AgentHello {
    /// Returns `None` when `version` or `max-frame-size` is missing.
    pub fn from_kv(kv: &Kv) -> Option<Self> {
        let version = kv.get(KEY_VERSION)?.as_str()?.to_owned();
        let max_frame_size = u32::try_from(kv.get(KEY_MAX_FRAME_SIZE)?.as_u64()?).ok()?;
        let capabilities = kv
            .get(KEY_CAPABILITIES)
            .and_then(TypedData::as_str)
            .map(split_list)
            .unwrap_or_default();
        Some(Self {
            version,
            max_frame_size,
            capabilities,
        })
    }

    pub fn to_kv(&self) -> Kv {
        let mut kv = Kv::with_capacity(3);
        kv.push(KEY_VERSION, self.version.as_str());
        kv.push(KEY_MAX_FRAME_SIZE, self.max_frame_size);
        kv.push(KEY_CAPABILITIES, self.capabilities.join(","));
        kv
    }

    pub fn to_frame(&self) -> Frame {
        Frame::with_kv(FrameType::AgentHello, &self.to_kv())
    }
}

/// DISCONNECT / AGENT-DISCONNECT body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub status_code: u32,
    pub message: String,
}

impl Disconnect {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status_code: status.code(),
            message: status.reason().to_string(),
        }
    }

    pub fn with_message(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code: status.code(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.status_code)
    }

    pub fn from_kv(kv: &Kv) -> Self {
        let status_code = kv
            .get(KEY_STATUS_CODE)
            .and_then(TypedData::as_u64)
            .and_then(|code| u32::try_from(code).ok())
            .unwrap_or(StatusCode::Unknown.code());
        let message = kv
            .get(KEY_MESSAGE)
            .and_then(TypedData::as_str)
            .unwrap_or_default()
            .to_owned();
        Self {
            status_code,
            message,
        }
    }

    pub fn to_kv(&self) -> Kv {
        let mut kv = Kv::with_capacity(2);
        kv.push(KEY_STATUS_CODE, self.status_code);
        kv.push(KEY_MESSAGE, self.message.as_str());
        kv
    }

    pub fn to_frame(&self, frame_type: FrameType) -> Frame {
        Frame::with_kv(frame_type, &self.to_kv())
    }
}
