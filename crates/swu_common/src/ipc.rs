//! Controller IPC protocol
//!
//! Every message travels as one JSON object per line:
//! `{"magic": 0x14052001, "message": {"type": ..., "data": ...}}`.
//!
//! Two independent channels are used:
//!   - control socket: one-shot commands, and the image stream once a
//!     `ReqInstall` has been acknowledged (raw bytes, ended by a half-close)
//!   - progress socket: `NotifyStream` followed by a stream of `Notify` lines

use crate::error::{SwuError, SwuResult};
use serde::{Deserialize, Serialize};

/// Envelope tag, rejected frames carry anything else
pub const IPC_MAGIC: u32 = 0x1405_2001;

/// Version of the install request layout
pub const API_VERSION: u32 = 1;

/// Upper bound for every bounded string field, terminator included
pub const GENERAL_STRING_SIZE: usize = 256;

pub const AES_KEY_LEN: usize = 64;
pub const AES_IVT_LEN: usize = 32;

/// Coarse controller status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Idle,
    Running,
    Success,
    Failure,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Dry-run selection for an install request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DryRun {
    /// Let the controller use its configured default
    #[default]
    Default,
    DryRun,
    Install,
}

/// Begin-session request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub api_version: u32,
    pub dry_run: DryRun,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_mode: Option<String>,
    #[serde(default)]
    pub info: String,
}

impl Default for InstallRequest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION,
            dry_run: DryRun::Default,
            software_set: None,
            running_mode: None,
            info: String::new(),
        }
    }
}

impl InstallRequest {
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = if dry_run { DryRun::DryRun } else { DryRun::Default };
        self
    }

    /// Select a software set and running mode. Empty sets are ignored.
    pub fn selection(mut self, software_set: &str, running_mode: &str) -> Self {
        if !software_set.is_empty() {
            self.software_set = Some(bounded(software_set));
            self.running_mode = Some(bounded(running_mode));
        }
        self
    }

    pub fn info(mut self, info: &str) -> Self {
        self.info = bounded(info);
        self
    }
}

/// Accepted version window sent before an install
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub minimum: String,
    pub maximum: String,
    pub current: String,
}

/// Status update pushed on the progress channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub status: RecoveryStatus,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub msg: String,
}

impl Notification {
    pub fn new(status: RecoveryStatus, msg: impl Into<String>) -> Self {
        Self {
            status,
            error: 0,
            msg: msg.into(),
        }
    }
}

/// Answer to `GetStatus`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub current: RecoveryStatus,
    pub last_result: RecoveryStatus,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub desc: String,
}

/// Message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    Ack,
    Nack { reason: String },
    ReqInstall(InstallRequest),
    SetAesKey { key: String, ivt: String },
    SetVersionsRange(VersionRange),
    PostUpdate,
    GetStatus,
    Status(StatusReport),
    NotifyStream,
    Notify(Notification),
}

impl Message {
    /// Build a `SetAesKey` message, key and IV are ASCII hex of fixed length
    pub fn aes_key(key: &str, ivt: &str) -> SwuResult<Self> {
        if key.len() != AES_KEY_LEN || ivt.len() != AES_IVT_LEN {
            return Err(SwuError::InvalidInput(format!(
                "AES key must be {} characters and IV {} characters",
                AES_KEY_LEN, AES_IVT_LEN
            )));
        }
        if !key.chars().chain(ivt.chars()).all(|c| c.is_ascii_hexdigit()) {
            return Err(SwuError::InvalidInput(
                "AES key and IV must be hex strings".to_string(),
            ));
        }
        Ok(Self::SetAesKey {
            key: key.to_string(),
            ivt: ivt.to_string(),
        })
    }

    /// Build a `SetVersionsRange` message. Missing bounds are sent empty.
    pub fn versions_range(
        minimum: Option<&str>,
        maximum: Option<&str>,
        current: Option<&str>,
    ) -> Self {
        Self::SetVersionsRange(VersionRange {
            minimum: minimum.map(bounded).unwrap_or_default(),
            maximum: maximum.map(bounded).unwrap_or_default(),
            current: current.map(bounded).unwrap_or_default(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "Ack",
            Self::Nack { .. } => "Nack",
            Self::ReqInstall(_) => "ReqInstall",
            Self::SetAesKey { .. } => "SetAesKey",
            Self::SetVersionsRange(_) => "SetVersionsRange",
            Self::PostUpdate => "PostUpdate",
            Self::GetStatus => "GetStatus",
            Self::Status(_) => "Status",
            Self::NotifyStream => "NotifyStream",
            Self::Notify(_) => "Notify",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Frame {
    magic: u32,
    message: Message,
}

/// Serialize a message into a newline-terminated frame
pub fn encode(message: &Message) -> SwuResult<Vec<u8>> {
    let frame = Frame {
        magic: IPC_MAGIC,
        message: message.clone(),
    };
    let mut bytes = serde_json::to_vec(&frame)
        .map_err(|e| SwuError::Protocol(format!("cannot encode {}: {}", message.name(), e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one frame. Trailing whitespace (the line terminator) is ignored.
pub fn decode(line: &[u8]) -> SwuResult<Message> {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    let frame: Frame = serde_json::from_slice(&line[..end])
        .map_err(|e| SwuError::Protocol(format!("malformed message: {}", e)))?;
    if frame.magic != IPC_MAGIC {
        return Err(SwuError::Protocol(format!(
            "bad magic {:#x} (expected {:#x})",
            frame.magic, IPC_MAGIC
        )));
    }
    Ok(frame.message)
}

/// Truncate to fit a bounded field, never splitting a character
pub fn bounded(value: &str) -> String {
    let max = GENERAL_STRING_SIZE - 1;
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
