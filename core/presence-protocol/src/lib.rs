//! Wire types and framing for the rich presence IPC channel.
//!
//! This crate is shared by the presence client and by test peers so the
//! frame layout and command schema cannot drift. A frame is an 8-byte header
//! (opcode and payload length, both native-endian `u32`) followed by exactly
//! `length` bytes of UTF-8 JSON. The channel is local to one machine, so no
//! byte-order conversion is attempted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HEADER_LEN: usize = 8;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024; // 16KB
pub const HANDSHAKE_VERSION: u32 = 1;

/// Shorter text fields are rejected by the peer, so they are left out.
pub const MIN_TEXT_LEN: usize = 2;
pub const MAX_TEXT_LEN: usize = 128;
pub const REPOSITORY_BUTTON_LABEL: &str = "View Repository";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl Opcode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Handshake),
            1 => Ok(Opcode::Frame),
            2 => Ok(Opcode::Close),
            3 => Ok(Opcode::Ping),
            4 => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds maximum message size of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("frame header must be 8 bytes, got {0}")]
    ShortHeader(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("frame declares {declared} payload bytes but {actual} were supplied")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("failed to serialize command: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u32,
    pub length: u32,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&self.opcode.to_ne_bytes());
        bytes[4..].copy_from_slice(&self.length.to_ne_bytes());
        bytes
    }

    pub fn opcode(&self) -> Result<Opcode, FrameError> {
        Opcode::try_from(self.opcode)
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let header = FrameHeader {
        opcode: opcode.as_u32(),
        length: payload.len() as u32,
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Serializes `command` to JSON and frames it in one step.
pub fn encode_command<T: Serialize>(opcode: Opcode, command: &T) -> Result<Vec<u8>, FrameError> {
    let payload =
        serde_json::to_vec(command).map_err(|err| FrameError::Serialize(err.to_string()))?;
    encode_frame(opcode, &payload)
}

/// Decodes and validates a header. Oversized lengths and unknown opcodes are
/// rejected here, before any payload buffer is allocated.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
    if bytes.len() != HEADER_LEN {
        return Err(FrameError::ShortHeader(bytes.len()));
    }

    let mut opcode = [0u8; 4];
    let mut length = [0u8; 4];
    opcode.copy_from_slice(&bytes[..4]);
    length.copy_from_slice(&bytes[4..]);
    let header = FrameHeader {
        opcode: u32::from_ne_bytes(opcode),
        length: u32::from_ne_bytes(length),
    };

    header.opcode()?;
    if header.payload_len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::PayloadTooLarge {
            len: header.payload_len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(header)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::ShortHeader(bytes.len()));
    }
    let header = decode_header(&bytes[..HEADER_LEN])?;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != header.payload_len() {
        return Err(FrameError::LengthMismatch {
            declared: header.payload_len(),
            actual: payload.len(),
        });
    }
    Ok(Frame {
        opcode: header.opcode()?,
        payload: payload.to_vec(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Activity
// ─────────────────────────────────────────────────────────────────────────────

/// What the user is doing, as shown by the peer.
///
/// Compared field-by-field before every write so unchanged activities never
/// reach the channel. Timestamps are epoch seconds; `0` means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceActivity {
    pub state: String,
    pub details: String,
    pub large_image: String,
    pub large_text: String,
    pub small_image: String,
    pub small_text: String,
    pub repository_url: String,
    pub start_time: i64,
    pub end_time: i64,
    pub enable_button_repository: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<Button>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

impl Assets {
    fn is_empty(&self) -> bool {
        self.large_image.is_none()
            && self.large_text.is_none()
            && self.small_image.is_none()
            && self.small_text.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

impl ActivityPayload {
    pub fn from_activity(activity: &PresenceActivity) -> Self {
        let assets = Assets {
            large_image: image(&activity.large_image),
            large_text: text(&activity.large_text),
            small_image: image(&activity.small_image),
            small_text: text(&activity.small_text),
        };

        let buttons = if activity.enable_button_repository && !activity.repository_url.is_empty()
        {
            Some(vec![Button {
                label: REPOSITORY_BUTTON_LABEL.to_string(),
                url: clip(&activity.repository_url),
            }])
        } else {
            None
        };

        Self {
            state: text(&activity.state),
            details: text(&activity.details),
            timestamps: timestamps(activity),
            assets: (!assets.is_empty()).then_some(assets),
            buttons,
        }
    }

    /// The reduced shape shown while idle: details, timestamps and the large
    /// asset only.
    pub fn idle(activity: &PresenceActivity) -> Self {
        let assets = Assets {
            large_image: image(&activity.large_image),
            large_text: text(&activity.large_text),
            small_image: None,
            small_text: None,
        };

        Self {
            state: None,
            details: text(&activity.details),
            timestamps: timestamps(activity),
            assets: (!assets.is_empty()).then_some(assets),
            buttons: None,
        }
    }
}

fn timestamps(activity: &PresenceActivity) -> Option<Timestamps> {
    (activity.start_time > 0).then(|| Timestamps {
        start: activity.start_time,
        end: (activity.end_time > 0).then_some(activity.end_time),
    })
}

fn text(value: &str) -> Option<String> {
    (value.len() >= MIN_TEXT_LEN).then(|| clip(value))
}

fn image(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| clip(value))
}

/// Truncates to `MAX_TEXT_LEN` bytes without splitting a UTF-8 sequence.
pub fn clip(value: &str) -> String {
    if value.len() <= MAX_TEXT_LEN {
        return value.to_string();
    }
    let mut end = MAX_TEXT_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub v: u32,
    pub client_id: String,
}

impl Handshake {
    pub fn new(client_id: u64) -> Self {
        Self {
            v: HANDSHAKE_VERSION,
            client_id: client_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetActivityArgs {
    pub pid: u32,
    /// `None` serializes as `null`, which clears the activity on the peer.
    pub activity: Option<ActivityPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetActivityCommand {
    pub cmd: String,
    pub args: SetActivityArgs,
    pub nonce: String,
}

impl SetActivityCommand {
    pub fn new(pid: u32, activity: Option<ActivityPayload>, nonce: String) -> Self {
        Self {
            cmd: "SET_ACTIVITY".to_string(),
            args: SetActivityArgs { pid, activity },
            nonce,
        }
    }

    pub fn clear(pid: u32, nonce: String) -> Self {
        Self::new(pid, None, nonce)
    }
}

/// Lightweight round-trip used as a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchProbe {
    pub cmd: String,
    pub evt: String,
}

impl Default for DispatchProbe {
    fn default() -> Self {
        Self {
            cmd: "DISPATCH".to_string(),
            evt: "READY".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Accepted,
    Rejected { code: String, message: String },
}

impl ResponseStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ResponseStatus::Accepted)
    }
}

/// Classifies a reply body.
///
/// The peer's protocol surface is larger than what is modelled here, so
/// parsing is liberal: `evt == "ERROR"` or a non-zero `code` (top level or
/// under `data`) is a rejection, anything else that arrived is accepted.
/// Bodies that are not JSON at all are accepted too.
pub fn classify_response(body: &[u8]) -> ResponseStatus {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return ResponseStatus::Accepted;
    }

    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return ResponseStatus::Accepted,
    };

    let is_error_event = value.get("evt").and_then(Value::as_str) == Some("ERROR");
    let code = find_field(&value, "code");
    let nonzero_code = code.map(|code| !is_zero(code)).unwrap_or(false);

    if is_error_event || nonzero_code {
        let (code, message) = error_fields(&value);
        return ResponseStatus::Rejected { code, message };
    }

    ResponseStatus::Accepted
}

/// Extracts `{code, message}` from a CLOSE frame or error reply.
pub fn error_fields_from_body(body: &[u8]) -> (String, String) {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => error_fields(&value),
        Err(_) => (
            "Unknown".to_string(),
            String::from_utf8_lossy(body).trim().to_string(),
        ),
    }
}

fn error_fields(value: &Value) -> (String, String) {
    let code = match find_field(value, "code") {
        Some(Value::String(code)) => code.clone(),
        Some(Value::Number(code)) => code.to_string(),
        _ => "Unknown".to_string(),
    };
    let message = find_field(value, "message")
        .and_then(Value::as_str)
        .unwrap_or("Peer error")
        .to_string();
    (code, message)
}

fn find_field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .get(key)
        .or_else(|| value.get("data").and_then(|data| data.get(key)))
}

fn is_zero(code: &Value) -> bool {
    match code {
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.trim() == "0",
        Value::Null => true,
        _ => false,
    }
}
