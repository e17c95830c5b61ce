use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const CTRL_C: u8 = 0x03;
pub const CTRL_X: u8 = 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Frames a tagged streaming client sends to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Command { id: u64, text: String },
    Control { byte: u8 },
}

/// Frames the hub sends to a tagged streaming client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Output {
        #[serde(default)]
        command_id: Option<u64>,
        stream: OutputStream,
        data: String,
    },
    Settled {
        command_id: u64,
    },
    Exited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamProtocol {
    /// Unframed text in both directions.
    #[default]
    Raw,
    /// One JSON frame per websocket text message.
    Tagged,
}

impl StreamProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamProtocol::Raw => "raw",
            StreamProtocol::Tagged => "tagged",
        }
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamProtocol {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "raw" => Ok(StreamProtocol::Raw),
            "tagged" | "json" => Ok(StreamProtocol::Tagged),
            other => Err(format!("unknown stream protocol '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Same as [`encode_frame`] with a trailing newline, for line-delimited sockets.
pub fn encode_line<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded = encode_frame(value, max_frame_bytes)?.into_bytes();
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(raw: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let trimmed = raw.trim_end_matches(&['\n', '\r'][..]);
    if trimmed.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: trimmed.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(trimmed).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Interprets a raw-protocol client message as bytes for the process stdin.
///
/// A lone control byte is passed through untouched, anything else is
/// terminated with a newline if it is not already.
pub fn raw_input_bytes(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    if bytes.len() == 1 && bytes[0].is_ascii_control() && bytes[0] != b'\n' {
        return bytes.to_vec();
    }
    let mut out = bytes.to_vec();
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out
}
