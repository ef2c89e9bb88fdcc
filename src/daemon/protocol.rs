//! Wire format of the watch stream
//!
//! Newline-delimited JSON:
//! - client: `{"cmd":"watch","topic":"*","agent":"alice","since":"<id or RFC3339>"}`
//! - server ack: `{"ok":true}` or `{"ok":false,"error":{code,message,retryable}}`
//! - server stream: `{"msg":{...}}` per message, or `{"ok":false,"error":{...}}` to abort

use crate::error::{DataError, DataResult};
use crate::store::MAX_MESSAGE_SIZE;
use crate::types::Message;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Longest accepted line: one message plus envelope slack
pub const MAX_FRAME_BYTES: usize = MAX_MESSAGE_SIZE + 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Request that opens a watch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub cmd: String,
    /// `*`, a topic, or `@agent`
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    /// Last seen message ID, or an RFC3339 timestamp
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub since: String,
}

impl WatchRequest {
    pub fn watch(topic: impl Into<String>, agent: impl Into<String>, since: impl Into<String>) -> Self {
        Self {
            cmd: "watch".to_string(),
            topic: topic.into(),
            agent: agent.into(),
            since: since.into(),
        }
    }
}

/// Error object sent by the daemon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl From<WireError> for DataError {
    fn from(e: WireError) -> Self {
        DataError::Daemon {
            code: e.code,
            message: e.message,
            retryable: e.retryable,
        }
    }
}

/// Reply to a [`WatchRequest`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    msg: Option<Message>,
}

/// One decoded stream line
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(Box<Message>),
    /// A frame carrying neither a message nor an error (e.g. `{"ok":true}`)
    KeepAlive,
}

/// Parse the ack line; a negative ack becomes an error
pub fn decode_ack(line: &[u8]) -> DataResult<()> {
    let ack: Ack = serde_json::from_slice(line)
        .map_err(|e| DataError::Protocol(format!("invalid ack: {}", e)))?;
    if ack.ok {
        return Ok(());
    }
    Err(match ack.error {
        Some(error) => error.into(),
        None => DataError::Protocol("daemon refused watch without an error".to_string()),
    })
}

/// Parse one stream line
pub fn decode_frame(line: &[u8]) -> DataResult<StreamEvent> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(DataError::Protocol(format!(
            "frame of {} bytes exceeds {}",
            line.len(),
            MAX_FRAME_BYTES
        )));
    }
    let frame: StreamFrame = serde_json::from_slice(line)
        .map_err(|e| DataError::Protocol(format!("invalid frame: {}", e)))?;
    if let Some(msg) = frame.msg {
        return Ok(StreamEvent::Message(Box::new(msg)));
    }
    if let Some(error) = frame.error {
        return Err(error.into());
    }
    if frame.ok == Some(false) {
        return Err(DataError::Protocol("stream aborted without an error".to_string()));
    }
    Ok(StreamEvent::KeepAlive)
}

/// Write one JSON value followed by a newline
pub fn write_frame<W: Write>(writer: &mut W, value: &impl Serialize) -> io::Result<()> {
    let mut line = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Result of one attempt to read a line
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// Read timed out; any partial line is kept for the next call
    Idle,
    /// Peer closed the connection at a line boundary
    Closed,
}

/// Splits a byte stream into bounded lines, surviving read timeouts
pub struct FrameReader<R> {
    inner: R,
    pending: Vec<u8>,
    max_frame: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_BYTES)
    }

    pub fn with_limit(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            max_frame,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Next non-blank line without its terminator
    pub fn next_frame(&mut self) -> DataResult<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if line.len() > self.max_frame {
                    return Err(self.oversized());
                }
                return Ok(ReadOutcome::Frame(line));
            }
            if self.pending.len() > self.max_frame {
                return Err(self.oversized());
            }

            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    if self.pending.iter().all(u8::is_ascii_whitespace) {
                        self.pending.clear();
                        return Ok(ReadOutcome::Closed);
                    }
                    return Err(DataError::Protocol("stream ended mid-frame".to_string()));
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Idle);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DataError::Unavailable(format!("read failed: {}", e))),
            }
        }
    }

    fn oversized(&mut self) -> DataError {
        self.pending.clear();
        DataError::Protocol(format!("frame exceeds {} bytes", self.max_frame))
    }
}
