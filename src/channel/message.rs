//! Wire messages for parent/child coordination.
//!
//! A frame on the wire is `base64(zlib(json(Message)))` followed by a single
//! `\n` delimiter, appended by the channel. The payload is a closed tagged
//! union; nothing outside it can be constructed by decoding.

use crate::error::{ForkpoolError, Result};
use crate::task::{TaskError, TaskResult, fresh_id};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

/// Fixed vocabulary of message meanings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// A fork body is about to run.
    ForkStart,
    /// A fork body raised an unhandled error.
    ForkError,
    /// Text the fork body wrote to stdout.
    ForkOutput,
    /// The fork body's return value.
    ForkResult,
    /// End marker of a fork execution.
    ForkComplete,
    /// A worker is idle and wants a task.
    ReadyForTask,
    /// A task assignment for a worker.
    NewTask,
    /// The pool asks a worker to exit its loop.
    Shutdown,
    /// A finished task's outcome.
    ThreadResult,
}

/// Closed payload variant type carried by a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// No payload.
    Empty,
    /// A task or fork return value.
    Value { value: Value },
    /// Captured stdout text.
    Text { text: String },
    /// A structured error descriptor.
    Error { error: TaskError },
    /// A task assignment, by id.
    Assignment { task_id: String },
    /// A full task outcome envelope.
    Outcome { outcome: TaskResult },
}

/// One discrete protocol event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    topic: Topic,
    payload: Payload,
    sender: Option<String>,
    reply_to: Option<String>,
}

impl Message {
    pub fn new(topic: Topic) -> Self {
        Self {
            id: fresh_id("msg"),
            topic,
            payload: Payload::Empty,
            sender: None,
            reply_to: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Record the fork id of the sending side.
    pub fn with_sender(mut self, fork_id: impl Into<String>) -> Self {
        self.sender = Some(fork_id.into());
        self
    }

    /// Correlate this message with the id it answers (a task id for
    /// `thread_result`).
    pub fn with_reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to = Some(id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Serialize, compress and text-encode into one delimiter-free frame.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(BASE64.encode(compressed))
    }

    /// Decode one complete frame. Any corruption at any stage is a fatal
    /// [`ForkpoolError::Decode`].
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let compressed = BASE64
            .decode(frame)
            .map_err(|e| ForkpoolError::Decode(format!("invalid base64 frame: {e}")))?;
        let mut json = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| ForkpoolError::Decode(format!("invalid zlib stream: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| ForkpoolError::Decode(format!("invalid message body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_with_correlation_ids() {
        let msg = Message::new(Topic::ThreadResult)
            .with_payload(Payload::Outcome {
                outcome: TaskResult::new(Some(json!([1, 2, 3])), "hi\n".into(), None, false),
            })
            .with_sender("fork_7")
            .with_reply_to("task_3");

        let frame = msg.encode().unwrap();
        assert!(!frame.contains('\n'));

        let decoded = Message::decode(frame.as_bytes()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.sender(), Some("fork_7"));
        assert_eq!(decoded.reply_to(), Some("task_3"));
    }

    #[test]
    fn test_error_payload_roundtrips_exactly() {
        let msg = Message::new(Topic::ForkError).with_payload(Payload::Error {
            error: TaskError::new("worker loop exploded"),
        });
        let decoded = Message::decode(msg.encode().unwrap().as_bytes()).unwrap();
        match decoded.payload() {
            Payload::Error { error } => assert_eq!(error.message(), "worker loop exploded"),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_frame_is_a_hard_error() {
        // Not base64 at all.
        assert!(matches!(
            Message::decode(b"!!! not a frame !!!"),
            Err(ForkpoolError::Decode(_))
        ));

        // Valid base64, but not a zlib stream.
        let bogus = BASE64.encode(b"plain text");
        assert!(matches!(
            Message::decode(bogus.as_bytes()),
            Err(ForkpoolError::Decode(_))
        ));

        // Truncated frame: chop a valid one in half.
        let frame = Message::new(Topic::Shutdown).encode().unwrap();
        assert!(Message::decode(frame[..frame.len() / 2].as_bytes()).is_err());
    }

    #[test]
    fn test_topic_wire_tags() {
        // Topic tags are the protocol vocabulary; they must not drift.
        assert_eq!(
            serde_json::to_string(&Topic::ReadyForTask).unwrap(),
            "\"ready_for_task\""
        );
        assert_eq!(
            serde_json::to_string(&Topic::ForkComplete).unwrap(),
            "\"fork_complete\""
        );
        assert_eq!(
            serde_json::from_str::<Topic>("\"thread_result\"").unwrap(),
            Topic::ThreadResult
        );
    }
}
