//! ROS bridge wire protocol
//!
//! The bridge speaks JSON text frames. Control frames sent by the client are
//! tagged with an `op` field; inbound topic data arrives as
//! `{"op": "publish", "topic": ..., "msg": {...}}` (the `op` is optional).
//! The `msg` body is kept as unparsed JSON so that decoding can happen off
//! the driving thread.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::trace;

/// Maximum inbound frame size (100MB by default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Control frames sent to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe {
        topic: String,
        /// ROS message type, e.g. `voxblox_msgs/Mesh`
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        msg_type: Option<String>,
    },
    Unsubscribe {
        topic: String,
    },
}

impl ControlFrame {
    pub fn subscribe(topic: impl Into<String>, msg_type: Option<&str>) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            msg_type: msg_type.map(str::to_string),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Subscribe { topic, .. } | Self::Unsubscribe { topic } => topic,
        }
    }
}

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes exceeds maximum {max_size} bytes")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Publish frame is missing the `{0}` field")]
    MissingField(&'static str),
}

/// A parsed inbound frame
#[derive(Debug)]
pub enum InboundFrame {
    /// Data published on a topic
    Publish { topic: String, payload: Box<RawValue> },
    /// Any other bridge operation (status, service responses, ...)
    Other { op: String },
}

#[derive(Deserialize)]
struct WireInbound<'a> {
    op: Option<String>,
    topic: Option<String>,
    #[serde(borrow)]
    msg: Option<&'a RawValue>,
}

/// Protocol handler for encoding control frames and parsing inbound frames
#[derive(Debug, Clone)]
pub struct Protocol {
    max_frame_size: usize,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Protocol {
    /// Set the maximum inbound frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize a control frame to its JSON text
    pub fn encode_control(&self, frame: &ControlFrame) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(frame)?;
        trace!("Encoded control frame: {}", text);
        Ok(text)
    }

    /// Parse an inbound text frame
    pub fn parse_inbound(&self, text: &str) -> Result<InboundFrame, ProtocolError> {
        if text.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max_size: self.max_frame_size,
            });
        }

        let wire: WireInbound<'_> = serde_json::from_str(text)?;

        match wire.op.as_deref() {
            None | Some("publish") => {
                let topic = wire.topic.ok_or(ProtocolError::MissingField("topic"))?;
                let payload = wire.msg.ok_or(ProtocolError::MissingField("msg"))?;
                Ok(InboundFrame::Publish {
                    topic,
                    payload: payload.to_owned(),
                })
            }
            Some(op) => Ok(InboundFrame::Other { op: op.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_json() {
        let protocol = Protocol::default();

        let subscribe = ControlFrame::subscribe("/voxblox_node/mesh", Some("voxblox_msgs/Mesh"));
        assert_eq!(
            protocol.encode_control(&subscribe).unwrap(),
            r#"{"op":"subscribe","topic":"/voxblox_node/mesh","type":"voxblox_msgs/Mesh"}"#
        );

        let untyped = ControlFrame::subscribe("/chatter", None);
        assert_eq!(
            protocol.encode_control(&untyped).unwrap(),
            r#"{"op":"subscribe","topic":"/chatter"}"#
        );

        let unsubscribe = ControlFrame::unsubscribe("/chatter");
        assert_eq!(
            protocol.encode_control(&unsubscribe).unwrap(),
            r#"{"op":"unsubscribe","topic":"/chatter"}"#
        );

        let parsed: ControlFrame =
            serde_json::from_str(r#"{"op":"subscribe","topic":"/a","type":"std_msgs/String"}"#)
                .unwrap();
        assert_eq!(parsed, ControlFrame::subscribe("/a", Some("std_msgs/String")));
        assert_eq!(parsed.topic(), "/a");
    }

    #[test]
    fn test_parse_publish() {
        let protocol = Protocol::default();

        let frame = protocol
            .parse_inbound(r#"{"op":"publish","topic":"/t","msg":{"data": [1, 2]}}"#)
            .unwrap();
        match frame {
            InboundFrame::Publish { topic, payload } => {
                assert_eq!(topic, "/t");
                assert_eq!(payload.get(), r#"{"data": [1, 2]}"#);
            }
            other => panic!("Unexpected frame: {other:?}"),
        }

        // Bare frames without an op are publications too
        let frame = protocol.parse_inbound(r#"{"topic":"/t","msg":{}}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Publish { .. }));
    }

    #[test]
    fn test_parse_other_ops() {
        let protocol = Protocol::default();
        let frame = protocol
            .parse_inbound(r#"{"op":"status","level":"error","msg":"bad topic"}"#)
            .unwrap();
        assert!(matches!(frame, InboundFrame::Other { op } if op == "status"));
    }

    #[test]
    fn test_parse_errors() {
        let protocol = Protocol::default();

        assert!(matches!(
            protocol.parse_inbound(r#"{"op":"publish","msg":{}}"#),
            Err(ProtocolError::MissingField("topic"))
        ));
        assert!(matches!(
            protocol.parse_inbound(r#"{"topic":"/t"}"#),
            Err(ProtocolError::MissingField("msg"))
        ));
        assert!(matches!(
            protocol.parse_inbound("{not json"),
            Err(ProtocolError::Json(_))
        ));

        let small = Protocol::default().with_max_frame_size(16);
        assert!(matches!(
            small.parse_inbound(r#"{"topic":"/t","msg":{"a":1}}"#),
            Err(ProtocolError::FrameTooLarge { max_size: 16, .. })
        ));
    }
}
