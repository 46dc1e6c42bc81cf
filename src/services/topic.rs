//! Inbound topic grammar.
//!
//! ```text
//! <namespace>/gateway/<gateway_code>/<kind>
//! <namespace>/<device_code>/<kind>            (legacy flat form)
//! ```
//!
//! `kind` is `data`, `status` or `alert`; alerts may carry extra levels
//! (`alert/#`). Parsing is structural only and never looks at the inventory.

use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

const GATEWAY_SEGMENT: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    Status,
    Alert,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Data => "data",
            MessageKind::Status => "status",
            MessageKind::Alert => "alert",
        }
    }

    fn from_segment(s: &str) -> Option<Self> {
        match s {
            "data" => Some(MessageKind::Data),
            "status" => Some(MessageKind::Status),
            "alert" => Some(MessageKind::Alert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub namespace: String,
    pub gateway_code: String,
    pub kind: MessageKind,
    /// Levels after `alert`, joined with `/` (e.g. `battery/low`).
    pub alert_path: Option<String>,
    /// Parsed from the flat `<namespace>/<device_code>/<kind>` form.
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    NotUtf8,
    EmptySegment { index: usize },
    SegmentCount { found: usize },
    UnknownKind(String),
}

impl Display for TopicError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Empty => write!(f, "empty topic"),
            TopicError::NotUtf8 => write!(f, "topic is not valid UTF-8"),
            TopicError::EmptySegment { index } => write!(f, "segment {} is empty", index),
            TopicError::SegmentCount { found } => write!(f, "unexpected segment count {}", found),
            TopicError::UnknownKind(k) => write!(f, "unknown message kind {:?}", k),
        }
    }
}

impl Error for TopicError {}

pub fn parse(topic: &str) -> Result<Intent, TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    let segments = topic.split('/').collect::<Vec<_>>();
    if let Some(index) = segments.iter().position(|s| s.is_empty()) {
        return Err(TopicError::EmptySegment { index });
    }

    // `<ns>/gateway/<code>/<kind>...` takes precedence; a legacy device
    // literally named "gateway" would need four levels and is not supported.
    let (gateway_code, rest, legacy) = if segments.len() >= 4 && segments[1] == GATEWAY_SEGMENT {
        (segments[2], &segments[3..], false)
    } else if segments.len() >= 3 {
        (segments[1], &segments[2..], true)
    } else {
        return Err(TopicError::SegmentCount { found: segments.len() });
    };

    let kind = MessageKind::from_segment(rest[0]).ok_or_else(|| TopicError::UnknownKind(rest[0].to_string()))?;
    let alert_path = match (kind, rest.len()) {
        (_, 1) => None,
        (MessageKind::Alert, _) => Some(rest[1..].join("/")),
        _ => return Err(TopicError::SegmentCount { found: segments.len() }),
    };

    Ok(Intent {
        namespace: segments[0].to_string(),
        gateway_code: gateway_code.to_string(),
        kind,
        alert_path,
        legacy,
    })
}
