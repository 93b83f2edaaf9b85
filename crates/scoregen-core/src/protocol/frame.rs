//! Framed completion lines.
//!
//! A framed worker marks protocol messages with [`FRAME_PREFIX`] at the start
//! of a stdout line followed by a JSON object. Only complete lines are frames,
//! so diagnostic text that happens to contain a marker never completes a
//! request. Unknown kinds are tolerated and surface as [`FrameKind::Unknown`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Marker that opens a framed line.
pub const FRAME_PREFIX: &str = "@@scoregen ";

/// Message-kind tag carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Success,
    Failure,
    Progress,
    #[serde(other)]
    Unknown,
}

/// A single framed message from the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    #[serde(default)]
    pub message: String,
}

impl Frame {
    pub fn new(kind: FrameKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this frame ends the current request.
    pub const fn is_terminal(&self) -> bool {
        matches!(self.kind, FrameKind::Success | FrameKind::Failure)
    }
}

/// Parse one stdout line.
///
/// Returns `Ok(None)` for ordinary diagnostic lines and an error for a line
/// that carries the prefix but no valid frame body.
pub fn parse_frame(line: &str) -> Result<Option<Frame>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(body) = line.strip_prefix(FRAME_PREFIX) else {
        return Ok(None);
    };
    serde_json::from_str(body)
        .map(Some)
        .map_err(|e| Error::FrameParse(format!("{e}: {body}")))
}

/// Encode a frame as a full stdout line, newline included.
pub fn encode_frame(frame: &Frame) -> Result<String> {
    Ok(format!("{FRAME_PREFIX}{}\n", serde_json::to_string(frame)?))
}
