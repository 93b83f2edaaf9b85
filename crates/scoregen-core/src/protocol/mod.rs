//! Wire protocol between the bridge and the native `ScoreGen` worker.
//!
//! Requests are single lines `"<command> <json>\n"` on the worker's stdin.
//! Completion is signaled on stdout either by literal sentinel text (legacy
//! worker) or by framed lines carrying a message-kind tag.

mod frame;
mod request;

pub use frame::{FRAME_PREFIX, Frame, FrameKind, encode_frame, parse_frame};
pub use request::{RequestLine, is_valid_command_name};
