//! Request line encoding.

use serde_json::Value;

use crate::error::{Error, Result};

/// One command sent to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLine {
    pub command: String,
    pub payload: Value,
}

/// A command name is a bare token: non-empty and free of whitespace.
pub fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

impl RequestLine {
    /// Build a request, rejecting malformed command names and null payloads.
    pub fn new(command: impl Into<String>, payload: Value) -> Result<Self> {
        let command = command.into();
        if !is_valid_command_name(&command) {
            return Err(Error::Protocol(format!(
                "command name {command:?} must be a non-empty token without whitespace"
            )));
        }
        if payload.is_null() {
            return Err(Error::Protocol(format!(
                "payload for {command} must not be null"
            )));
        }
        Ok(Self { command, payload })
    }

    /// Encode as `"<command> <json>\n"`.
    ///
    /// Compact JSON never contains a raw newline (string contents are escaped),
    /// so the line separator cannot appear inside the payload.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(&self.payload)?;
        Ok(format!("{} {json}\n", self.command))
    }

    /// Parse a line produced by [`RequestLine::encode`].
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let (command, json) = line
            .split_once(' ')
            .ok_or_else(|| Error::Protocol(format!("missing payload in request line {line:?}")))?;
        let payload: Value = serde_json::from_str(json)?;
        Self::new(command, payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_writes_single_terminated_line() {
        let req = RequestLine::new("processAudio", json!({"take": 1})).unwrap();
        assert_eq!(req.encode().unwrap(), "processAudio {\"take\":1}\n");
    }

    #[test]
    fn embedded_newlines_are_escaped() {
        let req = RequestLine::new(
            "processAudio",
            json!({"workTitle": "Nocturne\nOp. 9", "creator": "a b\tc"}),
        )
        .unwrap();
        let line = req.encode().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
        assert_eq!(RequestLine::parse(&line).unwrap(), req);
    }

    #[test]
    fn null_payload_rejected() {
        let err = RequestLine::new("processAudio", Value::Null).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn command_names_must_be_bare_tokens() {
        assert!(is_valid_command_name("generatePDF"));
        assert!(!is_valid_command_name(""));
        assert!(!is_valid_command_name("process audio"));
        assert!(!is_valid_command_name("process\naudio"));
        assert!(RequestLine::new("bad name", json!({})).is_err());
    }

    #[test]
    fn parse_rejects_line_without_payload() {
        assert!(RequestLine::parse("processAudio\n").is_err());
        assert!(RequestLine::parse("processAudio {not json}\n").is_err());
    }
}
