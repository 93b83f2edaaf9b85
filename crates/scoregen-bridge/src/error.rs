//! Errors surfaced by the bridge to its callers.
//!
//! Every variant that follows a write to the worker keeps the raw output the
//! worker produced for that request, so the UI can show it for diagnosis.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker executable could not be launched. Not retried automatically.
    #[error("Failed to spawn worker {}: {source}", bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker's input is not writable right now.
    #[error("Worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    /// The caller passed no payload.
    #[error("Invalid payload for {command}: payload is required")]
    InvalidPayload { command: String },

    /// The command or its completion markers are malformed.
    #[error("Invalid command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    /// No command with this name has been declared.
    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    /// The worker signaled failure for this request.
    #[error("{command} failed: {}", output.trim_end())]
    WorkerReportedFailure { command: String, output: String },

    /// Neither completion marker arrived before the deadline.
    #[error("{command} timed out after {timeout_ms} ms")]
    Timeout {
        command: String,
        timeout_ms: u64,
        output: String,
    },

    /// The worker exited while the request was outstanding.
    #[error("Worker exited (code {}) while {command} was running", describe_code(*code))]
    WorkerExited {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// Output chunks were dropped before this request could read them, so
    /// its completion marker may be lost.
    #[error("{command} lost {skipped} output chunks; worker is producing output too fast")]
    OutputLost {
        command: String,
        skipped: u64,
        output: String,
    },

    /// The bridge configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] scoregen_core::Error),

    /// The payload could not be serialized.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl BridgeError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            reason: reason.into(),
        }
    }

    /// Raw worker output captured before the request failed, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::WorkerReportedFailure { output, .. }
            | Self::Timeout { output, .. }
            | Self::WorkerExited { output, .. }
            | Self::OutputLost { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_embeds_worker_output() {
        let err = BridgeError::WorkerReportedFailure {
            command: "processAudio".into(),
            output: "FAIL: bad header\n".into(),
        };
        assert_eq!(err.to_string(), "processAudio failed: FAIL: bad header");
        assert_eq!(err.output(), Some("FAIL: bad header\n"));
    }

    #[test]
    fn exit_without_code_reads_as_signal() {
        let err = BridgeError::WorkerExited {
            command: "generatePDF".into(),
            code: None,
            output: String::new(),
        };
        assert!(err.to_string().contains("code signal"));
        assert!(BridgeError::unavailable("stdin closed").output().is_none());
    }

    #[test]
    fn config_error_reads_as_configuration_problem() {
        let err = BridgeError::from(scoregen_core::Error::Config(
            "worker.bin must not be empty".into(),
        ));
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Configuration error: worker.bin must not be empty"
        );
    }
}
