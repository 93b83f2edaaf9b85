//! Command facade: named worker operations with preconfigured completion
//! markers.
//!
//! A [`Bridge`] owns the supervisor and dispatcher. Each [`Command`] bundles a
//! name, a [`Matcher`] and a timeout; invoking it fetches the live worker and
//! runs one request. New commands need no protocol change as long as the
//! worker prints matching markers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use scoregen_core::config::{CommandConfig, Config};

use crate::dispatcher::{Completion, Dispatcher, Request};
use crate::error::BridgeError;
use crate::matcher::Matcher;
use crate::supervisor::{RespawnPolicy, Supervisor};

/// Transcribe the last recorded take into MusicXML.
pub const PROCESS_AUDIO: &str = "processAudio";
/// Lay out a MusicXML score as PDF.
pub const GENERATE_PDF: &str = "generatePDF";

/// Declaration of one worker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub matcher: Matcher,
    /// Falls back to the bridge default when unset.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn sentinel(
        name: impl Into<String>,
        success: impl Into<String>,
        failure: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: Matcher::sentinel(success, failure),
            timeout: None,
        }
    }

    pub fn framed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            matcher: Matcher::Framed,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&CommandConfig> for CommandSpec {
    fn from(config: &CommandConfig) -> Self {
        let spec = if config.framed {
            Self::framed(&config.name)
        } else {
            Self::sentinel(&config.name, &config.success, &config.failure)
        };
        match config.timeout_secs {
            Some(secs) => spec.with_timeout(Duration::from_secs(secs)),
            None => spec,
        }
    }
}

/// Commands the stock worker understands.
pub fn builtin_commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec::sentinel(
            PROCESS_AUDIO,
            "MusicXML file generated successfully.",
            "Failed to generate MusicXML file.",
        ),
        CommandSpec::sentinel(
            GENERATE_PDF,
            "PDF successfully generated",
            "PDF generation failed",
        ),
    ]
}

/// Metadata the UI collects for a recorded take before transcription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeMetadata {
    pub work_title: String,
    pub work_number: String,
    pub movement_number: String,
    pub movement_title: String,
    pub creator_name: String,
    pub instrument: String,
    pub time_signature: String,
}

/// Input for the score-layout step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfRequest {
    pub musicxml_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Supervisor + dispatcher + declared commands. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    supervisor: Supervisor,
    dispatcher: Dispatcher,
    commands: BTreeMap<String, CommandSpec>,
    default_timeout: Duration,
}

impl Bridge {
    /// Build a bridge from resolved configuration. The worker is started
    /// lazily by the first command.
    pub fn new(config: &Config) -> Result<Self, BridgeError> {
        config.validate()?;
        let supervisor = Supervisor::new(
            config.worker.clone(),
            RespawnPolicy::from(&config.respawn),
        );
        let commands = builtin_commands()
            .into_iter()
            .chain(config.commands.iter().map(CommandSpec::from));
        Ok(Self::with_supervisor(
            supervisor,
            commands,
            config.requests.default_timeout(),
        ))
    }

    /// Assemble a bridge from parts. Later specs replace earlier ones with
    /// the same name.
    pub fn with_supervisor(
        supervisor: Supervisor,
        commands: impl IntoIterator<Item = CommandSpec>,
        default_timeout: Duration,
    ) -> Self {
        let commands = commands
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self {
            inner: Arc::new(BridgeInner {
                supervisor,
                dispatcher: Dispatcher::new(),
                commands,
                default_timeout,
            }),
        }
    }

    /// A command with the given sentinels, independent of the declared set.
    pub fn define_command(
        &self,
        name: impl Into<String>,
        success: impl Into<String>,
        failure: impl Into<String>,
    ) -> Command {
        self.command_from_spec(CommandSpec::sentinel(name, success, failure))
    }

    pub fn command_from_spec(&self, spec: CommandSpec) -> Command {
        Command {
            bridge: self.clone(),
            spec,
        }
    }

    /// Look up a declared command.
    pub fn command(&self, name: &str) -> Result<Command, BridgeError> {
        self.inner
            .commands
            .get(name)
            .cloned()
            .map(|spec| self.command_from_spec(spec))
            .ok_or_else(|| BridgeError::UnknownCommand {
                name: name.to_string(),
            })
    }

    /// Declared commands, sorted by name.
    pub fn commands(&self) -> impl Iterator<Item = &CommandSpec> {
        self.inner.commands.values()
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub async fn process_audio(&self, take: &TakeMetadata) -> Result<Completion, BridgeError> {
        self.command(PROCESS_AUDIO)?
            .invoke(serde_json::to_value(take)?)
            .await
    }

    pub async fn generate_pdf(&self, request: &PdfRequest) -> Result<Completion, BridgeError> {
        self.command(GENERATE_PDF)?
            .invoke(serde_json::to_value(request)?)
            .await
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    /// Stop the worker and disable respawn.
    pub async fn shutdown(&self) {
        self.inner.supervisor.shutdown().await;
    }
}

/// A ready-to-call worker operation.
#[derive(Clone)]
pub struct Command {
    bridge: Bridge,
    spec: CommandSpec,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn timeout(&self) -> Duration {
        self.spec.timeout.unwrap_or(self.bridge.inner.default_timeout)
    }

    /// Run the command with `payload` on the live worker.
    ///
    /// The payload is validated before a worker is started. A
    /// [`BridgeError::WorkerUnavailable`] result retires the worker that
    /// produced it so the next call gets a fresh one; the call itself is not
    /// retried.
    pub async fn invoke(
        &self,
        payload: impl Into<Option<Value>>,
    ) -> Result<Completion, BridgeError> {
        let inner = &self.bridge.inner;
        let request = Request::new(
            self.spec.name.clone(),
            payload.into(),
            self.spec.matcher.clone(),
            self.timeout(),
        )
        .prepare()?;

        let mut slot = inner.dispatcher.lock().await;
        let handle = inner.supervisor.ensure_running().await?;
        debug!(command = %self.spec.name, worker_id = %handle.id(), "Dispatching command");

        let result = slot.dispatch(&handle, &request).await;
        if let Err(BridgeError::WorkerUnavailable { reason }) = &result {
            info!(command = %self.spec.name, reason = %reason, "Retiring unavailable worker");
            inner.supervisor.invalidate(&handle).await;
        }
        result
    }
}
