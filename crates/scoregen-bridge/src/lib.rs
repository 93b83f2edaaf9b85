//! `ScoreGen` Bridge Library
//!
//! Runs the native `ScoreGen` worker as a child process and exposes its
//! operations as awaitable calls:
//! - Process supervision with respawn after unexpected exits
//! - Serialized request dispatch with sentinel or framed completion
//! - Named command facade (`processAudio`, `generatePDF`, user-defined)

pub mod commands;
pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod supervisor;
pub mod worker;

pub use commands::{Bridge, Command, CommandSpec, PdfRequest, TakeMetadata};
pub use dispatcher::{Completion, Dispatcher, Request};
pub use error::BridgeError;
pub use matcher::Matcher;
pub use supervisor::{RespawnPolicy, Supervisor, SupervisorStats};
pub use worker::{WorkerHandle, WorkerStatus};
