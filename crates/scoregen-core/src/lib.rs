//! `ScoreGen` Core Library
//!
//! Shared functionality for the `ScoreGen` bridge components:
//! - Wire protocol for the native worker (request lines, completion frames)
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
