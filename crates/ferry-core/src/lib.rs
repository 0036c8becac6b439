//! Core types for ferry.
//!
//! This crate provides the identifiers, configuration and error taxonomy
//! shared by the ferry transaction engine and its front-ends.

mod config;
mod error;
mod ids;

pub use config::{EngineConfig, EngineConfigBuilder, EngineConfigBuilderError};
pub use error::{EngineError, ErrorKind, FsError};
pub use ids::{JobId, TransactionId};
