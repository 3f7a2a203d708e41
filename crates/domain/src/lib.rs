//! Shared domain types for the conversation-state core: data model,
//! error taxonomy, configuration, structured trace events and logging.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod trace;

pub use error::{Constraint, Error, Result, StorageError};
