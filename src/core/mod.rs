//! Core types and utilities shared across the engine.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
