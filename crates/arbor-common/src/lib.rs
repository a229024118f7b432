//! ArborDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all ArborDB components.

pub mod config;
pub mod datum;
pub mod error;
pub mod position;

pub use config::{IndexConfig, DEFAULT_DEGREE};
pub use datum::Datum;
pub use error::{ArborError, Result};
pub use position::Position;
