//! Sluice Core
//!
//! Core domain types, port traits, and error handling for Sluice.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod clock;
pub mod error;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
