//! Request handlers organized by resource.

pub mod health;
pub mod pipelines;
pub mod runs;
