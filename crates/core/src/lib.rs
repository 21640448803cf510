//! Shared record types and environment helpers for the sensorflow pipeline.

pub mod config;
pub mod error;
pub mod record;

pub use error::*;
pub use record::*;
