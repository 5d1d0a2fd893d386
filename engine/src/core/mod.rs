//! Core types and error handling shared by every subsystem.

pub mod error;
pub mod types;

pub use error::{CdsError, CdsResult};
pub use types::*;
