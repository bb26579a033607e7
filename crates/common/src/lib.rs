//! Shared types for the key pool workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
