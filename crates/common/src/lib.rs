//! Common types shared by the chat gateway crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
