//! rover-alert library crate.
//!
//! Alert delivery for a remote surveillance rover: detection and health
//! events are gated per type, rendered through templates, queued, and
//! delivered over email or a chat bot with bounded retries.

pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod utils;

pub use error::{Error, Result};
