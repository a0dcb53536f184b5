//! Common utilities and types shared across VIP manager components.

pub mod command;
pub mod error;
pub mod logging;

pub use command::{CommandRunner, SystemCommand};
pub use error::{Error, Result};
