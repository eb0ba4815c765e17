//! Core runtime infrastructure
//!
//! Configuration, error taxonomy and logging shared by every component.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{CliArgs, Command, Config};
pub use error::{ErrorSummary, Result, TingError};
pub use logging::Logger;
