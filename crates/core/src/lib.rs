// Quell Core - Domain Logic, Ports & Use Cases
// NO infrastructure dependencies: storage and system probing live behind ports

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
