pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod state;

// Execution engine
pub mod orchestration;
pub mod workflow;

pub use error::{Error, Result};
