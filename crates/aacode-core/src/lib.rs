//! The ReAct Orchestration Core: an iteration driver, tool registry,
//! context/session stores, safety guard, compactor, response parser, and
//! structured logging for an autonomous coding-assistant runtime.

pub mod compactor;
pub mod config;
pub mod context_store;
pub mod driver;
pub mod error;
pub mod event_log;
pub mod response_parser;
pub mod safety;
pub mod session_store;
pub mod todo;
pub mod tool_registry;
pub mod types;
pub mod util;

pub use config::AacodeConfig;
pub use driver::{Driver, DriverResult, Status};
pub use error::{AacodeErr, Result};
