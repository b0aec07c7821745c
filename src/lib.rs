pub mod acquire;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetch;
pub mod host;
pub mod logging;
pub mod merge;
pub mod ports;
pub mod process;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod settings;
pub mod shell;
pub mod store;
pub mod supervisor;

pub use error::{TunupError, TunupResult};
