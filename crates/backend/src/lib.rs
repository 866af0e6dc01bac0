pub mod core;
pub mod engine;
pub mod io;
pub mod routing;
pub mod rpc;
pub mod security;
pub mod server;

mod domain;
pub use domain::config;

pub mod dirs;
pub mod ipc;

mod daemon;
pub use daemon::{Daemon, DaemonError, RuntimeConfig};
