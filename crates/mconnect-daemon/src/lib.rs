pub mod arbiter;
pub mod config;
pub mod errors;
pub mod guardrails;
pub mod hub;
pub mod ipc;
pub mod logging;
pub mod pairing;
pub mod pid;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod server;
pub mod session;
pub mod store;

// Primary re-exports
pub use config::{DaemonConfig, load_daemon_config};
pub use errors::DaemonError;
pub use server::run_server;
