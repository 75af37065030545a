//! netrecon-rs: bounded-concurrency network reconnaissance with real-time
//! event streaming to subscribed WebSocket clients.
pub mod error;
pub mod heuristics;
pub mod ports;
pub mod prober;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod targets;
pub mod types;
