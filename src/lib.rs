//! Library crate for scan-relay-rs: chat-driven masscan runs with live
//! progress, timeouts and cooperative cancellation.
pub mod access;
pub mod commands;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod ports;
pub mod progress;
pub mod server;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod targets;
pub mod transport;
pub mod types;
