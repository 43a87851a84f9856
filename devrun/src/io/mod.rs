//! Side-effecting adapters: filesystem, subprocesses, persistence.

pub mod config;
pub mod deploy;
pub mod event_log;
pub mod gates;
pub mod git;
pub mod process;
pub mod registry;
pub mod scan;
pub mod store;
pub mod workspace;
