//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod boundary;
pub mod diagnostics;
pub mod files;
pub mod mask;
pub mod path;
pub mod retry;
pub mod transitions;
pub mod types;
