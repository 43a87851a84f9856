//! Development run orchestrator.
//!
//! A development run takes a project's approved plans and drives them
//! through an ordered list of iterations. Each iteration runs the spec, test
//! and code agents, checks the result with quality gates, and releases it as
//! a squash-merged pull request; after the last iteration the site is
//! deployed. Failures retry within a small attempt budget and then park the
//! run at a checkpoint for an operator.
//!
//! - **[`core`]**: Pure, deterministic logic (status machines, retry policy,
//!   path safety, masking, failure summaries). No I/O.
//! - **[`io`]**: Side effects behind seams: the store, event log, sandbox,
//!   processes, git, gates and deploy hosting.
//! - **[`agents`]** and **[`release`]**: agent invocation and the iteration
//!   release pipeline.
//! - **[`orchestrator`]**: the run loop and operator controls.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod release;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
