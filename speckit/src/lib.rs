//! Spec-driven feature tracking and agent workflow orchestration.
//!
//! Features live as tracker issues (`Feature <N>: <Name>`) with user-story
//! sub-issues, and as per-branch document trees under `specs/`. The crate
//! derives each feature's lifecycle status from those two sources, keeps one
//! agent session per branch, and runs agent workflows through a pure reducer.
//!
//! - **[`core`]**: Pure, deterministic logic (grammar, status derivation, graph
//!   correlation, the workflow reducer). No I/O.
//! - **[`io`]**: Side-effecting collaborators (config, documents, session
//!   persistence, tracker and agent processes). Isolated behind traits so tests
//!   can substitute doubles.
//!
//! Orchestration modules ([`features`], [`publish`], [`executor`], [`pipeline`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod features;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod publish;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
