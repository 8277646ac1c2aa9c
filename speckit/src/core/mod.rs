//! Deterministic, pure logic shared by the tracker and the workflow engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod grammar;
pub mod graph;
pub mod slug;
pub mod status;
pub mod tasks;
pub mod types;
pub mod workflow;
