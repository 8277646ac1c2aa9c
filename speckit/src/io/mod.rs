//! Side-effecting collaborators: filesystem, subprocesses, the tracker CLI and
//! the agent CLI.

pub mod agent;
pub mod config;
pub mod documents;
pub mod init;
pub mod process;
pub mod session_store;
pub mod tracker;
