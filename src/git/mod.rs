//! Git command parsing and repository storage.
//!
//! Repository operations shell out to the `git` binary using
//! `tokio::process::Command`.

pub mod command;
pub mod repo;

pub use command::{parse_git_command, GitCommand};
