//! SSH front end.
//!
//! Accepts SSH connections from git clients, authenticates them by public
//! key, and runs `git-upload-pack`, `git-receive-pack`, or
//! `git-upload-archive` against the local repository root with the channel
//! bridged to the subprocess's standard streams.

pub mod bridge;
pub mod dispatch;
pub mod server;
pub mod session;

pub use server::start_ssh_server;
