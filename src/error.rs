//! Typed failures of the session command pipeline.
//!
//! Each stage of an SSH session fails in its own way and is surfaced
//! differently: parse failures are the only ones the client ever sees,
//! handshake failures reject the connection, and everything else is scoped to
//! a single channel and only reaches the server log.  Startup and
//! configuration plumbing keeps using `anyhow`.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// The `exec` payload did not match the git-over-SSH command grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),
}

/// Handshake-stage failure.  Any of these rejects the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unrecognised or invalid user {0:?}")]
    IncorrectUser(String),

    #[error("public key lookup failed: {0}")]
    Lookup(String),

    #[error("lookup returned no identity")]
    NoIdentity,
}

/// Policy denied a specific git operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("{verb} on {repo:?} denied: {reason}")]
    Denied {
        verb: &'static str,
        repo: String,
        reason: String,
    },
}

/// Subprocess setup, relay, or termination failure.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child {0} was not captured")]
    MissingPipe(&'static str),

    #[error("failed to relay child {0} to the channel")]
    Relay(&'static str),

    #[error("failed waiting on child: {0}")]
    Wait(#[source] std::io::Error),

    #[error("child exited unsuccessfully: {0}")]
    Exit(ExitStatus),
}

/// Malformed or unsupported channel traffic.  Logged and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown channel type {0:?}")]
    UnknownChannelType(String),

    #[error("invalid env request: {0:?}")]
    InvalidEnv(String),

    #[error("channel request before the handshake completed")]
    NoSession,

    #[error("{0} request on a channel that was already answered")]
    AlreadyAnswered(&'static str),
}

/// Banner template could not be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BannerError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("unknown banner field {0:?}")]
    UnknownField(String),
}

/// Everything that can abort a single `exec` request before its subprocess
/// is bridged.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("failed to initialise repository {path}: {message}")]
    Repository { path: PathBuf, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}
