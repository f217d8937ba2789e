//! Parsing of the command string a git client sends in an SSH `exec`
//! request, e.g. `git-upload-pack '/org/repo.git'`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ParseError;

static GIT_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(git[- ]upload-pack|git[- ]upload-archive|git[- ]receive-pack) '(.*)'$")
        .expect("git command grammar is a valid regex")
});

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The git transport services reachable over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitVerb {
    UploadPack,
    ReceivePack,
    UploadArchive,
}

impl GitVerb {
    /// The `git` subcommand implementing this service.
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
            Self::UploadArchive => "upload-archive",
        }
    }

    /// Whether the service modifies the repository.
    pub fn is_write(self) -> bool {
        matches!(self, Self::ReceivePack)
    }

    fn from_subcommand(s: &str) -> Option<Self> {
        match s {
            "upload-pack" => Some(Self::UploadPack),
            "receive-pack" => Some(Self::ReceivePack),
            "upload-archive" => Some(Self::UploadArchive),
            _ => None,
        }
    }
}

impl fmt::Display for GitVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}", self.subcommand())
    }
}

/// A parsed git-over-SSH command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    pub verb: GitVerb,
    /// The verb exactly as the client spelled it (`git-upload-pack` or
    /// `git upload-pack`).
    pub command: String,
    /// Repository path relative to the repository root, without a leading
    /// `/` or trailing `.git`.
    pub repo: String,
    pub original: String,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a command such as:
///
/// ```text
/// git-upload-pack 'org/repo.git'
/// git receive-pack '/org/repo'
/// ```
pub fn parse_git_command(cmd: &str) -> Result<GitCommand, ParseError> {
    let caps = GIT_COMMAND
        .captures(cmd)
        .ok_or_else(|| ParseError::InvalidCommand(cmd.to_string()))?;

    let command = &caps[1];
    // Both spellings put a single separator after "git".
    let verb = GitVerb::from_subcommand(&command[4..])
        .ok_or_else(|| ParseError::InvalidCommand(cmd.to_string()))?;

    Ok(GitCommand {
        verb,
        command: command.to_string(),
        repo: normalize_repo(&caps[2]).to_string(),
        original: cmd.to_string(),
    })
}

/// Strip one leading `/` and a trailing `.git`.
pub fn normalize_repo(path: &str) -> &str {
    let path = path.strip_prefix('/').unwrap_or(path);
    path.strip_suffix(".git").unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
