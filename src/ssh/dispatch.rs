//! Interpretation of the channel requests a git client sends.
//!
//! [`ChannelState`] holds the request semantics of one session channel and
//! answers through a [`ChannelReply`]; [`super::session`] wires it to russh
//! callbacks.

use tracing::{debug, error, info, warn};

use super::bridge::{client_channel, ClientFeed, ClientInput, ProcessLink, SpawnSpec};
use crate::auth::SessionContext;
use crate::config::Config;
use crate::error::{BannerError, ExecError, ProtocolError};
use crate::git::{parse_git_command, GitCommand};
use crate::AppState;

/// Written on the channel when an `exec` payload is not a git command.
pub const INVALID_COMMAND: &[u8] = b"Invalid command.\r\n";

/// Environment variable carrying the authenticated identity id into git and
/// its hooks.
pub const KEY_ENV: &str = "GITGATE_KEY";

// ---------------------------------------------------------------------------
// env
// ---------------------------------------------------------------------------

/// Validate an `env` request.  Leading control bytes are stripped from the
/// name; an empty name or one containing `=` is rejected.
pub fn parse_env(name: &str, value: &str) -> Result<(String, String), ProtocolError> {
    let key = name.trim_start_matches(|c: char| c.is_control());
    if key.is_empty() || key.contains('=') {
        return Err(ProtocolError::InvalidEnv(format!("{name}={value}")));
    }
    Ok((key.to_string(), value.to_string()))
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

/// Strip transport artifacts in front of an `exec` command: leading control
/// bytes, parentheses and single quotes, then anything before the first
/// `git`.  The tail is left alone; the grammar is anchored at the closing
/// quote.
pub fn clean_exec_payload(raw: &str) -> &str {
    let cmd = raw.trim_start_matches(|c: char| c.is_control() || matches!(c, '(' | ')' | '\''));
    match cmd.find("git") {
        Some(i) => &cmd[i..],
        None => cmd,
    }
}

/// Parse, authorise, and prepare the subprocess for an `exec` request.
///
/// Runs in this order and stops at the first failure: parse, authorization,
/// repository auto-creation.  Nothing is spawned here.
pub async fn prepare_exec(
    state: &AppState,
    ctx: &SessionContext,
    payload: &str,
    env: &[(String, String)],
) -> Result<(GitCommand, SpawnSpec), ExecError> {
    let command = parse_git_command(clean_exec_payload(payload))?;

    state
        .capabilities
        .authorizer
        .authorize(&command, ctx)
        .await?;

    if !state.repos.exists(&command.repo).await {
        if state.config.auto_create {
            state
                .repos
                .init(&command.repo)
                .await
                .map_err(|e| ExecError::Repository {
                    path: state.repos.repo_path(&command.repo),
                    message: format!("{e:#}"),
                })?;
        } else {
            debug!(repo = %command.repo, "repository does not exist; leaving it to git");
        }
    }

    let spec = spawn_spec(state, &command, ctx, env);
    info!(
        verb = %command.verb,
        repo = %command.repo,
        identity = %ctx.identity.id,
        "exec authorised"
    );
    Ok((command, spec))
}

/// `<git> <subcommand> <repo>` run from the repository root.  The identity
/// variable is appended last so a client `env` request cannot override it.
fn spawn_spec(
    state: &AppState,
    command: &GitCommand,
    ctx: &SessionContext,
    env: &[(String, String)],
) -> SpawnSpec {
    let mut vars = env.to_vec();
    vars.retain(|(k, _)| k != KEY_ENV);
    vars.push((KEY_ENV.to_string(), ctx.identity.id.clone()));

    SpawnSpec {
        program: state.config.git_path.clone(),
        args: vec![
            command.verb.subcommand().to_string(),
            command.repo.clone(),
        ],
        cwd: state.repos.root().to_path_buf(),
        env: vars,
    }
}

// ---------------------------------------------------------------------------
// shell
// ---------------------------------------------------------------------------

/// Banner for an interactive login attempt.
pub fn shell_banner(state: &AppState, ctx: &SessionContext) -> Result<Vec<u8>, BannerError> {
    state.capabilities.banner.render(&ctx.identity)
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// The synchronous answers a channel request can produce.
pub trait ChannelReply {
    fn data(&mut self, bytes: &[u8]);
    /// Acknowledge the pending request.
    fn success(&mut self);
    fn exit_status(&mut self, status: u32);
    /// EOF followed by close.
    fn close(&mut self);
}

/// Where a session channel is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    /// Accepting `env`, `exec`, and `shell`.
    #[default]
    Open,
    /// A subprocess is bridged onto the channel.
    Executing,
    /// Answered and closing.
    Closed,
}

/// An acknowledged `exec` whose bridge still has to be run.
#[derive(Debug)]
pub struct StartedExec {
    pub command: GitCommand,
    pub link: ProcessLink,
    pub input: ClientInput,
}

/// What one session channel has accumulated so far.
///
/// A channel runs at most one `exec` or `shell`; once it has left
/// [`Phase::Open`] every further `env`, `exec`, or `shell` is ignored.
#[derive(Debug, Default)]
pub struct ChannelState {
    env: Vec<(String, String)>,
    /// Feed for the running subprocess's stdin.  Dropping it closes stdin.
    stdin: Option<ClientFeed>,
    phase: Phase,
}

impl ChannelState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    fn accepts(&self, request: &'static str) -> bool {
        if self.phase == Phase::Open {
            return true;
        }
        let e = ProtocolError::AlreadyAnswered(request);
        warn!(phase = ?self.phase, error = %e, "ignoring channel request");
        false
    }

    fn close<R: ChannelReply>(&mut self, reply: &mut R) {
        self.phase = Phase::Closed;
        reply.close();
    }

    /// Record a variable for the channel's forthcoming subprocess.  Names
    /// outside `accept_env` are dropped.
    pub fn record_env(&mut self, config: &Config, name: &str, value: &str) {
        if !self.accepts("env") {
            return;
        }
        match parse_env(name, value) {
            Ok((key, value)) if config.accepts_env(&key) => {
                debug!(%key, %value, "env request accepted");
                self.env.push((key, value));
            }
            Ok((key, _)) => debug!(%key, "ignoring env variable not in accept_env"),
            Err(e) => warn!(error = %e, "ignoring env request"),
        }
    }

    /// Handle an `exec` request.
    ///
    /// A payload that is not a git command gets [`INVALID_COMMAND`]; any
    /// other failure closes the channel with no reply.  The request is
    /// acknowledged only once the subprocess has started.
    pub async fn exec<R: ChannelReply>(
        &mut self,
        state: &AppState,
        ctx: &SessionContext,
        payload: &str,
        reply: &mut R,
    ) -> Option<StartedExec> {
        if !self.accepts("exec") {
            return None;
        }

        let (command, spec) = match prepare_exec(state, ctx, payload, self.env()).await {
            Ok(prepared) => prepared,
            Err(ExecError::Parse(e)) => {
                warn!(error = %e, "rejected exec request");
                reply.data(INVALID_COMMAND);
                self.close(reply);
                return None;
            }
            Err(e) => {
                warn!(
                    user = %ctx.user,
                    identity = %ctx.identity.id,
                    error = %e,
                    "exec request aborted"
                );
                self.close(reply);
                return None;
            }
        };

        let link = match ProcessLink::spawn(&spec) {
            Ok(link) => link,
            Err(e) => {
                let e = ExecError::from(e);
                error!(program = %spec.program, error = %e, "failed to start git");
                self.close(reply);
                return None;
            }
        };
        reply.success();

        let (feed, input) = client_channel();
        self.stdin = Some(feed);
        self.phase = Phase::Executing;
        Some(StartedExec {
            command,
            link,
            input,
        })
    }

    /// Interactive logins get the banner and nothing else.
    pub fn shell<R: ChannelReply>(&mut self, state: &AppState, ctx: &SessionContext, reply: &mut R) {
        if !self.accepts("shell") {
            return;
        }
        match shell_banner(state, ctx) {
            Ok(banner) => reply.data(&banner),
            Err(e) => error!(identity = %ctx.identity.id, error = %e, "failed to render banner"),
        }
        reply.exit_status(0);
        self.close(reply);
    }

    /// Forward client data to the running subprocess.  Waits while the
    /// stdin queue is full.
    pub async fn data(&self, bytes: &[u8]) {
        if let Some(ref tx) = self.stdin {
            if tx.send(bytes.to_vec()).await.is_err() {
                debug!("subprocess stdin already closed; dropping client data");
            }
        }
    }

    /// The client finished sending: close the subprocess's stdin.
    pub fn eof(&mut self) {
        self.stdin.take();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
