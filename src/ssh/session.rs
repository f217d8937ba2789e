//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler runs the public-key handshake, keeps a [`ChannelState`] per open
//! session channel, and hands acknowledged `exec` requests to a bridge task
//! so the connection keeps processing traffic while git runs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tracing::{debug, info, warn};

use super::bridge::ChannelHandle;
use super::dispatch::{ChannelReply, ChannelState, StartedExec};
use crate::auth::{self, ConnectionMeta, Identity, SessionContext};
use crate::error::ProtocolError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    /// Set exactly once by a successful handshake.
    context: Option<SessionContext>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            context: None,
            channels: HashMap::new(),
        }
    }

    /// Every channel type but `session` is refused.
    fn reject_channel(&self, kind: &str) -> bool {
        let e = ProtocolError::UnknownChannelType(kind.to_string());
        warn!(peer = ?self.peer_addr, error = %e, "channel rejected");
        false
    }

    /// Run the bridge for an acknowledged exec on its own task.
    fn spawn_bridge(&self, started: StartedExec, sink: ChannelHandle) {
        let propagate = self.state.config.propagate_exit_status;
        let guard = self.state.inflight.enter();
        let StartedExec {
            command,
            link,
            input,
        } = started;
        let mut sink = sink;
        tokio::spawn(async move {
            let _guard = guard;
            match link.run(input, &mut sink, propagate).await {
                Ok(code) => info!(verb = %command.verb, repo = %command.repo, code, "git finished"),
                Err(e) => warn!(
                    verb = %command.verb,
                    repo = %command.repo,
                    error = %e,
                    "git finished with error"
                ),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Channel replies
// ---------------------------------------------------------------------------

/// Replies written straight into the russh session.
struct SessionReply<'a> {
    session: &'a mut Session,
    id: ChannelId,
}

impl ChannelReply for SessionReply<'_> {
    fn data(&mut self, bytes: &[u8]) {
        self.session.data(self.id, CryptoVec::from_slice(bytes));
    }

    fn success(&mut self) {
        self.session.channel_success(self.id);
    }

    fn exit_status(&mut self, status: u32) {
        self.session.exit_status_request(self.id, status);
    }

    fn close(&mut self) {
        self.session.eof(self.id);
        self.session.close(self.id);
    }
}

/// `<type> <base64>`, the form an `authorized_keys` line lists a key in.
fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Only accepted when authentication is disabled: every client gets an
    /// anonymous identity.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.state.config.auth {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }
        info!(peer = ?self.peer_addr, user = %user, "unauthenticated SSH login");
        self.context = Some(SessionContext {
            identity: Identity::anonymous(),
            user: user.to_string(),
        });
        Ok(Auth::Accept)
    }

    /// Authenticate a client by public key through the pre-login check and
    /// the key lookup.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let meta = ConnectionMeta {
            user: user.to_string(),
            peer_addr: self.peer_addr,
        };

        match auth::authenticate(&self.state.capabilities, &meta, &authorized_key_line(key)).await
        {
            Ok(ctx) => {
                info!(
                    peer = ?self.peer_addr,
                    user = %user,
                    identity = %ctx.identity.id,
                    name = %ctx.identity.name,
                    "SSH key accepted"
                );
                self.context = Some(ctx);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(peer = ?self.peer_addr, user = %user, error = %e, "SSH handshake rejected");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("direct-tcpip"))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("x11"))
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(peer = ?self.peer_addr, %address, port = *port, "refusing tcpip-forward request");
        Ok(false)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` here.
    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.entry(channel_id).or_default().record_env(
            &self.state.config,
            variable_name,
            variable_value,
        );
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = String::from_utf8_lossy(data).into_owned();
        info!(peer = ?self.peer_addr, command = %payload.escape_debug(), "SSH exec request");

        let mut reply = SessionReply {
            session: &mut *session,
            id: channel_id,
        };
        let Some(ctx) = self.context.as_ref() else {
            warn!(peer = ?self.peer_addr, error = %ProtocolError::NoSession, "exec rejected");
            reply.close();
            return Ok(());
        };
        let channel = self.channels.entry(channel_id).or_default();
        let started = channel.exec(&self.state, ctx, &payload, &mut reply).await;

        if let Some(started) = started {
            let sink = ChannelHandle::new(session.handle(), channel_id);
            self.spawn_bridge(started, sink);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut reply = SessionReply {
            session: &mut *session,
            id: channel_id,
        };
        match self.context.as_ref() {
            Some(ctx) => self
                .channels
                .entry(channel_id)
                .or_default()
                .shell(&self.state, ctx, &mut reply),
            None => {
                warn!(peer = ?self.peer_addr, error = %ProtocolError::NoSession, "shell rejected");
                reply.close();
            }
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        _channel_id: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(%term, "ignoring pty-req request");
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        _channel_id: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(subsystem = %name, "ignoring subsystem request");
        Ok(())
    }

    /// Waits while the subprocess's stdin queue is full, which stops the
    /// connection from reading further client data.
    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(channel) = self.channels.get(&channel_id) {
            channel.data(data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.eof();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(channel) = self.channels.remove(&channel_id) {
            debug!(phase = ?channel.phase(), "channel closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use russh_keys::key::KeyPair;

    use super::*;
    use crate::config::Config;

    fn session(yaml: &str) -> SshSession {
        let config: Config =
            serde_yaml::from_str(&format!("key_dir: /k\nrepo_dir: /r\n{yaml}")).unwrap();
        SshSession::new(Arc::new(AppState::new(config)), None)
    }

    fn client_key() -> PublicKey {
        KeyPair::generate_ed25519().clone_public_key().unwrap()
    }

    fn keyed_session(dir: &std::path::Path, key: &PublicKey) -> SshSession {
        let path = dir.join("authorized_keys");
        std::fs::write(&path, format!("{} alice@laptop\n", authorized_key_line(key))).unwrap();
        session(&format!(
            "auth: true\ngit_user: git\nauthorized_keys: {}\n",
            path.display()
        ))
    }

    #[tokio::test]
    async fn auth_none_rejected_when_auth_enabled() {
        let mut handler = session("auth: true\n");
        let auth = handler.auth_none("git").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(handler.context.is_none());
    }

    #[tokio::test]
    async fn auth_none_gives_anonymous_identity_when_auth_disabled() {
        let mut handler = session("auth: false\n");
        let auth = handler.auth_none("whoever").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(
            handler.context,
            Some(SessionContext {
                identity: Identity::anonymous(),
                user: "whoever".into(),
            })
        );
    }

    #[tokio::test]
    async fn listed_key_binds_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let key = client_key();
        let mut handler = keyed_session(tmp.path(), &key);

        let auth = handler.auth_publickey("git", &key).await.unwrap();

        assert!(matches!(auth, Auth::Accept));
        let ctx = handler.context.unwrap();
        assert_eq!(ctx.user, "git");
        assert_eq!(ctx.identity.name, "alice@laptop");
        assert!(ctx.identity.id.starts_with("SHA256:"));
    }

    #[tokio::test]
    async fn wrong_user_or_unknown_key_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let key = client_key();

        let mut handler = keyed_session(tmp.path(), &key);
        let auth = handler.auth_publickey("root", &key).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(handler.context.is_none());

        let mut handler = keyed_session(tmp.path(), &key);
        let auth = handler.auth_publickey("git", &client_key()).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(handler.context.is_none());
    }

    #[test]
    fn non_session_channels_are_rejected() {
        let handler = session("auth: false\n");
        assert!(!handler.reject_channel("direct-tcpip"));
        assert!(!handler.reject_channel("x11"));
    }
}
