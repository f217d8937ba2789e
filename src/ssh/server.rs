//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tracing::{info, warn};

use super::session::SshSession;
use crate::config::Config;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        warn!(error = %error, "SSH session terminated with error");
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the Ed25519 host key from `key_dir`, generating and persisting one on
/// first start.  The public half is written next to it as `<name>.pub`.
pub fn load_or_generate_host_key(config: &Config) -> Result<KeyPair> {
    let path = config.host_key_path();
    if path.exists() {
        let key = russh_keys::load_secret_key(&path, None)
            .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    std::fs::create_dir_all(&config.key_dir).with_context(|| {
        format!("failed to create key directory: {}", config.key_dir.display())
    })?;

    let key = KeyPair::generate_ed25519();
    write_host_key(&path, &key)?;
    info!(path = %path.display(), "generated new SSH host key");
    Ok(key)
}

fn write_host_key(path: &Path, key: &KeyPair) -> Result<()> {
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(key, &mut pem).context("failed to encode SSH host key")?;
    write_file(path, &pem, 0o600)?;

    let public = key
        .clone_public_key()
        .context("failed to derive SSH host public key")?;
    let line = format!("{} {}\n", public.name(), public.public_key_base64());
    write_file(&public_key_path(path), line.as_bytes(), 0o644)
}

fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  This function runs until the server is shut down
/// or an unrecoverable error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: SocketAddr = state
        .config
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", state.config.listen))?;

    // -- Build russh server config ----------------------------------------

    let host_key = load_or_generate_host_key(&state.config)?;
    let methods = if state.config.auth {
        MethodSet::PUBLICKEY
    } else {
        MethodSet::NONE
    };

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods,
        server_id: russh::SshId::Standard(format!(
            "SSH-2.0-gitgate_{}",
            env!("CARGO_PKG_VERSION")
        )),
        inactivity_timeout: Some(Duration::from_secs(state.config.inactivity_timeout)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    });

    // -- Start serving ----------------------------------------------------

    info!(address = %listen_addr, auth = state.config.auth, "starting SSH server");

    let mut ssh_server = SshServer::new(state);
    ssh_server
        .run_on_address(config, listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
